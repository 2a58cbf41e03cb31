//! XenStore socket client
//!
//! [`ConfigStore`] over the xenstored UNIX socket. Frames are a 16-byte
//! header (`type`, `req_id`, `tx_id`, `len`, all host-endian u32) followed
//! by `len` payload bytes; string arguments are NUL-separated. Watch events
//! arrive unsolicited on the same socket and are queued while a request is
//! waiting for its reply.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use blktap_core::{Error, Result};
use tracing::{debug, trace};

use crate::store::{ConfigStore, StoreTx, WatchEvent};

/// Default xenstored socket locations, tried in order
pub const SOCKET_PATHS: [&str; 2] =
    ["/run/xenstored/socket", "/var/run/xenstored/socket"];

const XS_DIRECTORY: u32 = 1;
const XS_READ: u32 = 2;
const XS_WATCH: u32 = 4;
const XS_UNWATCH: u32 = 5;
const XS_TRANSACTION_START: u32 = 6;
const XS_TRANSACTION_END: u32 = 7;
const XS_WRITE: u32 = 11;
const XS_RM: u32 = 13;
const XS_WATCH_EVENT: u32 = 15;
const XS_ERROR: u32 = 16;

/// Transaction retries when xenstored reports a conflict
const TX_RETRIES: u32 = 8;

struct XsConn {
    sock: UnixStream,
    events: VecDeque<WatchEvent>,
    next_req: u32,
}

pub struct XsSocketStore {
    conn: Mutex<XsConn>,
}

impl XsSocketStore {
    /// Connect to xenstored at one of the conventional socket paths
    pub fn connect_system() -> Result<Self> {
        for path in SOCKET_PATHS {
            if Path::new(path).exists() {
                return Self::connect(Path::new(path));
            }
        }
        Err(Error::not_found("xenstored socket"))
    }

    pub fn connect(path: &Path) -> Result<Self> {
        let sock = UnixStream::connect(path)?;
        Ok(Self {
            conn: Mutex::new(XsConn {
                sock,
                events: VecDeque::new(),
                next_req: 1,
            }),
        })
    }
}

fn encode_frame(kind: u32, req_id: u32, tx_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&kind.to_ne_bytes());
    out.extend_from_slice(&req_id.to_ne_bytes());
    out.extend_from_slice(&tx_id.to_ne_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    out.extend_from_slice(payload);
    out
}

fn read_exact(sock: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
    let mut at = 0;
    while at < buf.len() {
        match sock.read(&mut buf[at..]) {
            Ok(0) => return Err(Error::protocol("xenstored closed the socket")),
            Ok(n) => at += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Map a xenstored error name to the taxonomy
fn store_error(name: &str) -> Error {
    match name {
        "ENOENT" => Error::not_found("store key"),
        "EAGAIN" => Error::busy("transaction conflict"),
        "EINVAL" => Error::invalid_arg("store request"),
        "EACCES" | "EPERM" => {
            Error::Io(std::io::Error::from_raw_os_error(libc::EACCES))
        }
        other => Error::protocol(format!("xenstored error {}", other)),
    }
}

impl XsConn {
    /// Read one frame: `(type, payload)`
    fn read_frame(&mut self) -> Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 16];
        read_exact(&mut self.sock, &mut header)?;
        let kind = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        let len = u32::from_ne_bytes(header[12..16].try_into().unwrap());
        if len > 4096 * 16 {
            return Err(Error::protocol("oversized xenstored frame"));
        }
        let mut payload = vec![0u8; len as usize];
        read_exact(&mut self.sock, &mut payload)?;
        Ok((kind, payload))
    }

    fn queue_event(&mut self, payload: &[u8]) {
        let mut parts = payload.split(|&b| b == 0);
        let (Some(path), Some(token)) = (parts.next(), parts.next()) else {
            return;
        };
        let (Ok(path), Ok(token)) = (
            std::str::from_utf8(path).map(str::to_string),
            std::str::from_utf8(token).map(str::to_string),
        ) else {
            return;
        };
        trace!(path, token, "watch event queued");
        self.events.push_back(WatchEvent { path, token });
    }

    /// Send a request and wait for its reply, queueing interleaved events
    fn request(&mut self, kind: u32, tx_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let req_id = self.next_req;
        self.next_req = self.next_req.wrapping_add(1);
        self.sock
            .write_all(&encode_frame(kind, req_id, tx_id, payload))?;

        loop {
            let (reply_kind, reply) = self.read_frame()?;
            if reply_kind == XS_WATCH_EVENT {
                self.queue_event(&reply);
                continue;
            }
            if reply_kind == XS_ERROR {
                let name = String::from_utf8_lossy(&reply);
                let name = name.trim_end_matches('\0');
                debug!(kind, error = name, "xenstored error reply");
                return Err(store_error(name));
            }
            if reply_kind != kind {
                return Err(Error::protocol(format!(
                    "xenstored answered {} to request {}",
                    reply_kind, kind
                )));
            }
            return Ok(reply);
        }
    }

    fn read_key(&mut self, tx_id: u32, path: &str) -> Result<Option<String>> {
        match self.request(XS_READ, tx_id, &path_arg(path)) {
            Ok(value) => {
                let value = String::from_utf8(value)
                    .map_err(|_| Error::protocol("non-UTF-8 store value"))?;
                if value.contains('\0') {
                    return Err(Error::protocol("store value contains NUL"));
                }
                Ok(Some(value))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_key(&mut self, tx_id: u32, path: &str, value: &str) -> Result<()> {
        let mut payload = path_arg(path);
        payload.extend_from_slice(value.as_bytes());
        self.request(XS_WRITE, tx_id, &payload)?;
        Ok(())
    }

    fn exists_key(&mut self, tx_id: u32, path: &str) -> Result<bool> {
        match self.request(XS_DIRECTORY, tx_id, &path_arg(path)) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// A path argument: the string plus its terminating NUL
fn path_arg(path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len() + 1);
    out.extend_from_slice(path.as_bytes());
    out.push(0);
    out
}

impl ConfigStore for XsSocketStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        self.conn.lock().unwrap().read_key(0, path)
    }

    fn write(&self, path: &str, value: &str) -> Result<()> {
        if value.contains('\0') {
            return Err(Error::invalid_arg("embedded NUL in store value"));
        }
        self.conn.lock().unwrap().write_key(0, path, value)
    }

    fn rm(&self, path: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        match conn.request(XS_RM, 0, &path_arg(path)) {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.conn.lock().unwrap().exists_key(0, path)
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().unwrap();
        let reply = match conn.request(XS_DIRECTORY, 0, &path_arg(path)) {
            Ok(reply) => reply,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(reply
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .filter_map(|s| std::str::from_utf8(s).ok())
            .map(str::to_string)
            .collect())
    }

    fn watch(&self, path: &str, token: &str) -> Result<()> {
        let mut payload = path_arg(path);
        payload.extend_from_slice(&path_arg(token));
        self.conn.lock().unwrap().request(XS_WATCH, 0, &payload)?;
        Ok(())
    }

    fn unwatch(&self, path: &str, token: &str) -> Result<()> {
        let mut payload = path_arg(path);
        payload.extend_from_slice(&path_arg(token));
        let mut conn = self.conn.lock().unwrap();
        match conn.request(XS_UNWATCH, 0, &payload) {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn next_event(&self, timeout: Duration) -> Result<Option<WatchEvent>> {
        let mut conn = self.conn.lock().unwrap();
        if let Some(event) = conn.events.pop_front() {
            return Ok(Some(event));
        }

        let mut fds = libc::pollfd {
            fd: conn.sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut fds, 1, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(Error::Io(err));
        }
        if rc == 0 {
            return Ok(None);
        }

        let (kind, payload) = conn.read_frame()?;
        if kind != XS_WATCH_EVENT {
            return Err(Error::protocol(format!(
                "unsolicited xenstored frame {}",
                kind
            )));
        }
        conn.queue_event(&payload);
        Ok(conn.events.pop_front())
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        for _ in 0..TX_RETRIES {
            let start = conn.request(XS_TRANSACTION_START, 0, &[0])?;
            let tx_id: u32 = std::str::from_utf8(&start)
                .ok()
                .map(|s| s.trim_end_matches('\0'))
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::protocol("bad transaction id"))?;

            let mut tx = XsTx {
                conn: &mut *conn,
                tx_id,
            };
            match f(&mut tx) {
                Ok(()) => match conn.request(XS_TRANSACTION_END, tx_id, b"T\0") {
                    Ok(_) => return Ok(()),
                    Err(ref err) if err.is_busy() => continue,
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    let _ = conn.request(XS_TRANSACTION_END, tx_id, b"F\0");
                    return Err(err);
                }
            }
        }
        Err(Error::busy("transaction kept conflicting"))
    }
}

struct XsTx<'a> {
    conn: &'a mut XsConn,
    tx_id: u32,
}

impl StoreTx for XsTx<'_> {
    fn read(&mut self, path: &str) -> Result<Option<String>> {
        self.conn.read_key(self.tx_id, path)
    }

    fn write(&mut self, path: &str, value: &str) -> Result<()> {
        self.conn.write_key(self.tx_id, path, value)
    }

    fn exists(&mut self, path: &str) -> Result<bool> {
        self.conn.exists_key(self.tx_id, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encoding() {
        let frame = encode_frame(XS_READ, 7, 0, b"backend/vbd\0");
        assert_eq!(&frame[0..4], &XS_READ.to_ne_bytes());
        assert_eq!(&frame[4..8], &7u32.to_ne_bytes());
        assert_eq!(&frame[12..16], &12u32.to_ne_bytes());
        assert_eq!(&frame[16..], b"backend/vbd\0");
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(store_error("ENOENT"), Error::NotFound(_)));
        assert!(store_error("EAGAIN").is_busy());
        assert!(matches!(store_error("EWEIRD"), Error::Protocol(_)));
    }

    #[test]
    fn test_path_arg_nul_terminated() {
        assert_eq!(path_arg("a/b"), b"a/b\0");
    }
}
