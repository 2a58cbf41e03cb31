//! Control-socket framing
//!
//! One tapdisk listens on `<control-dir>/ctl<pid>`. Sends and receives are
//! strictly paired per socket; reads are gated on `poll` so a caller-supplied
//! deadline bounds every wait, and `EINTR` never surfaces. A timeout leaves
//! no partial frame buffered for retry; the connection is done for.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use blktap_core::{Error, Result};
use tracing::{debug, warn};

use crate::message::{Message, MessageFlags, Payload, MESSAGE_SIZE};

/// Default deadline for retried close loops, seconds
pub const COMM_RETRY_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket-file prefix inside the control directory
pub const CONTROL_SOCKET: &str = "ctl";

/// Path of the control socket of tapdisk `pid`
pub fn socket_name(control_dir: &Path, pid: i32) -> PathBuf {
    control_dir.join(format!("{}{}", CONTROL_SOCKET, pid))
}

/// Parse a tapdisk pid out of a control-socket path
pub fn socket_pid(path: &Path) -> Option<i32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CONTROL_SOCKET)?
        .parse()
        .ok()
}

/// An optional deadline; `None` waits forever
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn never() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Remaining budget in milliseconds for `poll`; -1 means unbounded
    fn poll_millis(&self) -> i32 {
        match self.0 {
            None => -1,
            Some(at) => at
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(i32::MAX as u128) as i32,
        }
    }
}

/// Connect to a control socket
pub fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound
            || e.kind() == std::io::ErrorKind::ConnectionRefused
        {
            Error::not_found(format!("no tapdisk at {}", path.display()))
        } else {
            Error::Io(e)
        }
    })
}

/// Wait until `sock` is ready for the given poll events
fn wait_ready(sock: &UnixStream, events: libc::c_short, deadline: Deadline) -> Result<()> {
    loop {
        let mut fds = libc::pollfd {
            fd: sock.as_raw_fd(),
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut fds, 1, deadline.poll_millis()) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::Io(err));
        }
        if rc == 0 {
            return Err(Error::Timeout);
        }
        return Ok(());
    }
}

/// Read exactly `buf.len()` bytes, retrying partial reads and `EINTR`
pub fn read_raw(sock: &mut UnixStream, buf: &mut [u8], deadline: Deadline) -> Result<()> {
    let mut at = 0;
    while at < buf.len() {
        wait_ready(sock, libc::POLLIN, deadline)?;
        match sock.read(&mut buf[at..]) {
            Ok(0) => {
                return Err(Error::protocol(format!(
                    "peer closed mid-frame ({}/{} bytes)",
                    at,
                    buf.len()
                )))
            }
            Ok(n) => at += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, retrying partial writes and `EINTR`
pub fn write_raw(sock: &mut UnixStream, buf: &[u8], deadline: Deadline) -> Result<()> {
    let mut at = 0;
    while at < buf.len() {
        wait_ready(sock, libc::POLLOUT, deadline)?;
        match sock.write(&buf[at..]) {
            Ok(0) => return Err(Error::protocol("peer closed mid-write")),
            Ok(n) => at += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Receive one frame
pub fn read_message(sock: &mut UnixStream, deadline: Deadline) -> Result<Message> {
    let mut frame = [0u8; MESSAGE_SIZE];
    read_raw(sock, &mut frame, deadline)?;
    let message = Message::decode(&frame)?;
    debug!(kind = message.kind.name(), cookie = message.cookie, "received");
    Ok(message)
}

/// Send one frame
pub fn write_message(
    sock: &mut UnixStream,
    message: &Message,
    deadline: Deadline,
) -> Result<()> {
    debug!(kind = message.kind.name(), cookie = message.cookie, "sending");
    write_raw(sock, &message.encode(), deadline)
}

/// Paired send and receive
pub fn send_and_receive(
    sock: &mut UnixStream,
    message: &Message,
    deadline: Deadline,
) -> Result<Message> {
    write_message(sock, message, deadline)?;
    read_message(sock, deadline)
}

/// Auxiliary payloads that follow an `OPEN` frame
#[derive(Debug, Clone, Default)]
pub struct OpenTrailers<'a> {
    /// Sent when `ADD_LOG` is set
    pub log_path: Option<&'a Path>,
    /// Sent when `OPEN_ENCRYPTED` is set: one length byte, then the key
    pub key: Option<&'a [u8]>,
    /// Sent when `RATED` is set
    pub valve_path: Option<&'a Path>,
}

/// Send a frame plus its flag-gated trailers, then receive the reply
pub fn send_and_receive_ex(
    sock: &mut UnixStream,
    message: &Message,
    trailers: &OpenTrailers<'_>,
    deadline: Deadline,
) -> Result<Message> {
    write_message(sock, message, deadline)?;

    let flags = match &message.payload {
        Payload::Params(p) => p.flags,
        _ => MessageFlags::empty(),
    };

    if flags.contains(MessageFlags::ADD_LOG) {
        let path = trailers
            .log_path
            .ok_or_else(|| Error::invalid_arg("ADD_LOG set without a log path"))?;
        write_raw(sock, &path_field(path)?, deadline)?;
    }

    if flags.contains(MessageFlags::OPEN_ENCRYPTED) {
        let key = trailers
            .key
            .ok_or_else(|| Error::invalid_arg("OPEN_ENCRYPTED set without a key"))?;
        if key.is_empty() || key.len() > u8::MAX as usize {
            return Err(Error::invalid_arg("encryption key length out of range"));
        }
        debug!(bits = key.len() * 8, "sending encryption key");
        write_raw(sock, &[key.len() as u8], deadline)?;
        write_raw(sock, key, deadline)?;
    }

    if flags.contains(MessageFlags::RATED) {
        let path = trailers
            .valve_path
            .ok_or_else(|| Error::invalid_arg("RATED set without a valve socket"))?;
        write_raw(sock, &path_field(path)?, deadline)?;
    }

    read_message(sock, deadline)
}

/// A path padded into the fixed 256-byte trailer field
fn path_field(path: &Path) -> Result<[u8; crate::message::MAX_PATH_LEN]> {
    let s = path
        .to_str()
        .ok_or_else(|| Error::invalid_arg("non-UTF-8 path"))?;
    crate::message::check_field(s)?;
    let mut field = [0u8; crate::message::MAX_PATH_LEN];
    field[..s.len()].copy_from_slice(s.as_bytes());
    Ok(field)
}

/// Check a reply against the expected response type.
///
/// An `ERROR` frame is a valid reply to anything; a non-zero response errno
/// is converted back into the taxonomy.
pub fn expect_response(reply: &Message, expected: crate::message::MessageType) -> Result<()> {
    use crate::message::MessageType;
    if reply.kind != expected
        && reply.kind != MessageType::Error
        && reply.kind != MessageType::RuntimeError
    {
        return Err(Error::protocol(format!(
            "expected '{}', got '{}'",
            expected.name(),
            reply.kind.name()
        )));
    }
    let response = reply.response()?;
    if response.error != 0 {
        warn!(
            errno = response.error,
            message = %response.message,
            kind = reply.kind.name(),
            "tapdisk reported failure"
        );
        return Err(Error::from_errno(response.error, &response.message));
    }
    Ok(())
}
