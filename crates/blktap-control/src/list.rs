//! Tap registry
//!
//! Answers "what exists right now" by unioning two filesystem enumerations:
//! kernel minors from the sysfs class directory, and live tapdisks from the
//! control sockets. Each live tapdisk is asked to `LIST` what it serves;
//! minors claimed there leave the orphan pool. The result is a three-way
//! outer join: paired entries, tapdisks with no minor, minors with no
//! tapdisk.

use blktap_core::{Error, Result};
use tracing::{debug, warn};

use crate::ipc;
use crate::lifecycle::TapCtl;
use crate::message::{Message, MessageType, Payload};

/// One registry row.
///
/// `pid` is `None` for an orphaned kernel minor; `minor` is `None` for a
/// tapdisk with nothing attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapEntry {
    pub pid: Option<i32>,
    pub minor: Option<i32>,
    pub state: i32,
    /// Driver tag from the `type:path` descriptor
    pub kind: Option<String>,
    pub path: Option<String>,
}

/// Split a `type:path` image descriptor
pub fn parse_params(params: &str) -> Result<(String, String)> {
    match params.split_once(':') {
        Some((kind, path)) if !kind.is_empty() => {
            Ok((kind.to_string(), path.to_string()))
        }
        _ => Err(Error::invalid_arg(format!(
            "malformed image descriptor '{}'",
            params
        ))),
    }
}

impl TapCtl {
    /// Kernel minors present in sysfs
    fn scan_minors(&self) -> Result<Vec<i32>> {
        let mut minors = Vec::new();
        let entries = match std::fs::read_dir(self.sysfs_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(minors),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(minor) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.strip_prefix("blktap"))
                .and_then(|s| s.parse().ok())
            {
                minors.push(minor);
            }
        }
        minors.sort_unstable();
        Ok(minors)
    }

    /// Live tapdisk pids: control sockets that answer a `PID` probe
    fn scan_tapdisks(&self) -> Result<Vec<i32>> {
        let mut pids = Vec::new();
        let entries = match std::fs::read_dir(self.control_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pids),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let Some(announced) = ipc::socket_pid(&entry.path()) else {
                continue;
            };
            match self.get_pid(announced) {
                Ok(pid) => pids.push(pid),
                Err(err) => {
                    debug!(announced, error = %err, "stale control socket");
                }
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// What one tapdisk serves, via the multi-response `LIST`
    pub fn list_pid(&self, pid: i32) -> Result<Vec<TapEntry>> {
        let mut sock = self.connect(pid)?;
        let deadline = self.deadline();
        ipc::write_message(
            &mut sock,
            &Message::empty(MessageType::List, 0),
            deadline,
        )?;

        let mut entries = Vec::new();
        loop {
            let reply = ipc::read_message(&mut sock, deadline)?;
            let list = match reply.payload {
                Payload::List(list) => list,
                Payload::Response(r) => {
                    return Err(Error::from_errno(r.error, &r.message))
                }
                _ => return Err(Error::protocol("list answered with wrong payload")),
            };
            if list.count == 0 {
                break;
            }
            let (kind, path) = if list.path.is_empty() {
                (None, None)
            } else {
                let (k, p) = parse_params(&list.path)?;
                (Some(k), Some(p))
            };
            entries.push(TapEntry {
                pid: Some(pid),
                minor: (list.minor >= 0).then_some(list.minor),
                state: list.state,
                kind,
                path,
            });
        }
        Ok(entries)
    }

    /// The full three-way registry join
    pub fn list(&self) -> Result<Vec<TapEntry>> {
        let mut orphans = self.scan_minors()?;
        let mut entries = Vec::new();

        for pid in self.scan_tapdisks()? {
            match self.list_pid(pid) {
                Ok(served) => {
                    if served.is_empty() {
                        entries.push(TapEntry {
                            pid: Some(pid),
                            minor: None,
                            state: -1,
                            kind: None,
                            path: None,
                        });
                    }
                    for entry in served {
                        if let Some(minor) = entry.minor {
                            orphans.retain(|&m| m != minor);
                        }
                        entries.push(entry);
                    }
                }
                Err(err) => {
                    warn!(pid, error = %err, "tapdisk list failed");
                }
            }
        }

        for minor in orphans {
            entries.push(TapEntry {
                pid: None,
                minor: Some(minor),
                state: -1,
                kind: None,
                path: None,
            });
        }

        entries.sort_by_key(|e| (e.pid.unwrap_or(-1), e.minor.unwrap_or(-1)));
        Ok(entries)
    }

    /// Find the minor serving `path` with driver `kind`
    pub fn find_minor(&self, kind: &str, path: &str) -> Result<i32> {
        self.list()?
            .into_iter()
            .find(|e| {
                e.kind.as_deref() == Some(kind) && e.path.as_deref() == Some(path)
            })
            .and_then(|e| e.minor)
            .ok_or_else(|| Error::not_found(format!("{}:{}", kind, path)))
    }
}
