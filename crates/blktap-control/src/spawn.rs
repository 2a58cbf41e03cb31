//! tapdisk process spawning
//!
//! A freshly spawned tapdisk daemonizes and prints its control-socket path
//! on stdout; the parent parses the pid out of that line. A child killed by
//! `SIGUSR1` during init was shot by a debugging tool mid-setup and the
//! spawn is retried.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use blktap_core::{Error, Result};
use tracing::{info, warn};

use crate::ipc;

/// Compiled-in tapdisk location, used when no override is present
pub const TAPDISK_EXEC: &str = "/usr/sbin/tapdisk";

/// Spawn attempts before giving up on spurious-signal deaths
const SPAWN_RETRIES: u32 = 3;

/// Locate the tapdisk executable: `$TAPDISK`, then `$TAPDISK2`, then the
/// compiled-in path
pub fn tapdisk_binary() -> PathBuf {
    std::env::var_os("TAPDISK")
        .or_else(|| std::env::var_os("TAPDISK2"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(TAPDISK_EXEC))
}

/// Spawn a tapdisk and return its pid.
///
/// `binary` overrides executable discovery; `control_dir` is where the
/// child's socket-path announcement must point.
pub fn spawn_tapdisk(control_dir: &Path, binary: Option<&Path>) -> Result<i32> {
    let binary = binary.map(Path::to_path_buf).unwrap_or_else(tapdisk_binary);

    for attempt in 0..SPAWN_RETRIES {
        let output = Command::new(&binary)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::not_found(format!("tapdisk binary {}", binary.display()))
                } else {
                    Error::Io(e)
                }
            })?;

        if let Some(signal) = output.status.signal() {
            if signal == libc::SIGUSR1 {
                // Race between the child's sigaction setup and debug
                // tooling broadcasting USR1; the child is gone, try again.
                warn!(attempt, "tapdisk killed by SIGUSR1 during init, retrying");
                continue;
            }
            return Err(Error::protocol(format!(
                "tapdisk killed by signal {}",
                signal
            )));
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(Error::from_errno(
                code,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = parse_socket_announcement(control_dir, &stdout)?;
        info!(pid, "spawned tapdisk");
        return Ok(pid);
    }
    Err(Error::busy("tapdisk spawn kept dying to SIGUSR1"))
}

/// Extract the pid from the child's control-socket announcement
fn parse_socket_announcement(control_dir: &Path, stdout: &str) -> Result<i32> {
    for line in stdout.lines() {
        let line = line.trim();
        let path = Path::new(line);
        if path.parent() == Some(control_dir) {
            if let Some(pid) = ipc::socket_pid(path) {
                return Ok(pid);
            }
        }
    }
    Err(Error::protocol(format!(
        "tapdisk announced no control socket under {}",
        control_dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn fake_tapdisk(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("tapdisk");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{}", script).unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_socket_announcement() {
        let dir = Path::new("/run/blktap-control");
        let pid =
            parse_socket_announcement(dir, "/run/blktap-control/ctl4242\n").unwrap();
        assert_eq!(pid, 4242);
    }

    #[test]
    fn test_parse_rejects_foreign_directory() {
        let dir = Path::new("/run/blktap-control");
        assert!(parse_socket_announcement(dir, "/tmp/elsewhere/ctl1\n").is_err());
        assert!(parse_socket_announcement(dir, "garbage\n").is_err());
    }

    #[test]
    fn test_spawn_parses_pid() {
        let dir = tempdir().unwrap();
        let ctl = dir.path().join("ctl-dir");
        std::fs::create_dir(&ctl).unwrap();
        let bin = fake_tapdisk(
            dir.path(),
            &format!("echo {}/ctl31337", ctl.display()),
        );
        let pid = spawn_tapdisk(&ctl, Some(&bin)).unwrap();
        assert_eq!(pid, 31337);
    }

    #[test]
    fn test_spawn_surfaces_exit_code() {
        let dir = tempdir().unwrap();
        let bin = fake_tapdisk(dir.path(), "echo doomed >&2; exit 2");
        let err = spawn_tapdisk(dir.path(), Some(&bin)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "ENOENT surfaced: {err}");
    }

    #[test]
    fn test_spawn_missing_binary() {
        let dir = tempdir().unwrap();
        let err =
            spawn_tapdisk(dir.path(), Some(Path::new("/nonexistent/tapdisk")))
                .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
