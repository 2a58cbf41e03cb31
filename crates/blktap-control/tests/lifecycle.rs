//! End-to-end control-plane tests against a scripted tapdisk.
//!
//! A thread stands in for the tapdisk process: it owns the control socket,
//! answers the protocol, and records what it was asked to do.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blktap_control::{
    Allocator, Deadline, ImagePayload, Message, MessageType, OpenArgs, Payload,
    ResponsePayload, TapCtl, TapDevices, TapHandle,
};
use blktap_core::Result;

const FAKE_PID: i32 = 4242;

/// Device provisioning double: hands out minors without a kernel
struct FakeDevices;

impl TapDevices for FakeDevices {
    fn alloc_tap(&self) -> Result<TapHandle> {
        Ok(TapHandle {
            ring_major: 254,
            device_major: 253,
            minor: 0,
        })
    }

    fn free_tap(&self, _minor: u32) -> Result<()> {
        Ok(())
    }

    fn make_nodes(&self, _handle: &TapHandle) -> Result<()> {
        Ok(())
    }
}

/// Scripted tapdisk: answers the wire protocol from a fixed playbook
struct FakeTapdisk {
    /// `CLOSE` replies answer `EBUSY` this many times before succeeding
    busy_closes: AtomicI32,
    /// Entries reported by `LIST`
    serving: Vec<(i32, String)>,
}

impl FakeTapdisk {
    fn start(self: Arc<Self>, socket: PathBuf) -> std::thread::JoinHandle<()> {
        let listener = UnixListener::bind(&socket).unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let me = Arc::clone(&self);
                me.serve(stream);
            }
        })
    }

    fn serve(&self, mut sock: UnixStream) {
        loop {
            let request = match blktap_control::ipc::read_message(
                &mut sock,
                Deadline::after(Duration::from_millis(200)),
            ) {
                Ok(m) => m,
                Err(_) => return,
            };

            let ok = |kind| {
                Message::new(
                    kind,
                    request.cookie,
                    Payload::Response(ResponsePayload::default()),
                )
            };
            let reply = match request.kind {
                MessageType::Pid => Message::new(
                    MessageType::PidRsp,
                    request.cookie,
                    Payload::Pid(FAKE_PID),
                ),
                MessageType::Attach => ok(MessageType::AttachRsp),
                MessageType::Open => ok(MessageType::OpenRsp),
                MessageType::Pause => ok(MessageType::PauseRsp),
                MessageType::Resume => ok(MessageType::ResumeRsp),
                MessageType::Detach => ok(MessageType::DetachRsp),
                MessageType::ForceShutdown => ok(MessageType::CloseRsp),
                MessageType::Close => {
                    if self.busy_closes.fetch_sub(1, Ordering::SeqCst) > 0 {
                        Message::new(
                            MessageType::CloseRsp,
                            request.cookie,
                            Payload::Response(ResponsePayload {
                                error: libc::EBUSY,
                                message: "requests in flight".into(),
                            }),
                        )
                    } else {
                        ok(MessageType::CloseRsp)
                    }
                }
                MessageType::DiskInfo => Message::new(
                    MessageType::DiskInfoRsp,
                    request.cookie,
                    Payload::Image(ImagePayload {
                        sectors: 131072,
                        sector_size: 512,
                        info: 0,
                    }),
                ),
                MessageType::List => {
                    for (i, (minor, path)) in self.serving.iter().enumerate() {
                        let frame = Message::new(
                            MessageType::ListRsp,
                            request.cookie,
                            Payload::List(blktap_control::message::ListPayload {
                                count: (self.serving.len() - i) as i32,
                                minor: *minor,
                                state: 0,
                                path: path.clone(),
                            }),
                        );
                        blktap_control::ipc::write_message(
                            &mut sock,
                            &frame,
                            Deadline::never(),
                        )
                        .unwrap();
                    }
                    Message::new(
                        MessageType::ListRsp,
                        request.cookie,
                        Payload::List(blktap_control::message::ListPayload::default()),
                    )
                }
                MessageType::XenblkifConnect => ok(MessageType::XenblkifConnectRsp),
                MessageType::XenblkifDisconnect => {
                    ok(MessageType::XenblkifDisconnectRsp)
                }
                other => panic!("fake tapdisk got unexpected '{}'", other.name()),
            };
            blktap_control::ipc::write_message(&mut sock, &reply, Deadline::never())
                .unwrap();
        }
    }
}

struct Harness {
    ctl: TapCtl,
    _server: std::thread::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

fn harness(busy_closes: i32, serving: Vec<(i32, String)>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ctl_dir = dir.path().join("control");
    let sysfs_dir = dir.path().join("sysfs");
    let alloc_dir = ctl_dir.join("tapdisk");
    std::fs::create_dir_all(&ctl_dir).unwrap();
    std::fs::create_dir_all(&sysfs_dir).unwrap();

    let server = Arc::new(FakeTapdisk {
        busy_closes: AtomicI32::new(busy_closes),
        serving,
    });
    let handle = server.start(ctl_dir.join(format!("ctl{}", FAKE_PID)));

    let mut ctl = TapCtl::with_config(
        &ctl_dir,
        &sysfs_dir,
        Allocator::new(alloc_dir),
        Box::new(FakeDevices),
    );
    ctl.set_tapdisk_binary(fake_spawner(dir.path(), &ctl_dir));

    Harness {
        ctl,
        _server: handle,
        _dir: dir,
    }
}

/// A stand-in tapdisk binary that just announces the scripted socket
fn fake_spawner(dir: &Path, ctl_dir: &Path) -> PathBuf {
    let path = dir.join("tapdisk");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh").unwrap();
    writeln!(f, "echo {}/ctl{}", ctl_dir.display(), FAKE_PID).unwrap();
    drop(f);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_get_pid_probe() {
    let h = harness(0, vec![]);
    assert_eq!(h.ctl.get_pid(FAKE_PID).unwrap(), FAKE_PID);
}

#[test]
fn test_create_runs_full_sequence() {
    let h = harness(0, vec![]);
    let tap = h
        .ctl
        .create("vhd:/images/a.vhd", &OpenArgs::default(), None)
        .unwrap();
    assert_eq!(tap.pid, FAKE_PID);
    assert_eq!(tap.minor, 0);
}

#[test]
fn test_close_retries_through_ebusy() {
    let h = harness(1, vec![]);
    h.ctl
        .close(
            FAKE_PID,
            0,
            false,
            Deadline::after(Duration::from_secs(10)),
        )
        .unwrap();
}

#[test]
fn test_close_gives_up_at_deadline() {
    let h = harness(i32::MAX, vec![]);
    let err = h
        .ctl
        .close(FAKE_PID, 0, false, Deadline::after(Duration::from_millis(10)))
        .unwrap_err();
    assert!(matches!(err, blktap_core::Error::Timeout));
}

#[test]
fn test_force_close_skips_retry() {
    let h = harness(i32::MAX, vec![]);
    h.ctl
        .close(FAKE_PID, 0, true, Deadline::after(Duration::from_secs(1)))
        .unwrap();
}

#[test]
fn test_destroy_sequence() {
    let h = harness(0, vec![]);
    let tap = h
        .ctl
        .create("vhd:/images/a.vhd", &OpenArgs::default(), None)
        .unwrap();
    let (pid, minor) = (tap.pid, tap.minor);
    // The hold's marker lock must be released before `free` can reap it
    drop(tap);
    h.ctl
        .destroy(pid, minor, false, Deadline::after(Duration::from_secs(5)))
        .unwrap();
}

#[test]
fn test_disk_info() {
    let h = harness(0, vec![]);
    let info = h.ctl.disk_info(FAKE_PID, 0).unwrap();
    assert_eq!(info.sectors, 131072);
    assert_eq!(info.sector_size, 512);
}

#[test]
fn test_registry_three_way_join() {
    let h = harness(0, vec![(0, "vhd:/images/a.vhd".into())]);
    // Two kernel minors: 0 is served by the tapdisk, 5 is orphaned
    std::fs::write(h._dir.path().join("sysfs/blktap0"), "").unwrap();
    std::fs::write(h._dir.path().join("sysfs/blktap5"), "").unwrap();

    let entries = h.ctl.list().unwrap();
    assert_eq!(entries.len(), 2);

    let orphan = entries.iter().find(|e| e.pid.is_none()).unwrap();
    assert_eq!(orphan.minor, Some(5));

    let paired = entries.iter().find(|e| e.pid.is_some()).unwrap();
    assert_eq!(paired.pid, Some(FAKE_PID));
    assert_eq!(paired.minor, Some(0));
    assert_eq!(paired.kind.as_deref(), Some("vhd"));
    assert_eq!(paired.path.as_deref(), Some("/images/a.vhd"));
}

#[test]
fn test_find_minor() {
    let h = harness(0, vec![(3, "vhd:/images/a.vhd".into())]);
    assert_eq!(h.ctl.find_minor("vhd", "/images/a.vhd").unwrap(), 3);
    assert!(h.ctl.find_minor("vhd", "/images/other.vhd").is_err());
}

#[test]
fn test_pause_unpause() {
    let h = harness(0, vec![]);
    h.ctl.pause(FAKE_PID, 0).unwrap();
    h.ctl
        .unpause(FAKE_PID, 0, Some("vhd:/images/b.vhd"), &OpenArgs::default())
        .unwrap();
}
