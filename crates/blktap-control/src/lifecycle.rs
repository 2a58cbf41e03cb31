//! tapdisk lifecycle
//!
//! The verbs a management plane speaks at one tapdisk: attach, open, pause,
//! resume, close, detach, plus the composed end-to-end `create` (allocate →
//! spawn → attach → open, unwinding on failure) and `destroy` (close →
//! detach → free).

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blktap_core::{Error, Result};
use tracing::{info, warn};

use crate::allocate::{Allocator, MinorHold, TapDevices};
use crate::ipc::{self, Deadline, OpenTrailers};
use crate::message::{
    ImagePayload, Message, MessageFlags, MessageType, ParamsPayload, Payload,
};
use crate::spawn;

/// Delay between retries of a `CLOSE` that keeps answering `EBUSY`
const CLOSE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Arguments to `OPEN` beyond the image descriptor
#[derive(Debug, Clone, Default)]
pub struct OpenArgs {
    pub flags: MessageFlags,
    /// Minor of an existing tapdisk to stack on
    pub prt_minor: Option<u32>,
    /// Secondary image descriptor for mirrored writes
    pub secondary: Option<String>,
    /// Per-request timeout the tapdisk should apply, seconds
    pub req_timeout: u16,
    /// Log layer insertion path (sets `ADD_LOG`)
    pub log_path: Option<PathBuf>,
    /// Encryption key (sets `OPEN_ENCRYPTED`)
    pub key: Option<Vec<u8>>,
    /// Rate-limit valve socket (sets `RATED`)
    pub valve_path: Option<PathBuf>,
}

/// A fully created tap: spawned, attached, opened.
///
/// Holds the minor's marker lock for the lifetime of the value.
#[derive(Debug)]
pub struct CreatedTap {
    pub pid: i32,
    pub minor: u32,
    _hold: MinorHold,
}

/// Client for the tapdisk control plane
pub struct TapCtl {
    control_dir: PathBuf,
    sysfs_dir: PathBuf,
    allocator: Allocator,
    devices: Box<dyn TapDevices>,
    /// Binary override for spawning; falls back to `$TAPDISK` discovery
    tapdisk_binary: Option<PathBuf>,
    /// Per-request deadline
    timeout: Option<Duration>,
}

impl TapCtl {
    /// Production configuration: system control dir, sysfs, kernel ioctls
    pub fn system() -> Self {
        Self {
            control_dir: crate::allocate::CONTROL_DIR.into(),
            sysfs_dir: "/sys/class/blktap2".into(),
            allocator: Allocator::system(),
            devices: Box::new(crate::allocate::KernelTapDevices::new()),
            tapdisk_binary: None,
            timeout: Some(ipc::COMM_RETRY_TIMEOUT),
        }
    }

    /// Fully parameterized constructor, the test harness entry point
    pub fn with_config(
        control_dir: impl Into<PathBuf>,
        sysfs_dir: impl Into<PathBuf>,
        allocator: Allocator,
        devices: Box<dyn TapDevices>,
    ) -> Self {
        Self {
            control_dir: control_dir.into(),
            sysfs_dir: sysfs_dir.into(),
            allocator,
            devices,
            tapdisk_binary: None,
            timeout: Some(Duration::from_secs(5)),
        }
    }

    pub fn set_tapdisk_binary(&mut self, binary: impl Into<PathBuf>) {
        self.tapdisk_binary = Some(binary.into());
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    pub(crate) fn sysfs_dir(&self) -> &Path {
        &self.sysfs_dir
    }

    pub(crate) fn deadline(&self) -> Deadline {
        match self.timeout {
            Some(t) => Deadline::after(t),
            None => Deadline::never(),
        }
    }

    /// Connect to the control socket of tapdisk `pid`
    pub fn connect(&self, pid: i32) -> Result<UnixStream> {
        ipc::connect(&ipc::socket_name(&self.control_dir, pid))
    }

    fn request(&self, pid: i32, message: &Message) -> Result<Message> {
        let mut sock = self.connect(pid)?;
        ipc::send_and_receive(&mut sock, message, self.deadline())
    }

    /// Simple request: send, receive, demand a clean response of `rsp` type
    fn command(&self, pid: i32, message: &Message, rsp: MessageType) -> Result<()> {
        let reply = self.request(pid, message)?;
        ipc::expect_response(&reply, rsp)
    }

    /// Ask a tapdisk for its pid, which doubles as a liveness probe
    pub fn get_pid(&self, id: i32) -> Result<i32> {
        let reply = self.request(id, &Message::empty(MessageType::Pid, 0))?;
        match reply.payload {
            Payload::Pid(pid) => Ok(pid),
            _ => Err(Error::protocol("pid request answered with wrong payload")),
        }
    }

    /// Spawn a tapdisk process and verify it answers on its socket
    pub fn spawn(&self) -> Result<i32> {
        let pid = spawn::spawn_tapdisk(
            &self.control_dir,
            self.tapdisk_binary.as_deref(),
        )?;
        let reported = self.get_pid(pid)?;
        if reported != pid {
            warn!(announced = pid, reported, "tapdisk pid mismatch");
        }
        Ok(reported)
    }

    /// Bind tapdisk `pid` to `minor`
    pub fn attach(&self, pid: i32, minor: u32) -> Result<()> {
        self.command(
            pid,
            &Message::empty(MessageType::Attach, minor as u16),
            MessageType::AttachRsp,
        )
    }

    /// Unbind tapdisk `pid` from `minor`
    pub fn detach(&self, pid: i32, minor: u32) -> Result<()> {
        self.command(
            pid,
            &Message::empty(MessageType::Detach, minor as u16),
            MessageType::DetachRsp,
        )
    }

    /// Open an image (`type:path`) on an attached tapdisk
    pub fn open(&self, pid: i32, minor: u32, params: &str, args: &OpenArgs) -> Result<()> {
        crate::message::check_field(params)?;
        let mut flags = args.flags;
        if args.log_path.is_some() {
            flags |= MessageFlags::ADD_LOG;
        }
        if args.key.is_some() {
            flags |= MessageFlags::OPEN_ENCRYPTED;
        }
        if args.valve_path.is_some() {
            flags |= MessageFlags::RATED;
        }
        if args.secondary.is_some() {
            flags |= MessageFlags::SECONDARY;
        }
        if args.prt_minor.is_some() {
            flags |= MessageFlags::REUSE_PRT;
        }

        let message = Message::new(
            MessageType::Open,
            minor as u16,
            Payload::Params(ParamsPayload {
                flags,
                devnum: minor,
                domid: 0,
                path: params.to_string(),
                prt_devnum: args.prt_minor.unwrap_or(0),
                req_timeout: args.req_timeout,
                secondary: args.secondary.clone().unwrap_or_default(),
            }),
        );
        let trailers = OpenTrailers {
            log_path: args.log_path.as_deref(),
            key: args.key.as_deref(),
            valve_path: args.valve_path.as_deref(),
        };

        let mut sock = self.connect(pid)?;
        let reply =
            ipc::send_and_receive_ex(&mut sock, &message, &trailers, self.deadline())?;
        ipc::expect_response(&reply, MessageType::OpenRsp)
    }

    /// Close the image on `minor`.
    ///
    /// A plain close is retried while the tapdisk answers `EBUSY`, once per
    /// second until `deadline`; `force` sends `FORCE_SHUTDOWN` instead and
    /// is never retried.
    pub fn close(
        &self,
        pid: i32,
        minor: u32,
        force: bool,
        deadline: Deadline,
    ) -> Result<()> {
        let kind = if force {
            MessageType::ForceShutdown
        } else {
            MessageType::Close
        };
        loop {
            let result = self.command(
                pid,
                &Message::empty(kind, minor as u16),
                MessageType::CloseRsp,
            );
            match result {
                Err(ref e) if !force && e.is_busy() => {
                    if deadline.expired() {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(CLOSE_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    /// Quiesce and flush ahead of a snapshot or handoff
    pub fn pause(&self, pid: i32, minor: u32) -> Result<()> {
        self.command(
            pid,
            &Message::empty(MessageType::Pause, minor as u16),
            MessageType::PauseRsp,
        )
    }

    /// Resume a paused tapdisk, optionally on a different image
    pub fn unpause(
        &self,
        pid: i32,
        minor: u32,
        params: Option<&str>,
        args: &OpenArgs,
    ) -> Result<()> {
        let mut flags = args.flags;
        if args.secondary.is_some() {
            flags |= MessageFlags::SECONDARY;
        }
        let message = Message::new(
            MessageType::Resume,
            minor as u16,
            Payload::Params(ParamsPayload {
                flags,
                devnum: minor,
                domid: 0,
                path: params.unwrap_or("").to_string(),
                prt_devnum: 0,
                req_timeout: args.req_timeout,
                secondary: args.secondary.clone().unwrap_or_default(),
            }),
        );
        let reply = self.request(pid, &message)?;
        ipc::expect_response(&reply, MessageType::ResumeRsp)
    }

    /// Fetch the geometry of the open image
    pub fn disk_info(&self, pid: i32, minor: u32) -> Result<ImagePayload> {
        let reply =
            self.request(pid, &Message::empty(MessageType::DiskInfo, minor as u16))?;
        match reply.payload {
            Payload::Image(image) => Ok(image),
            Payload::Response(r) if r.error != 0 => {
                Err(Error::from_errno(r.error, &r.message))
            }
            _ => Err(Error::protocol("disk info answered with wrong payload")),
        }
    }

    /// Fetch the free-form stats text that follows a `STATS_RSP`
    pub fn stats(&self, pid: i32, minor: u32) -> Result<String> {
        let mut sock = self.connect(pid)?;
        let deadline = self.deadline();
        let reply = ipc::send_and_receive(
            &mut sock,
            &Message::empty(MessageType::Stats, minor as u16),
            deadline,
        )?;
        let length = match reply.payload {
            Payload::Stat(s) => s.length,
            _ => return Err(Error::protocol("stats answered with wrong payload")),
        };
        let mut text = vec![0u8; length as usize];
        ipc::read_raw(&mut sock, &mut text, deadline)?;
        String::from_utf8(text).map_err(|_| Error::protocol("stats text not UTF-8"))
    }

    /// Allocate a kernel minor and its device nodes
    pub fn allocate(&self) -> Result<MinorHold> {
        let hold = self.allocator.allocate()?;
        let handle = self.devices.alloc_tap()?;
        self.devices.make_nodes(&handle)?;
        Ok(hold)
    }

    /// Release a minor back to the kernel and the registry
    pub fn free(&self, minor: u32) -> Result<()> {
        self.devices.free_tap(minor)?;
        self.allocator.free(minor)
    }

    /// End-to-end bring-up: allocate, spawn (or reuse), attach, open.
    ///
    /// Any step failing unwinds what came before it: detach, then free.
    pub fn create(
        &self,
        params: &str,
        args: &OpenArgs,
        reuse_pid: Option<i32>,
    ) -> Result<CreatedTap> {
        let hold = self.allocate()?;
        let minor = hold.minor;

        let result = (|| {
            let pid = match reuse_pid {
                Some(pid) => pid,
                None => self.spawn()?,
            };
            self.attach(pid, minor)?;
            if let Err(err) = self.open(pid, minor, params, args) {
                if let Err(detach_err) = self.detach(pid, minor) {
                    warn!(error = %detach_err, "unwind detach failed");
                }
                return Err(err);
            }
            Ok(pid)
        })();

        match result {
            Ok(pid) => {
                info!(pid, minor, params, "tapdisk created");
                Ok(CreatedTap {
                    pid,
                    minor,
                    _hold: hold,
                })
            }
            Err(err) => {
                drop(hold);
                if let Err(free_err) = self.free(minor) {
                    warn!(error = %free_err, minor, "unwind free failed");
                }
                Err(err)
            }
        }
    }

    /// End-to-end tear-down: close, detach, free
    pub fn destroy(
        &self,
        pid: i32,
        minor: u32,
        force: bool,
        deadline: Deadline,
    ) -> Result<()> {
        self.close(pid, minor, force, deadline)?;
        self.detach(pid, minor)?;
        self.free(minor)?;
        info!(pid, minor, "tapdisk destroyed");
        Ok(())
    }
}
