//! Per-VBD channel state
//!
//! Each virtual block device is one [`Vbd`] keyed by `(domid, devid)`. Its
//! tapdisk channel walks a fixed state graph; every wake-up computes a
//! target channel state from the shutdown and VBD states and takes at most
//! one action toward it. `Wait*` states mean a request is outstanding and
//! the caller should come back later.

use blktap_core::{Error, Result};
use tracing::{debug, info};

/// Ring parameters read from the guest frontend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingInfo {
    pub grefs: Vec<u32>,
    pub order: u32,
    pub event_channel: u32,
    /// "x86_32-abi", "x86_64-abi" or native when absent
    pub protocol: Option<String>,
    pub feature_persistent: bool,
}

/// The tapdisk side of the orchestrator, mockable for tests
pub trait TapClient {
    /// Pid of the tapdisk serving `minor`, if any
    fn find_by_minor(&mut self, minor: u32) -> Result<Option<i32>>;
    /// Bring up a tapdisk (allocate, spawn, attach) without opening
    fn create(&mut self) -> Result<(i32, u32)>;
    fn open(&mut self, pid: i32, minor: u32, params: &str, rw: bool) -> Result<()>;
    fn pause(&mut self, pid: i32, minor: u32) -> Result<()>;
    fn resume(&mut self, pid: i32, minor: u32) -> Result<()>;
    fn close(&mut self, pid: i32, minor: u32, force: bool) -> Result<()>;
    fn detach_free(&mut self, pid: i32, minor: u32) -> Result<()>;
    /// (sectors, sector_size, info)
    fn disk_info(&mut self, pid: i32, minor: u32) -> Result<(u64, u32, u32)>;
    fn connect_ring(
        &mut self,
        pid: i32,
        minor: u32,
        domid: u32,
        devid: u32,
        ring: &RingInfo,
    ) -> Result<()>;
    fn disconnect_ring(&mut self, pid: i32, minor: u32, domid: u32, devid: u32)
        -> Result<()>;
}

/// Channel state: where the tapdisk conversation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Dead,
    Launched,
    WaitPid,
    Pid,
    WaitOpen,
    Running,
    WaitPause,
    Paused,
    WaitResume,
    WaitClose,
    Closed,
}

impl ChannelState {
    /// A request is outstanding; no new action may start
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ChannelState::Launched
                | ChannelState::WaitPid
                | ChannelState::WaitOpen
                | ChannelState::WaitPause
                | ChannelState::WaitResume
                | ChannelState::WaitClose
        )
    }
}

/// Administrative state of the VBD itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbdState {
    Unpaused,
    Pausing,
    Paused,
    Broken,
    Dead,
    Recycled,
}

/// Whether the backend is taking the device down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Up,
    Down,
    ForceDown,
}

/// XenBus handshake states, numeric values per the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum XenbusState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
}

impl XenbusState {
    pub fn from_u32(v: u32) -> Option<Self> {
        use XenbusState::*;
        Some(match v {
            0 => Unknown,
            1 => Initialising,
            2 => InitWait,
            3 => Initialised,
            4 => Connected,
            5 => Closing,
            6 => Closed,
            _ => return None,
        })
    }
}

/// Result of one drive step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Channel is at its target
    Done,
    /// An action was taken or the channel is busy; wake up again
    Again,
}

/// One virtual block device
#[derive(Debug)]
pub struct Vbd {
    pub domid: u32,
    pub devid: u32,
    pub backend_path: String,
    pub frontend_path: Option<String>,

    pub channel: ChannelState,
    pub state: VbdState,
    pub shutdown: ShutdownState,

    pub pid: Option<i32>,
    pub minor: Option<u32>,
    /// `major:minor` of the kernel tap device, once published
    pub physical_device: Option<(u32, u32)>,
    pub hotplug_connected: bool,

    /// `type:path` image descriptor
    pub params: Option<String>,
    pub mode_rw: bool,
    pub cdrom: bool,

    /// Geometry cached from tapdisk
    pub sectors: u64,
    pub sector_size: u32,
    pub info: u32,

    /// Watch tokens owned by this VBD
    pub frontend_watch: Option<String>,
    pub pause_watch: Option<String>,
}

impl Vbd {
    pub fn new(domid: u32, devid: u32, backend_path: String) -> Self {
        Self {
            domid,
            devid,
            backend_path,
            frontend_path: None,
            channel: ChannelState::Dead,
            state: VbdState::Unpaused,
            shutdown: ShutdownState::Up,
            pid: None,
            minor: None,
            physical_device: None,
            hotplug_connected: false,
            params: None,
            mode_rw: false,
            cdrom: false,
            sectors: 0,
            sector_size: 0,
            info: 0,
            frontend_watch: None,
            pause_watch: None,
        }
    }

    /// The channel state the current (shutdown, vbd) pair calls for
    pub fn target(&self) -> ChannelState {
        match (self.shutdown, self.state) {
            (ShutdownState::Down | ShutdownState::ForceDown, _) => ChannelState::Closed,
            (ShutdownState::Up, VbdState::Unpaused) => ChannelState::Running,
            (ShutdownState::Up, VbdState::Pausing | VbdState::Paused) => {
                ChannelState::Paused
            }
            (
                ShutdownState::Up,
                VbdState::Broken | VbdState::Dead | VbdState::Recycled,
            ) => ChannelState::Closed,
        }
    }

    /// Ready to launch: the image is known and hotplug has blessed it
    fn can_launch(&self) -> bool {
        self.params.is_some() && self.hotplug_connected
    }

    /// Take one step toward the target state.
    ///
    /// Exactly one tapdisk request is issued per call; `Wait*` states report
    /// `Again` without acting. Errors leave the channel where the failed
    /// request put it; the caller decides whether that breaks the VBD.
    pub fn drive(&mut self, tap: &mut dyn TapClient) -> Result<Progress> {
        let target = self.target();
        if self.channel == target {
            return Ok(Progress::Done);
        }
        if self.channel.is_busy() {
            return Ok(Progress::Again);
        }
        debug!(
            domid = self.domid,
            devid = self.devid,
            from = ?self.channel,
            to = ?target,
            "driving channel"
        );

        match (self.channel, target) {
            // Bring-up: launch a tapdisk
            (ChannelState::Dead | ChannelState::Closed, ChannelState::Running)
            | (ChannelState::Dead | ChannelState::Closed, ChannelState::Paused) => {
                if !self.can_launch() {
                    return Ok(Progress::Again);
                }
                if self.pid.is_none() {
                    self.channel = ChannelState::WaitPid;
                    let (pid, minor) = tap.create()?;
                    self.pid = Some(pid);
                    if self.minor.is_none() {
                        self.minor = Some(minor);
                    }
                }
                self.channel = ChannelState::Pid;
                Ok(Progress::Again)
            }

            // Image open after the pid is known
            (ChannelState::Pid, ChannelState::Running | ChannelState::Paused) => {
                let (pid, minor) = self.endpoints()?;
                let params = self
                    .params
                    .clone()
                    .ok_or_else(|| Error::state("no image params"))?;
                self.channel = ChannelState::WaitOpen;
                tap.open(pid, minor, &params, self.mode_rw)?;
                let (sectors, sector_size, info) = tap.disk_info(pid, minor)?;
                self.sectors = sectors;
                self.sector_size = sector_size;
                self.info = info;
                self.channel = ChannelState::Running;
                info!(
                    domid = self.domid,
                    devid = self.devid,
                    pid,
                    minor,
                    sectors,
                    "image opened"
                );
                Ok(Progress::Again)
            }

            (ChannelState::Running, ChannelState::Paused) => {
                let (pid, minor) = self.endpoints()?;
                self.channel = ChannelState::WaitPause;
                tap.pause(pid, minor)?;
                self.channel = ChannelState::Paused;
                if self.state == VbdState::Pausing {
                    self.state = VbdState::Paused;
                }
                Ok(Progress::Again)
            }

            (ChannelState::Paused, ChannelState::Running) => {
                let (pid, minor) = self.endpoints()?;
                self.channel = ChannelState::WaitResume;
                tap.resume(pid, minor)?;
                self.channel = ChannelState::Running;
                Ok(Progress::Again)
            }

            // Tear-down from any live state
            (
                ChannelState::Running | ChannelState::Paused | ChannelState::Pid,
                ChannelState::Closed,
            ) => {
                let (pid, minor) = self.endpoints()?;
                let force = self.shutdown == ShutdownState::ForceDown;
                self.channel = ChannelState::WaitClose;
                tap.close(pid, minor, force)?;
                tap.detach_free(pid, minor)?;
                self.pid = None;
                self.channel = ChannelState::Closed;
                info!(domid = self.domid, devid = self.devid, "channel closed");
                Ok(Progress::Again)
            }

            // Closed is terminal for a dead/broken VBD; a fresh launch goes
            // through Dead again when the device is recycled.
            (from, to) => Err(Error::state(format!(
                "no transition from {:?} toward {:?}",
                from, to
            ))),
        }
    }

    fn endpoints(&self) -> Result<(i32, u32)> {
        match (self.pid, self.minor) {
            (Some(pid), Some(minor)) => Ok((pid, minor)),
            _ => Err(Error::state("channel has no tapdisk endpoints")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted TapClient recording the calls it receives
    #[derive(Default)]
    struct MockTap {
        calls: Vec<String>,
        fail_open: bool,
    }

    impl TapClient for MockTap {
        fn find_by_minor(&mut self, _minor: u32) -> Result<Option<i32>> {
            Ok(Some(100))
        }
        fn create(&mut self) -> Result<(i32, u32)> {
            self.calls.push("create".into());
            Ok((100, 0))
        }
        fn open(&mut self, _: i32, _: u32, params: &str, _: bool) -> Result<()> {
            self.calls.push(format!("open {}", params));
            if self.fail_open {
                return Err(Error::from_errno(libc::ENOENT, "no such image"));
            }
            Ok(())
        }
        fn pause(&mut self, _: i32, _: u32) -> Result<()> {
            self.calls.push("pause".into());
            Ok(())
        }
        fn resume(&mut self, _: i32, _: u32) -> Result<()> {
            self.calls.push("resume".into());
            Ok(())
        }
        fn close(&mut self, _: i32, _: u32, force: bool) -> Result<()> {
            self.calls.push(format!("close force={}", force));
            Ok(())
        }
        fn detach_free(&mut self, _: i32, _: u32) -> Result<()> {
            self.calls.push("detach_free".into());
            Ok(())
        }
        fn disk_info(&mut self, _: i32, _: u32) -> Result<(u64, u32, u32)> {
            Ok((8192, 512, 0))
        }
        fn connect_ring(
            &mut self,
            _: i32,
            _: u32,
            _: u32,
            _: u32,
            _: &RingInfo,
        ) -> Result<()> {
            self.calls.push("connect_ring".into());
            Ok(())
        }
        fn disconnect_ring(&mut self, _: i32, _: u32, _: u32, _: u32) -> Result<()> {
            self.calls.push("disconnect_ring".into());
            Ok(())
        }
    }

    fn ready_vbd() -> Vbd {
        let mut vbd = Vbd::new(1, 51712, "backend/vbd/1/51712".into());
        vbd.params = Some("vhd:/images/a.vhd".into());
        vbd.mode_rw = true;
        vbd.hotplug_connected = true;
        vbd
    }

    fn drive_until_done(vbd: &mut Vbd, tap: &mut MockTap) {
        for _ in 0..10 {
            if vbd.drive(tap).unwrap() == Progress::Done {
                return;
            }
        }
        panic!("channel never settled: {:?}", vbd.channel);
    }

    #[test]
    fn test_target_table() {
        let mut vbd = ready_vbd();
        assert_eq!(vbd.target(), ChannelState::Running);
        vbd.state = VbdState::Pausing;
        assert_eq!(vbd.target(), ChannelState::Paused);
        vbd.state = VbdState::Broken;
        assert_eq!(vbd.target(), ChannelState::Closed);
        vbd.state = VbdState::Unpaused;
        vbd.shutdown = ShutdownState::Down;
        assert_eq!(vbd.target(), ChannelState::Closed);
    }

    #[test]
    fn test_bring_up_sequence() {
        let mut vbd = ready_vbd();
        let mut tap = MockTap::default();
        drive_until_done(&mut vbd, &mut tap);
        assert_eq!(vbd.channel, ChannelState::Running);
        assert_eq!(vbd.sectors, 8192);
        assert_eq!(
            tap.calls,
            vec!["create".to_string(), "open vhd:/images/a.vhd".to_string()]
        );
    }

    #[test]
    fn test_launch_waits_for_hotplug() {
        let mut vbd = ready_vbd();
        vbd.hotplug_connected = false;
        let mut tap = MockTap::default();
        assert_eq!(vbd.drive(&mut tap).unwrap(), Progress::Again);
        assert!(tap.calls.is_empty());
        assert_eq!(vbd.channel, ChannelState::Dead);
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut vbd = ready_vbd();
        let mut tap = MockTap::default();
        drive_until_done(&mut vbd, &mut tap);

        vbd.state = VbdState::Pausing;
        drive_until_done(&mut vbd, &mut tap);
        assert_eq!(vbd.channel, ChannelState::Paused);
        assert_eq!(vbd.state, VbdState::Paused);

        vbd.state = VbdState::Unpaused;
        drive_until_done(&mut vbd, &mut tap);
        assert_eq!(vbd.channel, ChannelState::Running);
        assert!(tap.calls.contains(&"pause".to_string()));
        assert!(tap.calls.contains(&"resume".to_string()));
    }

    #[test]
    fn test_shutdown_closes_channel() {
        let mut vbd = ready_vbd();
        let mut tap = MockTap::default();
        drive_until_done(&mut vbd, &mut tap);

        vbd.shutdown = ShutdownState::Down;
        drive_until_done(&mut vbd, &mut tap);
        assert_eq!(vbd.channel, ChannelState::Closed);
        assert!(tap.calls.contains(&"close force=false".to_string()));
        assert!(tap.calls.contains(&"detach_free".to_string()));
    }

    #[test]
    fn test_force_shutdown() {
        let mut vbd = ready_vbd();
        let mut tap = MockTap::default();
        drive_until_done(&mut vbd, &mut tap);
        vbd.shutdown = ShutdownState::ForceDown;
        drive_until_done(&mut vbd, &mut tap);
        assert!(tap.calls.contains(&"close force=true".to_string()));
    }

    #[test]
    fn test_open_failure_leaves_wait_open() {
        let mut vbd = ready_vbd();
        let mut tap = MockTap {
            fail_open: true,
            ..Default::default()
        };
        // create step
        assert_eq!(vbd.drive(&mut tap).unwrap(), Progress::Again);
        // open step fails
        assert!(vbd.drive(&mut tap).is_err());
        assert_eq!(vbd.channel, ChannelState::WaitOpen);
        // busy channel only reports Again
        assert_eq!(vbd.drive(&mut tap).unwrap(), Progress::Again);
    }

    #[test]
    fn test_xenbus_state_codec() {
        assert_eq!(XenbusState::from_u32(4), Some(XenbusState::Connected));
        assert_eq!(XenbusState::from_u32(9), None);
        assert_eq!(XenbusState::Connected as u32, 4);
    }
}
