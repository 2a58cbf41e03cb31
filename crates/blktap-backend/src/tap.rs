//! Production tapdisk client
//!
//! Implements [`TapClient`] on top of the control-plane crate: real sockets,
//! real minors. The backend holds each created minor's marker lock through
//! the stored [`CreatedTap`]-equivalent hold until `detach_free`.

use std::collections::HashMap;
use std::time::Duration;

use blktap_control::{Deadline, MinorHold, OpenArgs, RingConnect, RingProtocol, TapCtl};
use blktap_core::{Error, Result};
use tracing::warn;

use crate::vbd::{RingInfo, TapClient};

/// Deadline applied to ring disconnects during tear-down
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SystemTapClient {
    ctl: TapCtl,
    holds: HashMap<u32, MinorHold>,
}

impl SystemTapClient {
    pub fn new(ctl: TapCtl) -> Self {
        Self {
            ctl,
            holds: HashMap::new(),
        }
    }

    /// System defaults: production control dir, sysfs, kernel ioctls
    pub fn system() -> Self {
        Self::new(TapCtl::system())
    }
}

impl TapClient for SystemTapClient {
    fn find_by_minor(&mut self, minor: u32) -> Result<Option<i32>> {
        Ok(self
            .ctl
            .list()?
            .into_iter()
            .find(|e| e.minor == Some(minor as i32))
            .and_then(|e| e.pid))
    }

    fn create(&mut self) -> Result<(i32, u32)> {
        let hold = self.ctl.allocate()?;
        let minor = hold.minor;
        match self.ctl.spawn() {
            Ok(pid) => match self.ctl.attach(pid, minor) {
                Ok(()) => {
                    self.holds.insert(minor, hold);
                    Ok((pid, minor))
                }
                Err(err) => {
                    drop(hold);
                    if let Err(free_err) = self.ctl.free(minor) {
                        warn!(minor, error = %free_err, "unwind free failed");
                    }
                    Err(err)
                }
            },
            Err(err) => {
                drop(hold);
                if let Err(free_err) = self.ctl.free(minor) {
                    warn!(minor, error = %free_err, "unwind free failed");
                }
                Err(err)
            }
        }
    }

    fn open(&mut self, pid: i32, minor: u32, params: &str, rw: bool) -> Result<()> {
        let mut args = OpenArgs::default();
        if !rw {
            args.flags |= blktap_control::MessageFlags::RDONLY;
        }
        self.ctl.open(pid, minor, params, &args)
    }

    fn pause(&mut self, pid: i32, minor: u32) -> Result<()> {
        self.ctl.pause(pid, minor)
    }

    fn resume(&mut self, pid: i32, minor: u32) -> Result<()> {
        self.ctl.unpause(pid, minor, None, &OpenArgs::default())
    }

    fn close(&mut self, pid: i32, minor: u32, force: bool) -> Result<()> {
        self.ctl.close(
            pid,
            minor,
            force,
            Deadline::after(blktap_control::ipc::COMM_RETRY_TIMEOUT),
        )
    }

    fn detach_free(&mut self, pid: i32, minor: u32) -> Result<()> {
        self.ctl.detach(pid, minor)?;
        self.holds.remove(&minor);
        self.ctl.free(minor)
    }

    fn disk_info(&mut self, pid: i32, minor: u32) -> Result<(u64, u32, u32)> {
        let info = self.ctl.disk_info(pid, minor)?;
        Ok((info.sectors, info.sector_size, info.info))
    }

    fn connect_ring(
        &mut self,
        pid: i32,
        minor: u32,
        domid: u32,
        devid: u32,
        ring: &RingInfo,
    ) -> Result<()> {
        let proto = match ring.protocol.as_deref() {
            Some("x86_32-abi") => RingProtocol::X86_32,
            Some("x86_64-abi") => RingProtocol::X86_64,
            None => RingProtocol::Native,
            Some(other) => {
                return Err(Error::invalid_arg(format!(
                    "unknown ring protocol '{}'",
                    other
                )))
            }
        };
        self.ctl.connect_xenblkif(
            pid,
            minor,
            &RingConnect {
                domid,
                devid,
                grefs: ring.grefs.clone(),
                order: ring.order,
                event_channel_port: ring.event_channel,
                proto,
                pool: None,
                poll_duration: 0,
                poll_idle_threshold: 0,
            },
        )
    }

    fn disconnect_ring(
        &mut self,
        pid: i32,
        minor: u32,
        domid: u32,
        devid: u32,
    ) -> Result<()> {
        self.ctl.disconnect_xenblkif(
            pid,
            minor,
            domid,
            devid,
            Deadline::after(DISCONNECT_TIMEOUT),
        )
    }
}
