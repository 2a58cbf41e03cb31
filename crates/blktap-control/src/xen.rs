//! Ring connection control
//!
//! Once a guest frontend has advertised its shared ring, the backend tells
//! the owning tapdisk to map it. The ring itself is opaque here; these are
//! just the `XENBLKIF_CONNECT`/`DISCONNECT` request wrappers.

use blktap_core::Result;

use crate::ipc::{self, Deadline};
use crate::lifecycle::TapCtl;
use crate::message::{BlkifPayload, Message, MessageType, Payload};

/// Ring protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RingProtocol {
    Native = 1,
    X86_32 = 2,
    X86_64 = 3,
}

/// Parameters for binding a tapdisk to a frontend ring
#[derive(Debug, Clone)]
pub struct RingConnect {
    pub domid: u32,
    pub devid: u32,
    /// Grant references of the ring pages; `1 << order` of them are used
    pub grefs: Vec<u32>,
    pub order: u32,
    pub event_channel_port: u32,
    pub proto: RingProtocol,
    /// Grouping tag: VBDs sharing a pool share one event channel
    pub pool: Option<String>,
    pub poll_duration: u32,
    pub poll_idle_threshold: u32,
}

impl TapCtl {
    /// Instruct tapdisk `pid` to connect to the guest ring.
    ///
    /// `EALREADY` from the tapdisk is surfaced as `Busy`; callers restarted
    /// after an orderly shutdown treat it as success.
    pub fn connect_xenblkif(
        &self,
        pid: i32,
        minor: u32,
        connect: &RingConnect,
    ) -> Result<()> {
        let mut grefs = [0u32; 8];
        for (dst, src) in grefs.iter_mut().zip(connect.grefs.iter()) {
            *dst = *src;
        }
        let message = Message::new(
            MessageType::XenblkifConnect,
            minor as u16,
            Payload::Blkif(BlkifPayload {
                domid: connect.domid,
                devid: connect.devid,
                grefs,
                order: connect.order,
                port: connect.event_channel_port,
                proto: connect.proto as u32,
                pool: connect.pool.clone().unwrap_or_default(),
                poll_duration: connect.poll_duration,
                poll_idle_threshold: connect.poll_idle_threshold,
            }),
        );
        let mut sock = self.connect(pid)?;
        let reply = ipc::send_and_receive(&mut sock, &message, self.deadline())?;
        ipc::expect_response(&reply, MessageType::XenblkifConnectRsp)
    }

    /// Instruct tapdisk `pid` to unmap the guest ring
    pub fn disconnect_xenblkif(
        &self,
        pid: i32,
        minor: u32,
        domid: u32,
        devid: u32,
        deadline: Deadline,
    ) -> Result<()> {
        let message = Message::new(
            MessageType::XenblkifDisconnect,
            minor as u16,
            Payload::Blkif(BlkifPayload {
                domid,
                devid,
                ..Default::default()
            }),
        );
        let mut sock = self.connect(pid)?;
        let reply = ipc::send_and_receive(&mut sock, &message, deadline)?;
        ipc::expect_response(&reply, MessageType::XenblkifDisconnectRsp)
    }
}
