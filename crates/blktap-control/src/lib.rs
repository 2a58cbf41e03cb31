//! # blktap control plane
//!
//! Everything a management process needs to run tapdisks:
//!
//! - [`message`]: the typed fixed-frame control protocol
//! - [`ipc`]: framing over per-tapdisk UNIX sockets, with deadlines
//! - [`allocate`]: cross-process minor allocation and kernel device nodes
//! - [`spawn`]: tapdisk process launch
//! - [`lifecycle`]: attach/open/pause/close sequencing, `create`/`destroy`
//! - [`list`]: the live registry of tapdisks and minors
//! - [`xen`]: ring connect/disconnect requests

pub mod allocate;
pub mod ipc;
pub mod lifecycle;
pub mod list;
pub mod message;
pub mod spawn;
pub mod xen;

pub use allocate::{Allocator, KernelTapDevices, MinorHold, TapDevices, TapHandle};
pub use ipc::{Deadline, OpenTrailers};
pub use lifecycle::{CreatedTap, OpenArgs, TapCtl};
pub use list::{parse_params, TapEntry};
pub use message::{
    ImagePayload, Message, MessageFlags, MessageType, ParamsPayload, Payload,
    ResponsePayload,
};
pub use xen::{RingConnect, RingProtocol};
