//! # tapback
//!
//! The XenBus-driven backend for tapdisk VBDs: watches the configuration
//! store for devices, brings tapdisks up and down, and walks the four-way
//! handshake with guest frontends.
//!
//! - [`store`]: the config-store trait, the typed layer, an in-memory store
//! - [`xs`]: the XenStore socket client used in production
//! - [`vbd`]: per-device channel state machine
//! - [`backend`]: the watch-driven orchestrator
//! - [`frontend`]: the XenBus handshake
//! - [`tap`]: the production tapdisk client

pub mod backend;
pub mod frontend;
pub mod store;
pub mod tap;
pub mod vbd;
pub mod xs;

pub use backend::Backend;
pub use store::{device_printf, read_parse, ConfigStore, MemStore, StoreTx, WatchEvent};
pub use tap::SystemTapClient;
pub use vbd::{
    ChannelState, Progress, RingInfo, ShutdownState, TapClient, Vbd, VbdState,
    XenbusState,
};
pub use xs::XsSocketStore;
