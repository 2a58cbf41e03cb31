//! # blktap VHD engine
//!
//! The storage half of the blktap stack: a byte-exact implementation of the
//! VHD dynamic/differencing image format.
//!
//! - [`codec`]: on-disk structure parsing and emission
//! - [`context`]: one open image with cached metadata, block allocation
//! - [`io`]: sector-granular reads and writes across a parent chain
//! - [`journal`]: crash-safe wrapper for destructive metadata updates
//! - [`create`]: image creation and snapshots
//!
//! ```rust,no_run
//! use blktap_vhd::{VhdChain, OpenFlags};
//!
//! # fn main() -> blktap_core::Result<()> {
//! let mut chain = VhdChain::open("/images/leaf.vhd", OpenFlags::RDONLY)?;
//! let mut sector = vec![0u8; 512];
//! chain.read_sectors(0, &mut sector)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod context;
pub mod create;
pub mod geometry;
pub mod io;
pub mod journal;
pub mod paths;
pub mod time;

pub use codec::{Bat, DiskType, Footer, ParentLocator, PlatformCode, SparseHeader};
pub use context::{find_snapshot_target, OpenFlags, VhdContext};
pub use create::{create_dynamic, create_fixed, snapshot, CreateOptions};
pub use io::{coalesce, VhdChain};
pub use journal::{open_with_recovery, JournalMode, VhdJournal};
