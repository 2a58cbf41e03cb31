//! # blktap core
//!
//! Foundational pieces shared by every layer of the blktap stack:
//!
//! - **Errors**: the one error taxonomy the whole stack propagates, with a
//!   lossless projection onto OS errno values for process exit codes and the
//!   wire protocol's `response.error` field.
//! - **Units**: 512-byte sector arithmetic.
//! - **Bitmaps**: the bit-big-endian bitmaps used by the VHD on-disk format.

pub mod bitmap;
pub mod error;
pub mod units;

pub use bitmap::BitmapBE;
pub use error::{Error, Result};
pub use units::{bytes_to_secs, secs_to_bytes, SECTOR_SHIFT, SECTOR_SIZE};
