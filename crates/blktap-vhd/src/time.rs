//! VHD timestamps
//!
//! The footer and header count seconds since 2000-01-01 00:00:00 UTC.

use chrono::{DateTime, TimeZone, Utc};

/// Unix timestamp of the VHD epoch
const VHD_EPOCH: i64 = 946_684_800;

/// Current time as a VHD timestamp
pub fn vhd_time_now() -> u32 {
    vhd_time(Utc::now())
}

/// Convert a wall-clock instant to a VHD timestamp
pub fn vhd_time(at: DateTime<Utc>) -> u32 {
    at.timestamp().saturating_sub(VHD_EPOCH).max(0) as u32
}

/// Convert a VHD timestamp back to a wall-clock instant
pub fn vhd_time_to_utc(ts: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(VHD_EPOCH + ts as i64, 0).unwrap()
}
