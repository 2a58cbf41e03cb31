//! VHD image creation
//!
//! Lays out new dynamic, fixed and differencing images:
//!
//! ```text
//! +--------------------------------+
//! | footer mirror          (512 B) |
//! | sparse header         (1024 B) |
//! | BAT        (sector-aligned)    |
//! | batmap header + payload        |
//! | parent locators (diff only)    |
//! | ... data blocks ...            |
//! | footer                 (512 B) |
//! +--------------------------------+
//! ```

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use blktap_core::{bytes_to_secs, secs_to_bytes, Error, Result, SECTOR_SIZE};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::codec::{
    checksum, Bat, BatmapHeader, DiskType, Features, Footer, ParentLocator,
    PlatformCode, SparseHeader, BATMAP_VERSION, BLOCK_SIZE_DEFAULT, CREATOR_APP,
    CREATOR_OS_WINDOWS, CREATOR_VERSION, DD_VERSION, FF_VERSION, FOOTER_SIZE,
    HEADER_SIZE,
};
use crate::context::{OpenFlags, VhdContext};
use crate::geometry::Geometry;
use crate::paths;
use crate::time::{vhd_time, vhd_time_now};

/// Options for creating a sparse image
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub block_size: u32,
    /// Mark the image deletable-on-shutdown
    pub temporary: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE_DEFAULT,
            temporary: false,
        }
    }
}

fn new_footer(capacity: u64, disk_type: DiskType, temporary: bool) -> Footer {
    let mut features = Features::RESERVED;
    if temporary {
        features |= Features::TEMPORARY;
    }
    let mut footer = Footer {
        features,
        ff_version: FF_VERSION,
        data_offset: if disk_type == DiskType::Fixed {
            u64::MAX
        } else {
            FOOTER_SIZE as u64
        },
        timestamp: vhd_time_now(),
        creator_app: *CREATOR_APP,
        creator_version: CREATOR_VERSION,
        creator_os: CREATOR_OS_WINDOWS,
        orig_size: capacity,
        curr_size: capacity,
        geometry: Geometry::for_capacity(capacity),
        disk_type,
        checksum: 0,
        uuid: Uuid::new_v4(),
        saved: 0,
        hidden: 0,
        reserved: [0u8; 426],
    };
    footer.set_checksum();
    footer
}

/// VHD timestamp of a file's last modification, used as the parent
/// timestamp in differencing children
pub fn file_mtime(path: &Path) -> Result<u32> {
    let mtime = std::fs::metadata(path)?.modified()?;
    let at: DateTime<Utc> = mtime.into();
    Ok(vhd_time(at))
}

/// Create a fixed VHD: `capacity` zero bytes followed by the footer
pub fn create_fixed(path: impl AsRef<Path>, capacity: u64) -> Result<VhdContext> {
    let path = path.as_ref();
    if capacity == 0 || capacity % SECTOR_SIZE != 0 {
        return Err(Error::invalid_arg("capacity must be a sector multiple"));
    }
    let footer = new_footer(capacity, DiskType::Fixed, false);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(capacity)?;
    file.write_all_at(&footer.encode(), capacity)?;
    file.sync_all()?;
    drop(file);

    info!(path = %path.display(), capacity, "created fixed vhd");
    VhdContext::open(path, OpenFlags::RDWR)
}

/// Create a dynamic VHD of `capacity` bytes
pub fn create_dynamic(
    path: impl AsRef<Path>,
    capacity: u64,
    opts: &CreateOptions,
) -> Result<VhdContext> {
    create_sparse(path.as_ref(), capacity, opts, None)
}

/// Create a differencing child of `parent_path`.
///
/// The child inherits the parent's capacity and records its identity in the
/// header: uuid, file modification time, UTF-16 name, and both the W2ru
/// (relative) and MacX (file URL) locators.
pub fn snapshot(
    path: impl AsRef<Path>,
    parent_path: impl AsRef<Path>,
    opts: &CreateOptions,
) -> Result<VhdContext> {
    let parent_path = paths::canonpath(parent_path.as_ref())?;
    let parent = VhdContext::open(&parent_path, OpenFlags::RDONLY)?;
    create_sparse(
        path.as_ref(),
        parent.footer.curr_size,
        opts,
        Some((&parent, parent_path.as_path())),
    )
}

fn create_sparse(
    path: &Path,
    capacity: u64,
    opts: &CreateOptions,
    parent: Option<(&VhdContext, &Path)>,
) -> Result<VhdContext> {
    if capacity == 0 || capacity % SECTOR_SIZE != 0 {
        return Err(Error::invalid_arg("capacity must be a sector multiple"));
    }
    if !opts.block_size.is_power_of_two() || opts.block_size < SECTOR_SIZE as u32 {
        return Err(Error::invalid_arg("block size must be a power of two"));
    }

    let disk_type = if parent.is_some() {
        DiskType::Differencing
    } else {
        DiskType::Dynamic
    };
    let entries = bytes_to_secs(capacity)
        .div_ceil(opts.block_size as u64 / SECTOR_SIZE) as u32;

    let footer = new_footer(capacity, disk_type, opts.temporary);
    let bat = Bat::new(entries as usize);

    let table_offset = (FOOTER_SIZE + HEADER_SIZE) as u64;
    let batmap_header_offset = table_offset + bat.byte_size() as u64;
    let batmap_payload_offset = batmap_header_offset + SECTOR_SIZE;
    let batmap_size = bytes_to_secs(entries.div_ceil(8) as u64) as u32;
    let locator_offset = batmap_payload_offset + secs_to_bytes(batmap_size as u64);

    let mut header = SparseHeader {
        data_offset: u64::MAX,
        table_offset,
        hdr_version: DD_VERSION,
        max_bat_size: entries,
        block_size: opts.block_size,
        checksum: 0,
        parent_uuid: Uuid::nil(),
        parent_timestamp: 0,
        res1: 0,
        parent_name: [0u8; 512],
        locators: [ParentLocator::default(); 8],
        res2: [0u8; 256],
    };

    // Each locator gets one reserved sector; payloads are length-checked at
    // write time.
    let mut locator_payloads: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut locator_end = locator_offset;
    if let Some((parent_ctx, parent_abs)) = parent {
        header.parent_uuid = parent_ctx.footer.uuid;
        header.parent_timestamp = file_mtime(parent_abs)?;
        header.set_parent_name(
            parent_abs
                .to_str()
                .ok_or_else(|| Error::invalid_arg("non-UTF-8 parent path"))?,
        )?;

        let child_dir = paths::canonpath(path)?
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let locator_specs = [
            (PlatformCode::W2ru, paths::relative_to(&child_dir, parent_abs)),
            (PlatformCode::MacX, parent_abs.to_path_buf()),
        ];
        for (i, (code, stored)) in locator_specs.iter().enumerate() {
            let payload = paths::encode_locator_payload(*code, stored)?;
            if payload.len() as u64 > SECTOR_SIZE {
                return Err(Error::invalid_arg("parent path too long for locator"));
            }
            header.locators[i] = ParentLocator {
                code: *code as u32,
                data_space: 1,
                data_len: payload.len() as u32,
                res: 0,
                data_offset: locator_end,
            };
            locator_payloads.push((locator_end, payload.clone()));
            locator_end += SECTOR_SIZE;
        }
    }
    header.set_checksum();

    let batmap_payload = vec![0u8; secs_to_bytes(batmap_size as u64) as usize];
    let batmap_header = BatmapHeader {
        batmap_offset: batmap_payload_offset,
        batmap_size,
        batmap_version: BATMAP_VERSION,
        checksum: checksum(&batmap_payload, 0..0),
        marker: 0,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    let footer_bytes = footer.encode();
    file.write_all_at(&footer_bytes, 0)?;
    file.write_all_at(&header.encode(), FOOTER_SIZE as u64)?;
    file.write_all_at(&bat.encode(), table_offset)?;

    let mut sector = [0u8; SECTOR_SIZE as usize];
    sector[..BatmapHeader::SIZE].copy_from_slice(&batmap_header.encode());
    file.write_all_at(&sector, batmap_header_offset)?;
    file.write_all_at(&batmap_payload, batmap_payload_offset)?;

    for (offset, payload) in &locator_payloads {
        let mut padded = vec![0u8; SECTOR_SIZE as usize];
        padded[..payload.len()].copy_from_slice(payload);
        file.write_all_at(&padded, *offset)?;
    }

    file.write_all_at(&footer_bytes, locator_end)?;
    file.sync_all()?;
    drop(file);

    info!(
        path = %path.display(),
        capacity,
        ?disk_type,
        "created sparse vhd"
    );
    VhdContext::open(path, OpenFlags::RDWR)
}
