//! VHD on-disk structure codec
//!
//! Pure functions between in-memory structs and byte buffers. All scalars are
//! big-endian on disk and native integers in memory; endianness is converted
//! here and nowhere else. Decoding preserves reserved regions byte-for-byte
//! so that `encode(decode(bytes)) == bytes` for any valid input.

use blktap_core::{Error, Result};
use uuid::Uuid;

use crate::geometry::Geometry;

/// Footer cookie, first 8 bytes of the mirror and trailing footer
pub const HD_COOKIE: &[u8; 8] = b"conectix";

/// Sparse header cookie
pub const DD_COOKIE: &[u8; 8] = b"cxsparse";

/// Batmap header cookie
pub const BATMAP_COOKIE: &[u8; 8] = b"tdbatmap";

/// Size of the footer in bytes
pub const FOOTER_SIZE: usize = 512;

/// Size of the sparse header in bytes
pub const HEADER_SIZE: usize = 1024;

/// BAT sentinel for a block that has never been allocated
pub const BAT_UNUSED: u32 = 0xFFFF_FFFF;

/// Footer/header file-format version `(major << 16) | minor`
pub const FF_VERSION: u32 = 0x0001_0000;

/// Sparse header version
pub const DD_VERSION: u32 = 0x0001_0000;

/// Batmap version currently written
pub const BATMAP_VERSION: u32 = 0x0001_0002;

/// Default block size, 2 MiB
pub const BLOCK_SIZE_DEFAULT: u32 = 0x0020_0000;

/// Creator application tag written into new images
pub const CREATOR_APP: &[u8; 4] = b"tap\0";

/// Creator version `(major << 16) | minor`, currently 1.3
pub const CREATOR_VERSION: u32 = 0x0001_0003;

/// Creator OS code for Windows, also what we stamp on new images
pub const CREATOR_OS_WINDOWS: u32 = 0x5769_326B;

bitflags::bitflags! {
    /// Footer feature bits. `RESERVED` must always be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const TEMPORARY = 0x0000_0001;
        const RESERVED  = 0x0000_0002;
    }
}

/// Disk type stored in the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            _ => Err(Error::format(format!("unknown disk type {}", value))),
        }
    }

    /// Dynamic and differencing disks carry a sparse header and BAT
    pub fn is_sparse(&self) -> bool {
        matches!(self, DiskType::Dynamic | DiskType::Differencing)
    }
}

/// Parent-locator platform code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PlatformCode {
    None = 0,
    /// Deprecated Windows relative path
    Wi2r = 0x5769_3272,
    /// Deprecated Windows absolute path
    Wi2k = 0x5769_326B,
    /// Windows relative path, UTF-16LE
    W2ru = 0x5732_7275,
    /// Windows absolute path, UTF-16LE
    W2ku = 0x5732_6B75,
    /// MacOS alias blob
    Mac = 0x4D61_6320,
    /// UTF-8 file URL per RFC 2396
    MacX = 0x4D61_6358,
}

impl PlatformCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(PlatformCode::None),
            0x5769_3272 => Some(PlatformCode::Wi2r),
            0x5769_326B => Some(PlatformCode::Wi2k),
            0x5732_7275 => Some(PlatformCode::W2ru),
            0x5732_6B75 => Some(PlatformCode::W2ku),
            0x4D61_6320 => Some(PlatformCode::Mac),
            0x4D61_6358 => Some(PlatformCode::MacX),
            _ => None,
        }
    }
}

/// Ones-complement checksum over `bytes`, reading the `skip` range as zero.
///
/// This is the checksum algorithm shared by the footer, the sparse header
/// and the batmap: fold every byte into a wrapping u32 sum, complement the
/// result.
pub fn checksum(bytes: &[u8], skip: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if skip.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(b as u32);
    }
    !sum
}

/// The generic disk footer, present in all VHD files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub features: Features,
    pub ff_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub orig_size: u64,
    pub curr_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: Uuid,
    pub saved: u8,
    /// tapdisk extension: VDI hidden from enumeration
    pub hidden: u8,
    pub reserved: [u8; 426],
}

impl Footer {
    /// Decode a footer from its 512 on-disk bytes.
    ///
    /// Rejects a bad cookie or unknown disk type; checksum and version
    /// enforcement live in [`validate`](Self::validate) so that recovery
    /// paths can inspect a partially damaged footer.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_SIZE {
            return Err(Error::format("footer short read"));
        }
        if &bytes[0..8] != HD_COOKIE {
            return Err(Error::format(format!(
                "bad footer cookie {:?}",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&bytes[68..84]);
        let mut reserved = [0u8; 426];
        reserved.copy_from_slice(&bytes[86..512]);

        Ok(Self {
            features: Features::from_bits_retain(be32(&bytes[8..12])),
            ff_version: be32(&bytes[12..16]),
            data_offset: be64(&bytes[16..24]),
            timestamp: be32(&bytes[24..28]),
            creator_app,
            creator_version: be32(&bytes[32..36]),
            creator_os: be32(&bytes[36..40]),
            orig_size: be64(&bytes[40..48]),
            curr_size: be64(&bytes[48..56]),
            geometry: Geometry::from_encoded(be32(&bytes[56..60])),
            disk_type: DiskType::from_u32(be32(&bytes[60..64]))?,
            checksum: be32(&bytes[64..68]),
            uuid: Uuid::from_bytes(uuid_bytes),
            saved: bytes[84],
            hidden: bytes[85],
            reserved,
        })
    }

    /// Encode to the 512 on-disk bytes, emitting the stored checksum as-is
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut b = [0u8; FOOTER_SIZE];
        b[0..8].copy_from_slice(HD_COOKIE);
        b[8..12].copy_from_slice(&self.features.bits().to_be_bytes());
        b[12..16].copy_from_slice(&self.ff_version.to_be_bytes());
        b[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        b[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        b[28..32].copy_from_slice(&self.creator_app);
        b[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        b[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        b[40..48].copy_from_slice(&self.orig_size.to_be_bytes());
        b[48..56].copy_from_slice(&self.curr_size.to_be_bytes());
        b[56..60].copy_from_slice(&self.geometry.encode().to_be_bytes());
        b[60..64].copy_from_slice(&(self.disk_type as u32).to_be_bytes());
        b[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        b[68..84].copy_from_slice(self.uuid.as_bytes());
        b[84] = self.saved;
        b[85] = self.hidden;
        b[86..512].copy_from_slice(&self.reserved);
        b
    }

    /// Recompute the checksum over the current field values
    pub fn compute_checksum(&self) -> u32 {
        checksum(&self.encode(), 64..68)
    }

    /// Stamp a freshly computed checksum into the struct
    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Enforce version and checksum
    pub fn validate(&self) -> Result<()> {
        if self.ff_version >> 16 != 1 {
            return Err(Error::format(format!(
                "unsupported footer version {:#010x}",
                self.ff_version
            )));
        }
        let want = self.compute_checksum();
        if self.checksum != want {
            return Err(Error::format(format!(
                "footer checksum {:#010x} != {:#010x}",
                self.checksum, want
            )));
        }
        Ok(())
    }
}

/// One of the eight parent-locator slots in the sparse header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParentLocator {
    pub code: u32,
    /// Sectors reserved on disk for the locator payload
    pub data_space: u32,
    /// Bytes of the payload actually used
    pub data_len: u32,
    pub res: u32,
    /// Absolute file offset of the payload
    pub data_offset: u64,
}

impl ParentLocator {
    pub const SIZE: usize = 24;

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            code: be32(&bytes[0..4]),
            data_space: be32(&bytes[4..8]),
            data_len: be32(&bytes[8..12]),
            res: be32(&bytes[12..16]),
            data_offset: be64(&bytes[16..24]),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.code.to_be_bytes());
        b[4..8].copy_from_slice(&self.data_space.to_be_bytes());
        b[8..12].copy_from_slice(&self.data_len.to_be_bytes());
        b[12..16].copy_from_slice(&self.res.to_be_bytes());
        b[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        b
    }

    pub fn platform(&self) -> Option<PlatformCode> {
        PlatformCode::from_u32(self.code)
    }

    pub fn is_empty(&self) -> bool {
        self.code == PlatformCode::None as u32
    }
}

/// The sparse disk header, present in dynamic and differencing files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    /// Offset of the next structure; reserved, must be all-ones
    pub data_offset: u64,
    /// Absolute file offset of the BAT
    pub table_offset: u64,
    pub hdr_version: u32,
    pub max_bat_size: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: Uuid,
    pub parent_timestamp: u32,
    pub res1: u32,
    /// Parent name, UTF-16BE, NUL padded
    pub parent_name: [u8; 512],
    pub locators: [ParentLocator; 8],
    pub res2: [u8; 256],
}

impl SparseHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::format("sparse header short read"));
        }
        if &bytes[0..8] != DD_COOKIE {
            return Err(Error::format(format!(
                "bad header cookie {:?}",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&bytes[40..56]);
        let mut parent_name = [0u8; 512];
        parent_name.copy_from_slice(&bytes[64..576]);
        let mut locators = [ParentLocator::default(); 8];
        for (i, loc) in locators.iter_mut().enumerate() {
            let at = 576 + i * ParentLocator::SIZE;
            *loc = ParentLocator::decode(&bytes[at..at + ParentLocator::SIZE]);
        }
        let mut res2 = [0u8; 256];
        res2.copy_from_slice(&bytes[768..1024]);

        Ok(Self {
            data_offset: be64(&bytes[8..16]),
            table_offset: be64(&bytes[16..24]),
            hdr_version: be32(&bytes[24..28]),
            max_bat_size: be32(&bytes[28..32]),
            block_size: be32(&bytes[32..36]),
            checksum: be32(&bytes[36..40]),
            parent_uuid: Uuid::from_bytes(parent_uuid),
            parent_timestamp: be32(&bytes[56..60]),
            res1: be32(&bytes[60..64]),
            parent_name,
            locators,
            res2,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..8].copy_from_slice(DD_COOKIE);
        b[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        b[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        b[24..28].copy_from_slice(&self.hdr_version.to_be_bytes());
        b[28..32].copy_from_slice(&self.max_bat_size.to_be_bytes());
        b[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        b[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        b[40..56].copy_from_slice(self.parent_uuid.as_bytes());
        b[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        b[60..64].copy_from_slice(&self.res1.to_be_bytes());
        b[64..576].copy_from_slice(&self.parent_name);
        for (i, loc) in self.locators.iter().enumerate() {
            let at = 576 + i * ParentLocator::SIZE;
            b[at..at + ParentLocator::SIZE].copy_from_slice(&loc.encode());
        }
        b[768..1024].copy_from_slice(&self.res2);
        b
    }

    pub fn compute_checksum(&self) -> u32 {
        checksum(&self.encode(), 36..40)
    }

    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Enforce version, checksum, the reserved data offset, and a sane
    /// power-of-two block size
    pub fn validate(&self) -> Result<()> {
        if self.hdr_version != DD_VERSION {
            return Err(Error::format(format!(
                "unsupported header version {:#010x}",
                self.hdr_version
            )));
        }
        if self.data_offset != u64::MAX {
            return Err(Error::format("header data offset must be unused"));
        }
        if !self.block_size.is_power_of_two()
            || self.block_size < blktap_core::SECTOR_SIZE as u32
            || self.block_size > 1 << 28
        {
            return Err(Error::format(format!(
                "bad block size {:#x}",
                self.block_size
            )));
        }
        if self.res1 != 0 {
            return Err(Error::format("header reserved field set"));
        }
        let want = self.compute_checksum();
        if self.checksum != want {
            return Err(Error::format(format!(
                "header checksum {:#010x} != {:#010x}",
                self.checksum, want
            )));
        }
        Ok(())
    }

    /// Decode the UTF-16BE parent name, trimmed at the first NUL
    pub fn parent_name(&self) -> Option<String> {
        let end = self
            .parent_name
            .chunks_exact(2)
            .position(|c| c == [0, 0])
            .map(|p| p * 2)
            .unwrap_or(self.parent_name.len());
        if end == 0 {
            return None;
        }
        let (name, _, bad) =
            encoding_rs::UTF_16BE.decode(&self.parent_name[..end]);
        if bad {
            None
        } else {
            Some(name.into_owned())
        }
    }

    /// Store `name` as the UTF-16BE parent name
    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let mut buf = [0u8; 512];
        let mut at = 0;
        for unit in name.encode_utf16() {
            if at + 2 > buf.len() {
                return Err(Error::invalid_arg("parent name too long"));
            }
            buf[at..at + 2].copy_from_slice(&unit.to_be_bytes());
            at += 2;
        }
        self.parent_name = buf;
        Ok(())
    }
}

/// The block allocation table: one absolute sector offset per virtual block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bat {
    entries: Vec<u32>,
}

impl Bat {
    pub fn new(entries: usize) -> Self {
        Self {
            entries: vec![BAT_UNUSED; entries],
        }
    }

    /// Decode `count` big-endian entries
    pub fn decode(bytes: &[u8], count: usize) -> Result<Self> {
        if bytes.len() < count * 4 {
            return Err(Error::format("BAT short read"));
        }
        let entries = bytes[..count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { entries })
    }

    /// Encode to big-endian bytes, padded with zeros to a sector boundary
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size());
        for e in &self.entries {
            out.extend_from_slice(&e.to_be_bytes());
        }
        out.resize(self.byte_size(), 0);
        out
    }

    /// On-disk size: entries rounded up to a whole sector
    pub fn byte_size(&self) -> usize {
        let raw = self.entries.len() * 4;
        (raw + 511) & !511
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sector offset of `block`, or `None` when unallocated
    pub fn get(&self, block: usize) -> Option<u32> {
        match self.entries.get(block) {
            Some(&BAT_UNUSED) | None => None,
            Some(&sec) => Some(sec),
        }
    }

    pub fn set(&mut self, block: usize, sector: u32) {
        self.entries[block] = sector;
    }

    pub fn raw(&self, block: usize) -> u32 {
        self.entries[block]
    }

    /// Grow the table; new entries start unused. Shrinking is not a thing
    /// the BAT does.
    pub fn grow(&mut self, entries: usize) {
        if entries > self.entries.len() {
            self.entries.resize(entries, BAT_UNUSED);
        }
    }

    /// True when no block has ever been allocated; a differencing image in
    /// this state is logically empty and reads entirely from its parent
    pub fn is_unallocated(&self) -> bool {
        self.entries.iter().all(|&e| e == BAT_UNUSED)
    }

    /// First sector past every allocated block's data, given the per-block
    /// extent in sectors
    pub fn end_of_data(&self, sectors_per_entry: u32) -> Option<u64> {
        self.entries
            .iter()
            .filter(|&&e| e != BAT_UNUSED)
            .map(|&e| e as u64 + sectors_per_entry as u64)
            .max()
    }
}

/// Batmap header, guarding the fully-allocated-block bitmap extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatmapHeader {
    /// Absolute file offset of the batmap payload
    pub batmap_offset: u64,
    /// Payload size in sectors
    pub batmap_size: u32,
    pub batmap_version: u32,
    /// Ones-complement checksum of the payload bytes
    pub checksum: u32,
    pub marker: u8,
}

impl BatmapHeader {
    /// Serialized length; the header occupies a whole sector on disk
    pub const SIZE: usize = 29;

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::format("batmap header short read"));
        }
        if &bytes[0..8] != BATMAP_COOKIE {
            return Err(Error::format("bad batmap cookie"));
        }
        Ok(Self {
            batmap_offset: be64(&bytes[8..16]),
            batmap_size: be32(&bytes[16..20]),
            batmap_version: be32(&bytes[20..24]),
            checksum: be32(&bytes[24..28]),
            marker: bytes[28],
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..8].copy_from_slice(BATMAP_COOKIE);
        b[8..16].copy_from_slice(&self.batmap_offset.to_be_bytes());
        b[16..20].copy_from_slice(&self.batmap_size.to_be_bytes());
        b[20..24].copy_from_slice(&self.batmap_version.to_be_bytes());
        b[24..28].copy_from_slice(&self.checksum.to_be_bytes());
        b[28] = self.marker;
        b
    }

    pub fn validate(&self, payload: &[u8]) -> Result<()> {
        if self.batmap_version >> 16 != 1 {
            return Err(Error::format(format!(
                "unsupported batmap version {:#010x}",
                self.batmap_version
            )));
        }
        let want = checksum(payload, 0..0);
        if self.checksum != want {
            return Err(Error::format(format!(
                "batmap checksum {:#010x} != {:#010x}",
                self.checksum, want
            )));
        }
        Ok(())
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
        bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::vhd_time_now;

    pub(crate) fn sample_footer(size: u64, disk_type: DiskType) -> Footer {
        let mut footer = Footer {
            features: Features::RESERVED,
            ff_version: FF_VERSION,
            data_offset: if disk_type == DiskType::Fixed {
                u64::MAX
            } else {
                512
            },
            timestamp: vhd_time_now(),
            creator_app: *CREATOR_APP,
            creator_version: CREATOR_VERSION,
            creator_os: CREATOR_OS_WINDOWS,
            orig_size: size,
            curr_size: size,
            geometry: Geometry::for_capacity(size),
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

    #[test]
    fn test_footer_round_trip() {
        let footer = sample_footer(64 * 1024 * 1024, DiskType::Dynamic);
        let bytes = footer.encode();
        let parsed = Footer::decode(&bytes).unwrap();
        assert_eq!(parsed, footer);
        assert_eq!(parsed.encode(), bytes);
        parsed.validate().unwrap();
    }

    #[test]
    fn test_footer_checksum_is_ones_complement_fold() {
        let footer = sample_footer(1 << 30, DiskType::Fixed);
        let bytes = footer.encode();
        let mut sum: u32 = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if (64..68).contains(&i) {
                continue;
            }
            sum = sum.wrapping_add(b as u32);
        }
        assert_eq!(footer.checksum, !sum);
    }

    #[test]
    fn test_footer_bad_cookie() {
        let mut bytes = sample_footer(1 << 20, DiskType::Fixed).encode();
        bytes[0..8].copy_from_slice(b"notvalid");
        assert!(Footer::decode(&bytes).is_err());
    }

    #[test]
    fn test_footer_checksum_mismatch() {
        let mut footer = sample_footer(1 << 20, DiskType::Fixed);
        footer.checksum ^= 0xFF;
        assert!(footer.validate().is_err());
    }

    #[test]
    fn test_footer_version_guard() {
        let mut footer = sample_footer(1 << 20, DiskType::Fixed);
        footer.ff_version = 0x0002_0000;
        footer.set_checksum();
        assert!(footer.validate().is_err());
    }

    pub(crate) fn sample_header(entries: u32, block_size: u32) -> SparseHeader {
        let mut header = SparseHeader {
            data_offset: u64::MAX,
            table_offset: 1536,
            hdr_version: DD_VERSION,
            max_bat_size: entries,
            block_size,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            res1: 0,
            parent_name: [0u8; 512],
            locators: [ParentLocator::default(); 8],
            res2: [0u8; 256],
        };
        header.set_checksum();
        header
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header(32, BLOCK_SIZE_DEFAULT);
        let bytes = header.encode();
        let parsed = SparseHeader::decode(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.encode(), bytes);
        parsed.validate().unwrap();
    }

    #[test]
    fn test_header_rejects_non_power_of_two_block() {
        let mut header = sample_header(32, BLOCK_SIZE_DEFAULT + 512);
        header.set_checksum();
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_header_rejects_used_data_offset() {
        let mut header = sample_header(32, BLOCK_SIZE_DEFAULT);
        header.data_offset = 1536;
        header.set_checksum();
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_parent_name_utf16be() {
        let mut header = sample_header(32, BLOCK_SIZE_DEFAULT);
        header.set_parent_name("/images/parent.vhd").unwrap();
        assert_eq!(header.parent_name(), Some("/images/parent.vhd".into()));
        // On-disk bytes are big-endian: '/' encodes as 00 2F
        assert_eq!(&header.parent_name[..2], &[0x00, 0x2F]);
    }

    #[test]
    fn test_bat_codec() {
        let mut bat = Bat::new(3);
        bat.set(0, 0x1000);
        bat.set(2, 0x2000);
        let bytes = bat.encode();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[0..4], &0x1000u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &BAT_UNUSED.to_be_bytes());

        let parsed = Bat::decode(&bytes, 3).unwrap();
        assert_eq!(parsed.get(0), Some(0x1000));
        assert_eq!(parsed.get(1), None);
        assert_eq!(parsed.get(2), Some(0x2000));
    }

    #[test]
    fn test_bat_unallocated_probe() {
        let mut bat = Bat::new(4);
        assert!(bat.is_unallocated());
        assert_eq!(bat.end_of_data(4097), None);
        bat.set(1, 100);
        assert!(!bat.is_unallocated());
        assert_eq!(bat.end_of_data(4097), Some(100 + 4097));
    }

    #[test]
    fn test_batmap_header_round_trip() {
        let payload = vec![0xF0u8; 512];
        let header = BatmapHeader {
            batmap_offset: 4096,
            batmap_size: 1,
            batmap_version: BATMAP_VERSION,
            checksum: checksum(&payload, 0..0),
            marker: 0,
        };
        let bytes = header.encode();
        let parsed = BatmapHeader::decode(&bytes).unwrap();
        assert_eq!(parsed, header);
        parsed.validate(&payload).unwrap();
        assert!(parsed.validate(&payload[..256]).is_err());
    }

    #[test]
    fn test_parent_locator_round_trip() {
        let loc = ParentLocator {
            code: PlatformCode::MacX as u32,
            data_space: 1,
            data_len: 37,
            res: 0,
            data_offset: 0x3000,
        };
        let parsed = ParentLocator::decode(&loc.encode());
        assert_eq!(parsed, loc);
        assert_eq!(parsed.platform(), Some(PlatformCode::MacX));
        assert!(!parsed.is_empty());
        assert!(ParentLocator::default().is_empty());
    }
}
