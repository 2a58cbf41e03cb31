//! VHD file context
//!
//! A [`VhdContext`] owns one open VHD file and caches its metadata regions:
//! footer, sparse header, BAT and batmap. Contexts are not shared within a
//! process; each `open` yields an independent handle. Cross-process
//! read-write sharing of one file is undefined behavior, the engine takes no
//! locks here.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use blktap_core::{bytes_to_secs, secs_to_bytes, BitmapBE, Error, Result, SECTOR_SIZE};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{
    checksum, Bat, BatmapHeader, DiskType, Footer, ParentLocator, PlatformCode,
    SparseHeader, FOOTER_SIZE, HEADER_SIZE,
};
use crate::paths;

bitflags::bitflags! {
    /// Open mode for a VHD context
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x01;
        const RDWR   = 0x02;
        /// Fail instead of recovering from a damaged primary footer
        const STRICT = 0x04;
    }
}

/// Cached batmap: its header plus the full-block bitmap payload
#[derive(Debug, Clone)]
pub struct Batmap {
    pub header: BatmapHeader,
    pub map: BitmapBE,
}

/// An open VHD file with cached metadata
pub struct VhdContext {
    file: File,
    path: PathBuf,
    flags: OpenFlags,
    pub footer: Footer,
    pub header: Option<SparseHeader>,
    pub bat: Option<Bat>,
    pub batmap: Option<Batmap>,
}

impl VhdContext {
    /// Open a VHD file.
    ///
    /// The authoritative footer is read from the file tail; when it fails to
    /// validate, the mirror at offset zero is tried and, on a writable
    /// non-strict open, rewritten over the damaged trailing copy.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writable = flags.contains(OpenFlags::RDWR);
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len < FOOTER_SIZE as u64 {
            return Err(Error::format("file too small for a VHD footer"));
        }

        let footer = Self::read_footer_with_recovery(&file, len, writable, flags)?;

        let mut ctx = Self {
            file,
            path,
            flags,
            footer,
            header: None,
            bat: None,
            batmap: None,
        };

        if ctx.footer.disk_type.is_sparse() {
            ctx.load_header()?;
            ctx.load_bat()?;
            ctx.load_batmap();
        }

        Ok(ctx)
    }

    fn read_footer_with_recovery(
        file: &File,
        len: u64,
        writable: bool,
        flags: OpenFlags,
    ) -> Result<Footer> {
        let mut buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut buf, len - FOOTER_SIZE as u64)?;

        let primary = Footer::decode(&buf).and_then(|f| f.validate().map(|_| f));
        match primary {
            Ok(footer) => Ok(footer),
            Err(err) if flags.contains(OpenFlags::STRICT) => Err(err),
            Err(err) => {
                warn!(error = %err, "trailing footer invalid, trying mirror");
                let mut head = [0u8; FOOTER_SIZE];
                file.read_exact_at(&mut head, 0)?;
                let footer = Footer::decode(&head)?;
                footer.validate()?;
                if writable {
                    file.write_all_at(&head, len - FOOTER_SIZE as u64)?;
                    file.sync_data()?;
                    debug!("trailing footer restored from mirror");
                }
                Ok(footer)
            }
        }
    }

    fn load_header(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        self.file.read_exact_at(&mut buf, self.footer.data_offset)?;
        let header = SparseHeader::decode(&buf)?;
        header.validate()?;
        self.header = Some(header);
        Ok(())
    }

    fn load_bat(&mut self) -> Result<()> {
        let header = self.header.as_ref().expect("sparse header loaded");
        let entries = header.max_bat_size as usize;
        let mut buf = vec![0u8; (entries * 4 + 511) & !511];
        self.file.read_exact_at(&mut buf, header.table_offset)?;
        self.bat = Some(Bat::decode(&buf, entries)?);
        Ok(())
    }

    /// An absent or damaged batmap is not an error; the extension merely
    /// loses its fast path.
    fn load_batmap(&mut self) {
        let Some(offset) = self.batmap_header_offset() else {
            return;
        };
        let mut buf = [0u8; SECTOR_SIZE as usize];
        if self.file.read_exact_at(&mut buf, offset).is_err() {
            return;
        }
        let Ok(header) = BatmapHeader::decode(&buf) else {
            return;
        };
        let mut payload = vec![0u8; secs_to_bytes(header.batmap_size as u64) as usize];
        if self.file.read_exact_at(&mut payload, header.batmap_offset).is_err() {
            warn!("batmap payload unreadable, ignoring batmap");
            return;
        }
        if let Err(err) = header.validate(&payload) {
            warn!(error = %err, "batmap invalid, ignoring");
            return;
        }
        self.batmap = Some(Batmap {
            header,
            map: BitmapBE::from_bytes(payload),
        });
    }

    /// File offset of the batmap header sector, directly after the BAT
    fn batmap_header_offset(&self) -> Option<u64> {
        let header = self.header.as_ref()?;
        let bat = self.bat.as_ref()?;
        Some(header.table_offset + bat.byte_size() as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_sparse(&self) -> bool {
        self.footer.disk_type.is_sparse()
    }

    pub fn is_differencing(&self) -> bool {
        self.footer.disk_type == DiskType::Differencing
    }

    pub fn has_batmap(&self) -> bool {
        self.batmap.is_some()
    }

    /// Virtual size in sectors
    pub fn virtual_sectors(&self) -> u64 {
        bytes_to_secs(self.footer.curr_size)
    }

    /// Sectors per block
    pub fn spb(&self) -> u32 {
        self.header
            .as_ref()
            .map(|h| h.block_size / SECTOR_SIZE as u32)
            .unwrap_or(0)
    }

    /// Per-block bitmap extent in sectors
    pub fn bitmap_sectors(&self) -> u32 {
        bytes_to_secs(self.spb() as u64 / 8) as u32
    }

    /// Whole per-block extent (bitmap + data) in sectors
    pub fn block_extent_sectors(&self) -> u32 {
        self.bitmap_sectors() + self.spb()
    }

    pub fn blocks(&self) -> usize {
        self.bat.as_ref().map(Bat::len).unwrap_or(0)
    }

    fn require_writable(&self) -> Result<()> {
        if !self.flags.contains(OpenFlags::RDWR) {
            return Err(Error::state("image opened read-only"));
        }
        Ok(())
    }

    fn map_enospc(err: std::io::Error, what: &str) -> Error {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            Error::OutOfSpace(what.to_string())
        } else {
            Error::Io(err)
        }
    }

    /// True when the batmap asserts every sector of `block` is present
    pub fn batmap_test(&self, block: usize) -> bool {
        self.batmap
            .as_ref()
            .map(|b| b.map.test(block))
            .unwrap_or(false)
    }

    /// Assert `block` fully present and persist the affected batmap state
    pub fn batmap_set(&mut self, block: usize) -> Result<()> {
        self.require_writable()?;
        let header_offset = self
            .batmap_header_offset()
            .ok_or_else(|| Error::state("image has no batmap"))?;
        let Some(batmap) = self.batmap.as_mut() else {
            return Err(Error::state("image has no batmap"));
        };
        batmap.map.set(block);
        batmap.header.checksum = checksum(batmap.map.as_bytes(), 0..0);

        self.file
            .write_all_at(batmap.map.as_bytes(), batmap.header.batmap_offset)?;
        let mut sector = [0u8; SECTOR_SIZE as usize];
        sector[..BatmapHeader::SIZE].copy_from_slice(&batmap.header.encode());
        self.file.write_all_at(&sector, header_offset)?;
        Ok(())
    }

    /// Read the allocation bitmap of `block`.
    ///
    /// Returns `None` for a hole (BAT entry unused). When the batmap asserts
    /// the block the on-disk bitmap is not consulted at all and a synthetic
    /// all-ones map is returned.
    pub fn read_bitmap(&self, block: usize) -> Result<Option<BitmapBE>> {
        let Some(bat) = self.bat.as_ref() else {
            return Err(Error::state("fixed image has no bitmaps"));
        };
        let Some(sector) = bat.get(block) else {
            return Ok(None);
        };

        let bytes = secs_to_bytes(self.bitmap_sectors() as u64) as usize;
        if self.batmap_test(block) {
            return Ok(Some(BitmapBE::from_bytes(vec![0xFF; bytes])));
        }

        let mut buf = vec![0u8; bytes];
        self.file.read_exact_at(&mut buf, secs_to_bytes(sector as u64))?;
        Ok(Some(BitmapBE::from_bytes(buf)))
    }

    /// Persist the allocation bitmap of an allocated `block`
    pub fn write_bitmap(&mut self, block: usize, map: &BitmapBE) -> Result<()> {
        self.require_writable()?;
        let sector = self
            .bat
            .as_ref()
            .and_then(|b| b.get(block))
            .ok_or_else(|| Error::state("bitmap write to unallocated block"))?;
        let want = secs_to_bytes(self.bitmap_sectors() as u64) as usize;
        if map.as_bytes().len() != want {
            return Err(Error::invalid_arg("bitmap length mismatch"));
        }
        self.file
            .write_all_at(map.as_bytes(), secs_to_bytes(sector as u64))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// First sector where new block data may be placed
    fn first_data_sector(&self) -> u64 {
        let header = self.header.as_ref().expect("sparse image");
        let bat = self.bat.as_ref().expect("sparse image");
        let mut end = header.table_offset + bat.byte_size() as u64;
        if let Some(batmap) = self.batmap.as_ref() {
            end = end.max(
                batmap.header.batmap_offset
                    + secs_to_bytes(batmap.header.batmap_size as u64),
            );
        }
        for loc in header.locators.iter().filter(|l| !l.is_empty()) {
            end = end.max(loc.data_offset + secs_to_bytes(loc.data_space as u64));
        }
        bytes_to_secs(end)
    }

    /// Allocate the backing extent for `block`.
    ///
    /// Appends a zeroed bitmap region and a zeroed data region at the end of
    /// data, moves the trailing footer past them, and only then publishes
    /// the BAT entry. A crash in between leaves the extent unreferenced,
    /// which a later allocation simply overwrites.
    pub fn allocate_block(&mut self, block: usize) -> Result<u32> {
        self.require_writable()?;
        let Some(bat) = self.bat.as_ref() else {
            return Err(Error::state("fixed image has no BAT"));
        };
        if block >= bat.len() {
            return Err(Error::invalid_arg(format!(
                "block {} out of range ({} entries)",
                block,
                bat.len()
            )));
        }
        if let Some(sector) = bat.get(block) {
            return Ok(sector);
        }

        let extent = self.block_extent_sectors();
        let sector = bat
            .end_of_data(extent)
            .unwrap_or(0)
            .max(self.first_data_sector());
        if sector > u32::MAX as u64 {
            return Err(Error::OutOfSpace("BAT offset overflow".into()));
        }

        let zeros = vec![0u8; secs_to_bytes(extent as u64) as usize];
        self.file
            .write_all_at(&zeros, secs_to_bytes(sector))
            .map_err(|e| Self::map_enospc(e, "block allocation"))?;

        let eof = secs_to_bytes(sector + extent as u64);
        self.file
            .write_all_at(&self.footer.encode(), eof)
            .map_err(|e| Self::map_enospc(e, "footer relocation"))?;
        self.file.sync_data()?;

        let header = self.header.as_ref().expect("sparse image");
        let entry_offset = header.table_offset + block as u64 * 4;
        self.file
            .write_all_at(&(sector as u32).to_be_bytes(), entry_offset)?;
        self.file.sync_data()?;

        self.bat.as_mut().expect("sparse image").set(block, sector as u32);
        debug!(block, sector, "allocated block");
        Ok(sector as u32)
    }

    /// Rewrite the trailing footer (and the mirror on sparse images)
    pub fn write_footer(&mut self) -> Result<()> {
        self.require_writable()?;
        let bytes = self.footer.encode();
        let len = self.file.metadata()?.len();
        self.file.write_all_at(&bytes, len - FOOTER_SIZE as u64)?;
        if self.is_sparse() {
            self.file.write_all_at(&bytes, 0)?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Rewrite the sparse header in place
    pub fn write_header(&mut self) -> Result<()> {
        self.require_writable()?;
        let header = self
            .header
            .as_mut()
            .ok_or_else(|| Error::state("fixed image has no header"))?;
        header.set_checksum();
        let bytes = header.encode();
        self.file.write_all_at(&bytes, self.footer.data_offset)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Grow the disk's current size.
    ///
    /// Shrinking below the current size is rejected; nothing in the stack
    /// defines what would happen to already-allocated blocks past the cut.
    /// Growing a sparse disk extends the BAT with unused entries, which
    /// must still fit the space reserved for the table at creation; a
    /// growth that would relocate the BAT is refused.
    pub fn set_phys_size(&mut self, new_size: u64) -> Result<()> {
        self.require_writable()?;
        if new_size < self.footer.curr_size {
            return Err(Error::invalid_arg(format!(
                "cannot shrink from {} to {}",
                self.footer.curr_size, new_size
            )));
        }
        if self.is_sparse() {
            self.grow_bat(new_size)?;
        }
        self.footer.curr_size = new_size;
        self.footer.geometry = crate::geometry::Geometry::for_capacity(new_size);
        self.footer.set_checksum();
        self.write_footer()
    }

    fn grow_bat(&mut self, new_size: u64) -> Result<()> {
        let header = self.header.as_ref().expect("sparse header");
        let bat = self.bat.as_ref().expect("bat");
        let entries =
            bytes_to_secs(new_size).div_ceil(self.spb() as u64) as usize;
        if entries <= bat.len() {
            return Ok(());
        }

        let reserved = self
            .batmap_header_offset()
            .expect("sparse image")
            - header.table_offset;
        if entries as u64 * 4 > reserved {
            return Err(Error::invalid_arg(format!(
                "size {} needs {} BAT entries, table holds {}",
                new_size,
                entries,
                reserved / 4
            )));
        }
        if let Some(batmap) = self.batmap.as_ref() {
            if entries > batmap.map.len_bits() {
                return Err(Error::invalid_arg("size exceeds batmap coverage"));
            }
        }

        let table_offset = header.table_offset;
        let bat = self.bat.as_mut().expect("bat");
        bat.grow(entries);
        let encoded = bat.encode();
        self.file.write_all_at(&encoded, table_offset)?;

        let header = self.header.as_mut().expect("sparse header");
        header.max_bat_size = entries as u32;
        self.write_header()
    }

    /// Flip the tapdisk "hidden" extension byte
    pub fn set_hidden(&mut self, hidden: bool) -> Result<()> {
        self.require_writable()?;
        self.footer.hidden = hidden as u8;
        self.footer.set_checksum();
        self.write_footer()
    }

    pub fn hidden(&self) -> bool {
        self.footer.hidden != 0
    }

    /// Resolve the parent path from the locator slots.
    ///
    /// All slots are read; `MacX` wins on this platform, then the UTF-16
    /// Windows codes.
    pub fn parent_locator_get(&self) -> Result<PathBuf> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::state("image has no parent"))?;
        if self.footer.disk_type != DiskType::Differencing {
            return Err(Error::state("image has no parent"));
        }

        let mut best: Option<(PlatformCode, ParentLocator)> = None;
        for loc in header.locators.iter() {
            let Some(code) = loc.platform() else { continue };
            if loc.is_empty() || loc.data_len == 0 {
                continue;
            }
            let rank = |c: PlatformCode| match c {
                PlatformCode::MacX => 3,
                PlatformCode::W2ku => 2,
                PlatformCode::W2ru => 1,
                _ => 0,
            };
            if rank(code) > best.map(|(c, _)| rank(c)).unwrap_or(0) {
                best = Some((code, *loc));
            }
        }

        let (code, loc) =
            best.ok_or_else(|| Error::format("no usable parent locator"))?;
        let mut payload = vec![0u8; loc.data_len as usize];
        self.file.read_exact_at(&mut payload, loc.data_offset)?;
        paths::decode_locator_payload(code, &payload, &self.path)
    }

    /// Rewrite locator slot `slot` to point at `parent`.
    ///
    /// The payload must fit the slot's reserved space; slots are sized at
    /// creation time and never move.
    pub fn parent_locator_set(
        &mut self,
        slot: usize,
        code: PlatformCode,
        parent: &Path,
    ) -> Result<()> {
        self.require_writable()?;
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::state("image has no header"))?;
        if slot >= header.locators.len() {
            return Err(Error::invalid_arg("locator slot out of range"));
        }
        let loc = header.locators[slot];
        if loc.is_empty() {
            return Err(Error::invalid_arg("locator slot unprovisioned"));
        }

        let stored = match code {
            PlatformCode::W2ru => {
                let dir = self.path.parent().unwrap_or(Path::new("."));
                paths::relative_to(dir, parent)
            }
            _ => paths::canonpath(parent)?,
        };
        let payload = paths::encode_locator_payload(code, &stored)?;
        if payload.len() as u64 > secs_to_bytes(loc.data_space as u64) {
            return Err(Error::invalid_arg("locator payload too large for slot"));
        }

        let mut padded = vec![0u8; secs_to_bytes(loc.data_space as u64) as usize];
        padded[..payload.len()].copy_from_slice(&payload);
        self.file.write_all_at(&padded, loc.data_offset)?;

        let header = self.header.as_mut().expect("sparse header");
        header.locators[slot].code = code as u32;
        header.locators[slot].data_len = payload.len() as u32;
        self.write_header()
    }

    /// Point this differencing image at a new parent: name, uuid, timestamp
    /// and both locator slots are rewritten.
    pub fn change_parent(&mut self, parent: &VhdContext) -> Result<()> {
        self.require_writable()?;
        if self.footer.disk_type != DiskType::Differencing {
            return Err(Error::state("not a differencing image"));
        }
        let parent_path = paths::canonpath(parent.path())?;
        let name = parent_path
            .to_str()
            .ok_or_else(|| Error::invalid_arg("non-UTF-8 parent path"))?
            .to_string();

        {
            let header = self.header.as_mut().expect("sparse header");
            header.parent_uuid = parent.footer.uuid;
            header.parent_timestamp = parent.footer.timestamp;
            header.set_parent_name(&name)?;
        }

        let slots: Vec<(usize, PlatformCode)> = self
            .header
            .as_ref()
            .expect("sparse header")
            .locators
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.platform().filter(|_| !l.is_empty()).map(|c| (i, c)))
            .filter(|(_, c)| matches!(c, PlatformCode::W2ru | PlatformCode::MacX))
            .collect();
        for (slot, code) in slots {
            self.parent_locator_set(slot, code, &parent_path)?;
        }
        self.write_header()?;
        self.write_footer()
    }

    /// Open this image's parent
    pub fn parent(&self) -> Result<Option<VhdContext>> {
        if !self.is_differencing() {
            return Ok(None);
        }
        let path = self.parent_locator_get()?;
        Ok(Some(VhdContext::open(path, OpenFlags::RDONLY)?))
    }

    /// Number of images in the chain, this one included
    pub fn chain_depth(&self) -> Result<u32> {
        let mut depth = 1;
        let mut current = self.parent()?;
        while let Some(ctx) = current {
            depth += 1;
            current = ctx.parent()?;
        }
        Ok(depth)
    }

    pub fn parent_uuid(&self) -> Option<Uuid> {
        self.header.as_ref().map(|h| h.parent_uuid)
    }

    /// Raw positioned read, used by the I/O and journal layers
    pub(crate) fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Raw positioned write
    pub(crate) fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Self::map_enospc(e, "write"))?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Walk from `path` to the deepest ancestor that actually holds data.
///
/// A differencing image whose BAT has never been populated is logically
/// empty; snapshot targeting skips through such hollow children.
pub fn find_snapshot_target(path: &Path) -> Result<PathBuf> {
    let mut current = path.to_path_buf();
    loop {
        let ctx = VhdContext::open(&current, OpenFlags::RDONLY)?;
        let hollow = ctx.is_differencing()
            && ctx.bat.as_ref().map(Bat::is_unallocated).unwrap_or(false);
        if !hollow {
            return Ok(current);
        }
        current = ctx.parent_locator_get()?;
    }
}
