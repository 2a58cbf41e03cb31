//! VHD metadata journal
//!
//! Destructive metadata updates (reparent, resize) are wrapped in an
//! external journal file holding pre-images of every region about to be
//! touched. The protocol: `create` snapshots all metadata, the caller
//! mutates the VHD, `commit` makes the mutation final. A journal file found
//! at open time means the mutation never committed, and `revert` replays the
//! pre-images in LIFO order before the VHD is used.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use blktap_core::{secs_to_bytes, Error, Result, SECTOR_SIZE};
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{checksum, FOOTER_SIZE, HEADER_SIZE};
use crate::context::{OpenFlags, VhdContext};

/// Journal header cookie
const JOURNAL_COOKIE: &[u8; 8] = b"vjournal";

/// Per-entry guard value
const ENTRY_COOKIE: u64 = 0xaaaa_1234_4321_aaaa;

const HEADER_BYTES: usize = 512;
const ENTRY_BYTES: usize = 32;

/// What a journal entry is a pre-image of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum EntryKind {
    Footer = 1,
    Header = 2,
    Locator = 3,
    Bat = 4,
    BatmapHeader = 5,
    Batmap = 6,
    Data = 7,
}

impl EntryKind {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            1 => EntryKind::Footer,
            2 => EntryKind::Header,
            3 => EntryKind::Locator,
            4 => EntryKind::Bat,
            5 => EntryKind::BatmapHeader,
            6 => EntryKind::Batmap,
            7 => EntryKind::Data,
            _ => return Err(Error::format(format!("bad journal entry kind {}", v))),
        })
    }
}

/// Journal mode for [`VhdJournal::add_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Pre-image the block's bitmap only
    Metadata,
    /// Pre-image the block's bitmap and data
    Data,
}

#[derive(Debug, Clone)]
struct JournalHeader {
    uuid: Uuid,
    vhd_footer_offset: u64,
    entries: u32,
    eof: u64,
}

impl JournalHeader {
    fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut b = [0u8; HEADER_BYTES];
        b[0..8].copy_from_slice(JOURNAL_COOKIE);
        b[8..24].copy_from_slice(self.uuid.as_bytes());
        b[24..32].copy_from_slice(&self.vhd_footer_offset.to_be_bytes());
        b[32..36].copy_from_slice(&self.entries.to_be_bytes());
        b[36..44].copy_from_slice(&self.eof.to_be_bytes());
        b
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_BYTES || &bytes[0..8] != JOURNAL_COOKIE {
            return Err(Error::format("bad journal header"));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[8..24]);
        Ok(Self {
            uuid: Uuid::from_bytes(uuid),
            vhd_footer_offset: u64::from_be_bytes(bytes[24..32].try_into().unwrap()),
            entries: u32::from_be_bytes(bytes[32..36].try_into().unwrap()),
            eof: u64::from_be_bytes(bytes[36..44].try_into().unwrap()),
        })
    }
}

/// An open journal wrapping a writable VHD context
pub struct VhdJournal {
    file: std::fs::File,
    path: PathBuf,
    header: JournalHeader,
    pub vhd: VhdContext,
}

impl VhdJournal {
    /// Create a journal for `vhd_path` and snapshot all its metadata.
    ///
    /// Fails if the journal file already exists; an existing journal means
    /// an earlier mutation never committed and must be reverted first.
    pub fn create(
        vhd_path: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let vhd = VhdContext::open(vhd_path, OpenFlags::RDWR)?;
        let path = journal_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::busy("journal already exists")
                } else {
                    Error::Io(e)
                }
            })?;

        let header = JournalHeader {
            uuid: vhd.footer.uuid,
            vhd_footer_offset: 0, // filled below
            entries: 0,
            eof: HEADER_BYTES as u64,
        };
        let mut journal = Self {
            file,
            path,
            header,
            vhd,
        };
        journal.header.vhd_footer_offset =
            journal.vhd.file_len()? - FOOTER_SIZE as u64;
        journal.write_header()?;
        journal.add_metadata()?;
        Ok(journal)
    }

    /// Open an existing journal, validating it against the VHD
    pub fn open(
        vhd_path: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let vhd = VhdContext::open(vhd_path, OpenFlags::RDWR)?;
        let path = journal_path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = [0u8; HEADER_BYTES];
        file.read_exact_at(&mut buf, 0)?;
        let header = JournalHeader::decode(&buf)?;
        if header.uuid != vhd.footer.uuid {
            return Err(Error::format("journal does not belong to this VHD"));
        }
        Ok(Self {
            file,
            path,
            header,
            vhd,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.write_all_at(&self.header.encode(), 0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Append one pre-image entry.
    ///
    /// Payload and entry record land before the header update, so a torn
    /// append is invisible to revert.
    fn append(&mut self, kind: EntryKind, offset: u64, payload: &[u8]) -> Result<()> {
        let mut rec = [0u8; ENTRY_BYTES];
        rec[0..8].copy_from_slice(&ENTRY_COOKIE.to_be_bytes());
        rec[8..12].copy_from_slice(&(kind as u32).to_be_bytes());
        rec[12..20].copy_from_slice(&(payload.len() as u64).to_be_bytes());
        rec[20..28].copy_from_slice(&offset.to_be_bytes());
        rec[28..32].copy_from_slice(&checksum(payload, 0..0).to_be_bytes());

        let at = self.header.eof;
        self.file.write_all_at(&rec, at)?;
        self.file.write_all_at(payload, at + ENTRY_BYTES as u64)?;
        self.file.sync_data()?;

        self.header.entries += 1;
        self.header.eof = at + ENTRY_BYTES as u64 + payload.len() as u64;
        self.write_header()
    }

    /// Snapshot footer, header, BAT, batmap and locator payloads
    fn add_metadata(&mut self) -> Result<()> {
        let footer_offset = self.header.vhd_footer_offset;
        let mut footer = vec![0u8; FOOTER_SIZE];
        self.vhd.pread(&mut footer, footer_offset)?;
        self.append(EntryKind::Footer, footer_offset, &footer.clone())?;
        // The mirror at offset zero is restored from the same pre-image
        if self.vhd.is_sparse() {
            self.append(EntryKind::Footer, 0, &footer)?;

            let header_offset = self.vhd.footer.data_offset;
            let mut hdr = vec![0u8; HEADER_SIZE];
            self.vhd.pread(&mut hdr, header_offset)?;
            self.append(EntryKind::Header, header_offset, &hdr)?;

            let (table_offset, bat_size) = {
                let h = self.vhd.header.as_ref().expect("sparse header");
                let bat = self.vhd.bat.as_ref().expect("bat");
                (h.table_offset, bat.byte_size())
            };
            let mut bat = vec![0u8; bat_size];
            self.vhd.pread(&mut bat, table_offset)?;
            self.append(EntryKind::Bat, table_offset, &bat)?;

            if let Some(batmap) = self.vhd.batmap.as_ref() {
                let hdr_off = table_offset + bat_size as u64;
                let payload_off = batmap.header.batmap_offset;
                let payload_len =
                    secs_to_bytes(batmap.header.batmap_size as u64) as usize;
                let mut sector = vec![0u8; SECTOR_SIZE as usize];
                self.vhd.pread(&mut sector, hdr_off)?;
                self.append(EntryKind::BatmapHeader, hdr_off, &sector)?;
                let mut payload = vec![0u8; payload_len];
                self.vhd.pread(&mut payload, payload_off)?;
                self.append(EntryKind::Batmap, payload_off, &payload)?;
            }

            let locators: Vec<(u64, usize)> = self
                .vhd
                .header
                .as_ref()
                .expect("sparse header")
                .locators
                .iter()
                .filter(|l| !l.is_empty())
                .map(|l| (l.data_offset, secs_to_bytes(l.data_space as u64) as usize))
                .collect();
            for (offset, len) in locators {
                let mut payload = vec![0u8; len];
                self.vhd.pread(&mut payload, offset)?;
                self.append(EntryKind::Locator, offset, &payload)?;
            }
        }
        Ok(())
    }

    /// Journal a data block ahead of mutating it
    pub fn add_block(&mut self, block: usize, mode: JournalMode) -> Result<()> {
        let Some(bsec) = self.vhd.bat.as_ref().and_then(|b| b.get(block)) else {
            // Unallocated blocks have no pre-image; revert restores the BAT
            // entry to unused, which is already journaled.
            return Ok(());
        };
        let bitmap_bytes = secs_to_bytes(self.vhd.bitmap_sectors() as u64) as usize;
        let mut bitmap = vec![0u8; bitmap_bytes];
        self.vhd.pread(&mut bitmap, secs_to_bytes(bsec as u64))?;
        self.append(EntryKind::Data, secs_to_bytes(bsec as u64), &bitmap)?;

        if mode == JournalMode::Data {
            let data_off =
                secs_to_bytes(bsec as u64 + self.vhd.bitmap_sectors() as u64);
            let mut data =
                vec![0u8; secs_to_bytes(self.vhd.spb() as u64) as usize];
            self.vhd.pread(&mut data, data_off)?;
            self.append(EntryKind::Data, data_off, &data)?;
        }
        Ok(())
    }

    /// Make the mutation final and discard the journal
    pub fn commit(mut self) -> Result<VhdContext> {
        self.vhd.sync()?;
        self.header.entries = 0;
        self.write_header()?;
        std::fs::remove_file(&self.path)?;
        info!(journal = %self.path.display(), "journal committed");
        Ok(self.vhd)
    }

    /// Replay every pre-image in LIFO order and discard the journal.
    ///
    /// Returns a freshly opened context; the cached metadata of the context
    /// the journal held is stale after the replay.
    pub fn revert(self) -> Result<VhdContext> {
        let vhd_path = self.vhd.path().to_path_buf();
        let mut entries = Vec::with_capacity(self.header.entries as usize);
        let mut at = HEADER_BYTES as u64;
        for _ in 0..self.header.entries {
            let mut rec = [0u8; ENTRY_BYTES];
            self.file.read_exact_at(&mut rec, at)?;
            if u64::from_be_bytes(rec[0..8].try_into().unwrap()) != ENTRY_COOKIE {
                return Err(Error::format("journal entry cookie mismatch"));
            }
            let kind =
                EntryKind::from_u32(u32::from_be_bytes(rec[8..12].try_into().unwrap()))?;
            let size = u64::from_be_bytes(rec[12..20].try_into().unwrap());
            let offset = u64::from_be_bytes(rec[20..28].try_into().unwrap());
            let sum = u32::from_be_bytes(rec[28..32].try_into().unwrap());

            let mut payload = vec![0u8; size as usize];
            self.file.read_exact_at(&mut payload, at + ENTRY_BYTES as u64)?;
            if checksum(&payload, 0..0) != sum {
                return Err(Error::format("journal payload checksum mismatch"));
            }
            entries.push((kind, offset, payload));
            at += ENTRY_BYTES as u64 + size;
        }

        for (_kind, offset, payload) in entries.iter().rev() {
            self.vhd.pwrite(payload, *offset)?;
        }
        self.vhd.sync()?;

        drop(self.vhd);
        let len = self.header.vhd_footer_offset + FOOTER_SIZE as u64;
        let file = OpenOptions::new().write(true).open(&vhd_path)?;
        if file.metadata()?.len() > len {
            file.set_len(len)?;
            file.sync_all()?;
        }
        drop(file);

        std::fs::remove_file(&self.path)?;
        info!(journal = %self.path.display(), "journal reverted");
        VhdContext::open(&vhd_path, OpenFlags::RDWR)
    }
}

/// Open `vhd_path` for mutation, reverting a leftover journal first.
///
/// This is the crash-recovery entry point every journaled utility goes
/// through before touching the image.
pub fn open_with_recovery(
    vhd_path: impl AsRef<Path>,
    journal_path: impl AsRef<Path>,
) -> Result<VhdContext> {
    let vhd_path = vhd_path.as_ref();
    let journal_path = journal_path.as_ref();
    if journal_path.exists() {
        warn!(
            journal = %journal_path.display(),
            "uncommitted journal found, reverting"
        );
        let journal = VhdJournal::open(vhd_path, journal_path)?;
        return journal.revert();
    }
    VhdContext::open(vhd_path, OpenFlags::RDWR)
}

/// Journaled resize
pub fn set_phys_size(
    vhd_path: impl AsRef<Path>,
    journal_path: impl AsRef<Path>,
    new_size: u64,
) -> Result<()> {
    let mut journal = VhdJournal::create(vhd_path, journal_path)?;
    match journal.vhd.set_phys_size(new_size) {
        Ok(()) => {
            journal.commit()?;
            Ok(())
        }
        Err(err) => {
            journal.revert()?;
            Err(err)
        }
    }
}

/// Journaled reparent
pub fn change_parent(
    vhd_path: impl AsRef<Path>,
    journal_path: impl AsRef<Path>,
    parent_path: impl AsRef<Path>,
) -> Result<()> {
    let parent = VhdContext::open(parent_path, OpenFlags::RDONLY)?;
    let mut journal = VhdJournal::create(vhd_path, journal_path)?;
    match journal.vhd.change_parent(&parent) {
        Ok(()) => {
            journal.commit()?;
            Ok(())
        }
        Err(err) => {
            journal.revert()?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create_dynamic, snapshot, CreateOptions};
    use tempfile::tempdir;

    #[test]
    fn test_commit_removes_journal() {
        let dir = tempdir().unwrap();
        let vhd = dir.path().join("disk.vhd");
        let jrn = dir.path().join("disk.vhd.journal");
        create_dynamic(&vhd, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();

        set_phys_size(&vhd, &jrn, 16 * 1024 * 1024).unwrap();
        assert!(!jrn.exists());

        let ctx = VhdContext::open(&vhd, OpenFlags::RDONLY).unwrap();
        assert_eq!(ctx.footer.curr_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_revert_restores_size_after_crash() {
        let dir = tempdir().unwrap();
        let vhd = dir.path().join("disk.vhd");
        let jrn = dir.path().join("disk.vhd.journal");
        create_dynamic(&vhd, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();

        // Mutate without committing: the journal stays behind, as it would
        // after a crash mid-operation.
        {
            let mut journal = VhdJournal::create(&vhd, &jrn).unwrap();
            journal.vhd.set_phys_size(16 * 1024 * 1024).unwrap();
            // dropped uncommitted
        }
        assert!(jrn.exists());

        let ctx = open_with_recovery(&vhd, &jrn).unwrap();
        assert!(!jrn.exists());
        assert_eq!(ctx.footer.curr_size, 8 * 1024 * 1024);
        ctx.footer.validate().unwrap();
    }

    #[test]
    fn test_revert_restores_parent() {
        let dir = tempdir().unwrap();
        let p1 = dir.path().join("p1.vhd");
        let p2 = dir.path().join("p2.vhd");
        let child = dir.path().join("child.vhd");
        let jrn = dir.path().join("child.vhd.journal");

        create_dynamic(&p1, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();
        create_dynamic(&p2, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();
        snapshot(&child, &p1, &CreateOptions::default()).unwrap();

        {
            let parent = VhdContext::open(&p2, OpenFlags::RDONLY).unwrap();
            let mut journal = VhdJournal::create(&child, &jrn).unwrap();
            journal.vhd.change_parent(&parent).unwrap();
            // dropped uncommitted
        }

        let ctx = open_with_recovery(&child, &jrn).unwrap();
        let resolved = ctx.parent_locator_get().unwrap();
        assert!(resolved.ends_with("p1.vhd"));
    }

    #[test]
    fn test_journaled_reparent_commits() {
        let dir = tempdir().unwrap();
        let p1 = dir.path().join("p1.vhd");
        let p2 = dir.path().join("p2.vhd");
        let child = dir.path().join("child.vhd");
        let jrn = dir.path().join("child.vhd.journal");

        create_dynamic(&p1, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();
        create_dynamic(&p2, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();
        snapshot(&child, &p1, &CreateOptions::default()).unwrap();

        change_parent(&child, &jrn, &p2).unwrap();
        assert!(!jrn.exists());

        let ctx = VhdContext::open(&child, OpenFlags::RDONLY).unwrap();
        assert!(ctx.parent_locator_get().unwrap().ends_with("p2.vhd"));
        let p2_ctx = VhdContext::open(&p2, OpenFlags::RDONLY).unwrap();
        assert_eq!(ctx.parent_uuid(), Some(p2_ctx.footer.uuid));
    }

    #[test]
    fn test_second_journal_rejected() {
        let dir = tempdir().unwrap();
        let vhd = dir.path().join("disk.vhd");
        let jrn = dir.path().join("disk.vhd.journal");
        create_dynamic(&vhd, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();

        let _held = VhdJournal::create(&vhd, &jrn).unwrap();
        assert!(VhdJournal::create(&vhd, &jrn).is_err());
    }

    #[test]
    fn test_foreign_journal_rejected() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.vhd");
        let b = dir.path().join("b.vhd");
        let jrn = dir.path().join("a.vhd.journal");
        create_dynamic(&a, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();
        create_dynamic(&b, 8 * 1024 * 1024, &CreateOptions::default()).unwrap();

        {
            let _j = VhdJournal::create(&a, &jrn).unwrap();
        }
        assert!(VhdJournal::open(&b, &jrn).is_err());
        std::fs::remove_file(&jrn).unwrap();
    }
}
