//! Sector-granular chain I/O
//!
//! Reads walk the chain from the leaf: a sector comes from the first image
//! whose bitmap claims it, falling through unallocated blocks and clear bits
//! until the root, which reads as zeros. Consecutive sectors with the same
//! provenance are coalesced into single positioned reads. Writes go to the
//! leaf only; the presence bitmap is flushed before a write is acknowledged
//! so a crash can never leave present-flagged sectors with stale contents.

use std::path::{Path, PathBuf};

use blktap_core::{secs_to_bytes, BitmapBE, Error, Result, SECTOR_SIZE};
use tracing::debug;

use crate::context::{OpenFlags, VhdContext};

/// Where one virtual sector's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Image `depth` in the chain, at this absolute file offset
    File { depth: usize, offset: u64 },
    /// Nothing in the chain holds it
    Zero,
}

/// A VHD chain opened for I/O: the leaf plus lazily-opened ancestors
pub struct VhdChain {
    images: Vec<VhdContext>,
    /// Per-image cache of the most recently read block bitmap
    bitmaps: Vec<Option<(usize, BitmapBE)>>,
}

impl VhdChain {
    /// Open the image at `path`; parents are opened on first fall-through
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let leaf = VhdContext::open(path, flags)?;
        Ok(Self {
            images: vec![leaf],
            bitmaps: vec![None],
        })
    }

    pub fn leaf(&self) -> &VhdContext {
        &self.images[0]
    }

    pub fn leaf_mut(&mut self) -> &mut VhdContext {
        self.bitmaps[0] = None;
        &mut self.images[0]
    }

    /// Open the parent of `depth` if there is one; true when it exists
    fn ensure_parent(&mut self, depth: usize) -> Result<bool> {
        if depth + 1 < self.images.len() {
            return Ok(true);
        }
        match self.images[depth].parent()? {
            Some(parent) => {
                self.images.push(parent);
                self.bitmaps.push(None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn cached_bitmap(&mut self, depth: usize, block: usize) -> Result<Option<&BitmapBE>> {
        let stale = !matches!(self.bitmaps[depth], Some((b, _)) if b == block);
        if stale {
            self.bitmaps[depth] = self.images[depth]
                .read_bitmap(block)?
                .map(|map| (block, map));
        }
        match &self.bitmaps[depth] {
            Some((b, map)) if *b == block => Ok(Some(map)),
            _ => Ok(None),
        }
    }

    /// Find the image and offset serving `sector`
    fn resolve(&mut self, sector: u64) -> Result<Source> {
        let mut depth = 0;
        loop {
            let ctx = &self.images[depth];
            if !ctx.is_sparse() {
                if sector < ctx.virtual_sectors() {
                    return Ok(Source::File {
                        depth,
                        offset: secs_to_bytes(sector),
                    });
                }
                return Ok(Source::Zero);
            }

            let spb = ctx.spb() as u64;
            let block = (sector / spb) as usize;
            let within = sector % spb;
            let entry = ctx.bat.as_ref().and_then(|b| b.get(block));
            let diff = ctx.is_differencing();
            let bitmap_secs = ctx.bitmap_sectors() as u64;

            if let Some(bsec) = entry {
                let present = self
                    .cached_bitmap(depth, block)?
                    .map(|map| map.test(within as usize))
                    .unwrap_or(false);
                if present {
                    return Ok(Source::File {
                        depth,
                        offset: secs_to_bytes(bsec as u64 + bitmap_secs + within),
                    });
                }
            }

            if diff && self.ensure_parent(depth)? {
                depth += 1;
                continue;
            }
            return Ok(Source::Zero);
        }
    }

    /// Read `buf.len() / 512` sectors starting at `sector`
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() % SECTOR_SIZE as usize != 0 {
            return Err(Error::invalid_arg("buffer not sector-aligned"));
        }
        let count = buf.len() as u64 / SECTOR_SIZE;
        if sector + count > self.leaf().virtual_sectors() {
            return Err(Error::invalid_arg("read past end of disk"));
        }

        let mut done = 0u64;
        while done < count {
            let src = self.resolve(sector + done)?;
            // Extend the run while provenance stays contiguous
            let mut run = 1u64;
            while done + run < count {
                let next = self.resolve(sector + done + run)?;
                let contiguous = match (src, next) {
                    (Source::Zero, Source::Zero) => true,
                    (
                        Source::File { depth: d0, offset: o0 },
                        Source::File { depth: d1, offset: o1 },
                    ) => d0 == d1 && o1 == o0 + run * SECTOR_SIZE,
                    _ => false,
                };
                if !contiguous {
                    break;
                }
                run += 1;
            }

            let at = (done * SECTOR_SIZE) as usize;
            let len = (run * SECTOR_SIZE) as usize;
            match src {
                Source::Zero => buf[at..at + len].fill(0),
                Source::File { depth, offset } => {
                    self.images[depth].pread(&mut buf[at..at + len], offset)?
                }
            }
            done += run;
        }
        Ok(())
    }

    /// Write `buf.len() / 512` sectors starting at `sector` into the leaf
    pub fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if buf.len() % SECTOR_SIZE as usize != 0 {
            return Err(Error::invalid_arg("buffer not sector-aligned"));
        }
        let count = buf.len() as u64 / SECTOR_SIZE;
        if sector + count > self.leaf().virtual_sectors() {
            return Err(Error::invalid_arg("write past end of disk"));
        }
        if !self.leaf().is_sparse() {
            let ctx = self.leaf_mut();
            ctx.pwrite(buf, secs_to_bytes(sector))?;
            return ctx.sync();
        }

        let spb = self.leaf().spb() as u64;
        let mut done = 0u64;
        while done < count {
            let abs = sector + done;
            let block = (abs / spb) as usize;
            let within = abs % spb;
            let run = (spb - within).min(count - done);

            self.write_block_run(
                block,
                within,
                &buf[(done * SECTOR_SIZE) as usize
                    ..((done + run) * SECTOR_SIZE) as usize],
            )?;
            done += run;
        }
        Ok(())
    }

    /// Write a run of sectors confined to one block
    fn write_block_run(&mut self, block: usize, within: u64, data: &[u8]) -> Result<()> {
        let run = data.len() as u64 / SECTOR_SIZE;
        let ctx = self.leaf_mut();
        let bsec = ctx.allocate_block(block)?;
        let bitmap_secs = ctx.bitmap_sectors() as u64;
        let spb = ctx.spb() as usize;

        ctx.pwrite(data, secs_to_bytes(bsec as u64 + bitmap_secs + within))?;
        ctx.sync()?;

        if ctx.batmap_test(block) {
            return Ok(());
        }

        // Raw on-disk bitmap, not the batmap-synthesized view
        let mut map = {
            let bytes = secs_to_bytes(bitmap_secs) as usize;
            let mut buf = vec![0u8; bytes];
            ctx.pread(&mut buf, secs_to_bytes(bsec as u64))?;
            BitmapBE::from_bytes(buf)
        };
        for i in 0..run {
            map.set((within + i) as usize);
        }
        ctx.write_bitmap(block, &map)?;

        if map.all_set(spb) && ctx.has_batmap() {
            ctx.batmap_set(block)?;
            debug!(block, "block fully allocated, batmap set");
        }
        Ok(())
    }
}

/// Fold a child's blocks into its parent.
///
/// Blocks the child's batmap asserts are copied wholesale; otherwise each
/// contiguous run of present sectors is copied. After a successful coalesce
/// the child can be deleted without changing what any read observes.
pub fn coalesce(child_path: &Path) -> Result<u64> {
    let child = VhdContext::open(child_path, OpenFlags::RDONLY)?;
    if !child.is_differencing() {
        return Err(Error::invalid_arg("coalesce needs a differencing child"));
    }
    let parent_path = child.parent_locator_get()?;
    coalesce_into(&child, &parent_path)
}

fn coalesce_into(child: &VhdContext, parent_path: &PathBuf) -> Result<u64> {
    let mut parent = VhdChain::open(parent_path, OpenFlags::RDWR)?;
    let spb = child.spb() as u64;
    let bitmap_secs = child.bitmap_sectors() as u64;
    let mut moved = 0u64;

    let mut block_buf = vec![0u8; secs_to_bytes(spb) as usize];
    for block in 0..child.blocks() {
        let Some(bsec) = child.bat.as_ref().and_then(|b| b.get(block)) else {
            continue;
        };
        let base = block as u64 * spb;

        if child.batmap_test(block) {
            child.pread(&mut block_buf, secs_to_bytes(bsec as u64 + bitmap_secs))?;
            parent.write_sectors(base, &block_buf)?;
            moved += spb;
            continue;
        }

        let Some(map) = child.read_bitmap(block)? else {
            continue;
        };
        let mut i = 0usize;
        while i < spb as usize {
            if !map.test(i) {
                i += 1;
                continue;
            }
            let run = map.run_of_set(i, spb as usize);
            let bytes = secs_to_bytes(run as u64) as usize;
            child.pread(
                &mut block_buf[..bytes],
                secs_to_bytes(bsec as u64 + bitmap_secs + i as u64),
            )?;
            parent.write_sectors(base + i as u64, &block_buf[..bytes])?;
            moved += run as u64;
            i += run;
        }
    }

    debug!(child = %child.path().display(), moved, "coalesce complete");
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BAT_UNUSED;
    use crate::create::{create_dynamic, snapshot, CreateOptions};
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;

    const SEC: usize = SECTOR_SIZE as usize;

    fn small_blocks() -> CreateOptions {
        CreateOptions {
            block_size: 4096, // 8 sectors per block
            ..CreateOptions::default()
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 64 * 1024 * 1024, &CreateOptions::default()).unwrap();

        let mut chain = VhdChain::open(&path, OpenFlags::RDWR).unwrap();
        let pattern = vec![0xABu8; SEC];
        chain.write_sectors(0, &pattern).unwrap();
        drop(chain);

        let mut chain = VhdChain::open(&path, OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0u8; SEC];
        chain.read_sectors(0, &mut buf).unwrap();
        assert_eq!(buf, pattern);

        chain.read_sectors(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; SEC]);

        let bat = chain.leaf().bat.as_ref().unwrap();
        assert_ne!(bat.raw(0), BAT_UNUSED);
        for block in 1..bat.len() {
            assert_eq!(bat.raw(block), BAT_UNUSED);
        }
    }

    #[test]
    fn test_unallocated_dynamic_reads_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 1024 * 1024, &small_blocks()).unwrap();

        let mut chain = VhdChain::open(&path, OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0xFFu8; 4 * SEC];
        chain.read_sectors(16, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 4 * SEC]);
    }

    #[test]
    fn test_differencing_fallthrough() {
        let dir = tempdir().unwrap();
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        create_dynamic(&parent_path, 1024 * 1024, &small_blocks()).unwrap();

        let mut parent = VhdChain::open(&parent_path, OpenFlags::RDWR).unwrap();
        parent.write_sectors(10, &vec![0xCDu8; SEC]).unwrap();
        parent.write_sectors(11, &vec![0x11u8; SEC]).unwrap();
        drop(parent);

        snapshot(&child_path, &parent_path, &small_blocks()).unwrap();
        let mut child = VhdChain::open(&child_path, OpenFlags::RDWR).unwrap();
        child.write_sectors(10, &vec![0xEFu8; SEC]).unwrap();

        let mut buf = vec![0u8; SEC];
        child.read_sectors(10, &mut buf).unwrap();
        assert_eq!(buf, vec![0xEFu8; SEC]);

        // Sector 11 shares block 1 with sector 10 but its bit is clear:
        // the read falls through to the parent.
        child.read_sectors(11, &mut buf).unwrap();
        assert_eq!(buf, vec![0x11u8; SEC]);
    }

    #[test]
    fn test_full_block_write_sets_batmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 1024 * 1024, &small_blocks()).unwrap();

        let mut chain = VhdChain::open(&path, OpenFlags::RDWR).unwrap();
        let block3 = vec![0x5Au8; 8 * SEC];
        chain.write_sectors(3 * 8, &block3).unwrap();
        assert!(chain.leaf().batmap_test(3));
        assert!(!chain.leaf().batmap_test(2));
    }

    #[test]
    fn test_batmap_skips_bitmap_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 1024 * 1024, &small_blocks()).unwrap();

        let mut chain = VhdChain::open(&path, OpenFlags::RDWR).unwrap();
        chain.write_sectors(3 * 8, &vec![0x5Au8; 8 * SEC]).unwrap();
        let bsec = chain.leaf().bat.as_ref().unwrap().get(3).unwrap();
        drop(chain);

        // Poison the on-disk bitmap; the batmap fast path must keep the
        // block readable without ever looking at it.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all_at(&[0u8; SEC], secs_to_bytes(bsec as u64))
            .unwrap();
        drop(file);

        let mut chain = VhdChain::open(&path, OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0u8; 8 * SEC];
        chain.read_sectors(3 * 8, &mut buf).unwrap();
        assert_eq!(buf, vec![0x5Au8; 8 * SEC]);
    }

    #[test]
    fn test_cross_block_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 1024 * 1024, &small_blocks()).unwrap();

        let mut chain = VhdChain::open(&path, OpenFlags::RDWR).unwrap();
        let data: Vec<u8> = (0..4 * SEC).map(|i| (i % 251) as u8).collect();
        // Sectors 6..10 straddle blocks 0 and 1
        chain.write_sectors(6, &data).unwrap();

        let mut buf = vec![0u8; 4 * SEC];
        chain.read_sectors(6, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_coalesce_preserves_reads() {
        let dir = tempdir().unwrap();
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        create_dynamic(&parent_path, 1024 * 1024, &small_blocks()).unwrap();

        let mut parent = VhdChain::open(&parent_path, OpenFlags::RDWR).unwrap();
        parent.write_sectors(0, &vec![0x01u8; 2 * SEC]).unwrap();
        parent.write_sectors(40, &vec![0x02u8; SEC]).unwrap();
        drop(parent);

        snapshot(&child_path, &parent_path, &small_blocks()).unwrap();
        let mut child = VhdChain::open(&child_path, OpenFlags::RDWR).unwrap();
        // Partial block overwrite, full block write, and a fresh block
        child.write_sectors(1, &vec![0x03u8; SEC]).unwrap();
        child.write_sectors(8, &vec![0x04u8; 8 * SEC]).unwrap();
        child.write_sectors(100, &vec![0x05u8; 3 * SEC]).unwrap();

        // Record what the chain reads before the fold
        let mut before = vec![0u8; 128 * SEC];
        child.read_sectors(0, &mut before).unwrap();
        drop(child);

        let moved = coalesce(&child_path).unwrap();
        assert!(moved >= 12);

        // After the fold, reading the parent alone must observe the same
        // bytes as the chain did.
        let mut parent = VhdChain::open(&parent_path, OpenFlags::RDONLY).unwrap();
        let mut after = vec![0u8; 128 * SEC];
        parent.read_sectors(0, &mut after).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_out_of_range_io_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 1024 * 1024, &small_blocks()).unwrap();
        let mut chain = VhdChain::open(&path, OpenFlags::RDWR).unwrap();
        let mut buf = vec![0u8; SEC];
        assert!(chain.read_sectors(2048, &mut buf).is_err());
        assert!(chain.write_sectors(2048, &buf).is_err());
    }

    #[test]
    fn test_read_only_chain_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        create_dynamic(&path, 1024 * 1024, &small_blocks()).unwrap();
        let mut chain = VhdChain::open(&path, OpenFlags::RDONLY).unwrap();
        assert!(chain.write_sectors(0, &vec![0u8; SEC]).is_err());
    }
}
