//! Minor-number allocation
//!
//! Minors are a cross-process resource coordinated purely through the
//! filesystem: marker files `tapdisk-<N>` in the control directory, each
//! held under a non-blocking exclusive `flock` for the lifetime of its
//! owner. One lock file serializes allocation scans. Freeing probes the
//! marker's lock: if it can be taken the owner is gone and the marker is
//! unlinked, otherwise the minor is busy.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use blktap_core::{Error, Result};
use tracing::{debug, info, warn};

/// Default control directory
pub const CONTROL_DIR: &str = "/run/blktap-control";

/// Default allocator state directory
pub const TAPDISK_DIR: &str = "/run/blktap-control/tapdisk";

/// Kernel control device
pub const CONTROL_DEVICE: &str = "/dev/xen/blktap-2/control";

/// Directory holding per-minor device nodes
pub const DEVICE_DIR: &str = "/dev/xen/blktap-2";

/// Name the kernel module registers under in `/proc/misc`
pub const CONTROL_NAME: &str = "blktap-control";

const MARKER_PREFIX: &str = "tapdisk-";
const DIR_LOCK: &str = ".lock";

fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// A minor held by this process.
///
/// The marker's lock rides on the open descriptor; dropping the hold
/// releases the lock (the marker stays behind for `free` to reap).
#[derive(Debug)]
pub struct MinorHold {
    pub minor: u32,
    _marker: File,
}

/// The filesystem-backed minor registry
pub struct Allocator {
    dir: PathBuf,
}

impl Allocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The production allocator under [`TAPDISK_DIR`]
    pub fn system() -> Self {
        Self::new(TAPDISK_DIR)
    }

    fn marker_path(&self, minor: u32) -> PathBuf {
        self.dir.join(format!("{}{}", MARKER_PREFIX, minor))
    }

    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Take the big allocation lock; held only for the scan + create
    fn lock_dir(&self) -> Result<File> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(DIR_LOCK))?;
        flock(&lock, libc::LOCK_EX)?;
        Ok(lock)
    }

    /// Allocate the lowest unused minor
    pub fn allocate(&self) -> Result<MinorHold> {
        self.prepare()?;
        let _dir_lock = self.lock_dir()?;

        for minor in 0.. {
            let path = self.marker_path(minor);
            let marker = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            match flock(&marker, libc::LOCK_EX | libc::LOCK_NB) {
                Ok(()) => {
                    // A pre-existing unlocked marker is a leftover from a
                    // dead owner; reusing it is exactly the point.
                    debug!(minor, "allocated minor");
                    return Ok(MinorHold {
                        minor,
                        _marker: marker,
                    });
                }
                Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        unreachable!("minor space exhausted")
    }

    /// Reap the marker of a dead owner.
    ///
    /// Returns `Busy` while a live process still holds the minor's lock.
    pub fn free(&self, minor: u32) -> Result<()> {
        let _dir_lock = self.lock_dir()?;
        let path = self.marker_path(minor);
        let marker = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("minor {}", minor)))
            }
            Err(e) => return Err(Error::Io(e)),
        };
        match flock(&marker, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                std::fs::remove_file(&path)?;
                info!(minor, "freed minor");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                Err(Error::busy(format!("minor {} still held", minor)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Minors with a marker on disk, locked or not
    pub fn known_minors(&self) -> Result<Vec<u32>> {
        let mut minors = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(minors),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.strip_prefix(MARKER_PREFIX))
                .and_then(|s| s.parse().ok())
            {
                minors.push(n);
            }
        }
        minors.sort_unstable();
        Ok(minors)
    }
}

/// Device triple returned by the kernel's `ALLOC_TAP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapHandle {
    pub ring_major: u32,
    pub device_major: u32,
    pub minor: u32,
}

/// Kernel-side device provisioning.
///
/// A trait seam so the allocator and lifecycle logic run in tests without
/// the blktap kernel module.
pub trait TapDevices {
    /// `BLKTAP2_IOCTL_ALLOC_TAP`
    fn alloc_tap(&self) -> Result<TapHandle>;
    /// `BLKTAP2_IOCTL_FREE_TAP`
    fn free_tap(&self, minor: u32) -> Result<()>;
    /// Create the ring (char) and I/O (block) device nodes, mode 0600
    fn make_nodes(&self, handle: &TapHandle) -> Result<()>;
}

const IOCTL_ALLOC_TAP: libc::c_ulong = 200;
const IOCTL_FREE_TAP: libc::c_ulong = 201;
const MISC_MAJOR: u32 = 10;

#[repr(C)]
struct RawHandle {
    ring: libc::c_uint,
    device: libc::c_uint,
    minor: libc::c_uint,
}

/// The real kernel interface at `/dev/xen/blktap-2`
pub struct KernelTapDevices {
    control_device: PathBuf,
    device_dir: PathBuf,
}

impl KernelTapDevices {
    pub fn new() -> Self {
        Self {
            control_device: CONTROL_DEVICE.into(),
            device_dir: DEVICE_DIR.into(),
        }
    }

    /// Recreate the control node from `/proc/misc` when it is missing
    pub fn check_environment(&self) -> Result<()> {
        if self.control_device.exists() {
            return Ok(());
        }
        let misc = std::fs::read_to_string("/proc/misc")?;
        for line in misc.lines() {
            let mut fields = line.split_whitespace();
            let (Some(minor), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            if name == CONTROL_NAME {
                let minor: u32 = minor
                    .parse()
                    .map_err(|_| Error::format("malformed /proc/misc"))?;
                make_node(&self.control_device, libc::S_IFCHR, MISC_MAJOR, minor)?;
                return Ok(());
            }
        }
        warn!("{} not present in /proc/misc", CONTROL_NAME);
        Err(Error::not_found(CONTROL_NAME))
    }

    fn open_control(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.control_device)?)
    }
}

impl Default for KernelTapDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl TapDevices for KernelTapDevices {
    fn alloc_tap(&self) -> Result<TapHandle> {
        let control = self.open_control()?;
        let mut raw = RawHandle {
            ring: 0,
            device: 0,
            minor: 0,
        };
        let rc = unsafe {
            libc::ioctl(control.as_raw_fd(), IOCTL_ALLOC_TAP, &mut raw)
        };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(TapHandle {
            ring_major: raw.ring,
            device_major: raw.device,
            minor: raw.minor,
        })
    }

    fn free_tap(&self, minor: u32) -> Result<()> {
        let control = self.open_control()?;
        let rc = unsafe {
            libc::ioctl(
                control.as_raw_fd(),
                IOCTL_FREE_TAP,
                minor as libc::c_ulong,
            )
        };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn make_nodes(&self, handle: &TapHandle) -> Result<()> {
        let ring = self.device_dir.join(format!("blktap{}", handle.minor));
        let io = self.device_dir.join(format!("tapdev{}", handle.minor));
        make_node(&ring, libc::S_IFCHR, handle.ring_major, handle.minor)?;
        make_node(&io, libc::S_IFBLK, handle.device_major, handle.minor)?;
        Ok(())
    }
}

/// `mknod` with a fresh path: an existing node is unlinked first
fn make_node(path: &Path, kind: libc::mode_t, major: u32, minor: u32) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::invalid_arg("NUL in device path"))?;
    let dev = libc::makedev(major, minor);
    let rc = unsafe { libc::mknod(cpath.as_ptr(), kind | 0o600, dev) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    debug!(path = %path.display(), major, minor, "created device node");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    #[test]
    fn test_allocate_scans_from_zero() {
        let dir = tempdir().unwrap();
        let alloc = Allocator::new(dir.path());
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a.minor, 0);
        assert_eq!(b.minor, 1);
    }

    #[test]
    fn test_free_busy_while_held() {
        let dir = tempdir().unwrap();
        let alloc = Allocator::new(dir.path());
        let hold = alloc.allocate().unwrap();
        let err = alloc.free(hold.minor).unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn test_free_after_owner_death() {
        let dir = tempdir().unwrap();
        let alloc = Allocator::new(dir.path());
        let hold = alloc.allocate().unwrap();
        let minor = hold.minor;
        drop(hold);
        alloc.free(minor).unwrap();
        assert!(alloc.known_minors().unwrap().is_empty());
    }

    #[test]
    fn test_free_unknown_minor() {
        let dir = tempdir().unwrap();
        let alloc = Allocator::new(dir.path());
        assert!(matches!(
            alloc.free(42).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_released_minor_is_reused() {
        let dir = tempdir().unwrap();
        let alloc = Allocator::new(dir.path());
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        drop(a);
        let c = alloc.allocate().unwrap();
        assert_eq!(c.minor, 0);
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        // flock is per open file description, so two racing allocators in
        // one process exercise the same exclusion as two processes.
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let alloc = Allocator::new(path);
                    (0..100)
                        .map(|_| alloc.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        let mut holds = Vec::new();
        for worker in workers {
            for hold in worker.join().unwrap() {
                assert!(seen.insert(hold.minor), "minor {} double-allocated", hold.minor);
                holds.push(hold);
            }
        }
        let expected: BTreeSet<u32> = (0..200).collect();
        assert_eq!(seen, expected);
    }
}
