//! Memory-mapped region backings: anonymous, file, and POSIX shm.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use memmap2::{MmapMut, MmapOptions};
use shmkv_error::{KvError, Result};
use tracing::{debug, warn};

use crate::backend::{BackendKind, RegionBacking};

/// A shared mapping viewed as atomic words.
#[derive(Debug)]
pub struct MmapBacking {
    map: MmapMut,
    words: NonNull<AtomicU64>,
    len_words: usize,
    kind: BackendKind,
    file: Option<File>,
}

// SAFETY: the mapping is only ever accessed through `&[AtomicU64]`, which is
// itself `Send + Sync`; the raw pointer refers into `map`, which we own.
unsafe impl Send for MmapBacking {}
// SAFETY: see above.
unsafe impl Sync for MmapBacking {}

impl MmapBacking {
    /// Map `len` bytes of anonymous shared memory.
    pub fn anonymous(len: usize, huge_pages: bool) -> Result<Self> {
        check_len(len)?;
        let map = MmapOptions::new().len(len).map_anon()?;
        if huge_pages {
            advise_huge(&map);
        }
        debug!(len, huge_pages, "mapped anonymous region");
        Self::from_map(map, BackendKind::Anonymous, None)
    }

    /// Create (or truncate) a file of `len` bytes and map it shared.
    pub fn create_file(path: &Path, len: usize) -> Result<Self> {
        check_len(len)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        debug!(path = %path.display(), len, "created file region");
        Self::map_file(file, len, BackendKind::File)
    }

    /// Map an existing file at its current length.
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| KvError::unsupported("file larger than address space"))?;
        check_len(len)?;
        debug!(path = %path.display(), len, "opened file region");
        Self::map_file(file, len, BackendKind::File)
    }

    /// Create a POSIX shared memory object; fails if the name exists.
    #[cfg(unix)]
    pub fn create_posix(name: &str, len: usize) -> Result<Self> {
        use nix::fcntl::OFlag;
        use nix::sys::mman::shm_open;
        use nix::sys::stat::Mode;

        check_len(len)?;
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(std::io::Error::from)?;
        let file = File::from(fd);
        file.set_len(len as u64)?;
        debug!(name, len, "created posix shm region");
        Self::map_file(file, len, BackendKind::Posix)
    }

    /// Open an existing POSIX shared memory object.
    #[cfg(unix)]
    pub fn open_posix(name: &str) -> Result<Self> {
        use nix::fcntl::OFlag;
        use nix::sys::mman::shm_open;
        use nix::sys::stat::Mode;

        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(std::io::Error::from)?;
        let file = File::from(fd);
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| KvError::unsupported("shm object larger than address space"))?;
        check_len(len)?;
        debug!(name, len, "opened posix shm region");
        Self::map_file(file, len, BackendKind::Posix)
    }

    /// Remove a POSIX shared memory name. Existing mappings stay valid.
    #[cfg(unix)]
    pub fn unlink_posix(name: &str) -> Result<()> {
        nix::sys::mman::shm_unlink(name).map_err(std::io::Error::from)?;
        debug!(name, "unlinked posix shm region");
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn create_posix(_name: &str, _len: usize) -> Result<Self> {
        Err(KvError::unsupported("posix shm requires a unix target"))
    }

    #[cfg(not(unix))]
    pub fn open_posix(_name: &str) -> Result<Self> {
        Err(KvError::unsupported("posix shm requires a unix target"))
    }

    #[cfg(not(unix))]
    pub fn unlink_posix(_name: &str) -> Result<()> {
        Err(KvError::unsupported("posix shm requires a unix target"))
    }

    fn map_file(file: File, len: usize, kind: BackendKind) -> Result<Self> {
        // SAFETY: the file stays open for the life of the mapping. Other
        // processes may write the same pages concurrently, which is why the
        // map is only ever read through atomics.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Self::from_map(map, kind, Some(file))
    }

    fn from_map(mut map: MmapMut, kind: BackendKind, file: Option<File>) -> Result<Self> {
        let ptr = map.as_mut_ptr();
        if ptr.align_offset(std::mem::align_of::<AtomicU64>()) != 0 {
            return Err(KvError::unsupported("mapping is not 8-byte aligned"));
        }
        let words = NonNull::new(ptr.cast::<AtomicU64>())
            .ok_or_else(|| KvError::unsupported("mapping returned a null address"))?;
        let len_words = map.len() / 8;
        Ok(Self {
            map,
            words,
            len_words,
            kind,
            file,
        })
    }
}

impl RegionBacking for MmapBacking {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: `words` points at the start of `map`, which is aligned,
        // at least `len_words * 8` bytes long, and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr(), self.len_words) }
    }

    fn flush(&self) -> Result<()> {
        if self.file.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 || len % 8 != 0 {
        return Err(KvError::config(format!(
            "region length {len} must be a non-zero multiple of 8"
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn advise_huge(map: &MmapMut) {
    if let Err(err) = map.advise(memmap2::Advice::HugePage) {
        warn!(error = %err, "huge page advice rejected; continuing with normal pages");
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_huge(_map: &MmapMut) {
    warn!("huge pages requested but not supported on this platform");
}
