//! Word-addressed view over a region backing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use shmkv_error::{KvError, Result};
use tracing::info;

use crate::backend::{BackendKind, RegionBacking, StorageBackend};
use crate::heap::HeapBacking;
use crate::mmap::MmapBacking;

/// A mapped region, addressed in 64-bit words.
///
/// Cloning is cheap and shares the mapping. Byte helpers operate on word
/// loads and stores so they are safe to run concurrently with atomic users
/// of the same words; callers coordinate through the map's locks.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    backing: Arc<dyn RegionBacking>,
}

impl ShmRegion {
    /// Create a fresh, zeroed region of `len_bytes` on `backend`.
    pub fn create(backend: &StorageBackend, len_bytes: usize) -> Result<Self> {
        let backing: Arc<dyn RegionBacking> = match backend {
            StorageBackend::Heap => {
                if len_bytes % 8 != 0 {
                    return Err(KvError::config(format!(
                        "region length {len_bytes} must be a multiple of 8"
                    )));
                }
                Arc::new(HeapBacking::new(len_bytes / 8))
            }
            StorageBackend::Anonymous { huge_pages } => {
                Arc::new(MmapBacking::anonymous(len_bytes, *huge_pages)?)
            }
            StorageBackend::File { path } => Arc::new(MmapBacking::create_file(path, len_bytes)?),
            StorageBackend::Posix { name } => {
                Arc::new(MmapBacking::create_posix(name, len_bytes)?)
            }
        };
        info!(backend = %backend, len_bytes, "created region");
        Ok(Self { backing })
    }

    /// Map an existing named region.
    pub fn open(backend: &StorageBackend) -> Result<Self> {
        let backing: Arc<dyn RegionBacking> = match backend {
            StorageBackend::File { path } => Arc::new(MmapBacking::open_file(path)?),
            StorageBackend::Posix { name } => Arc::new(MmapBacking::open_posix(name)?),
            StorageBackend::Heap | StorageBackend::Anonymous { .. } => {
                return Err(KvError::unsupported(format!(
                    "{backend} regions cannot be opened by name; share the handle instead"
                )));
            }
        };
        info!(backend = %backend, len_bytes = backing.words().len() * 8, "opened region");
        Ok(Self { backing })
    }

    /// Remove the name of a POSIX shm region.
    pub fn unlink(backend: &StorageBackend) -> Result<()> {
        match backend {
            StorageBackend::Posix { name } => MmapBacking::unlink_posix(name),
            StorageBackend::File { path } => Ok(std::fs::remove_file(path)?),
            StorageBackend::Heap | StorageBackend::Anonymous { .. } => Ok(()),
        }
    }

    pub fn from_backing(backing: Arc<dyn RegionBacking>) -> Self {
        Self { backing }
    }

    pub fn kind(&self) -> BackendKind {
        self.backing.kind()
    }

    #[inline]
    pub fn words(&self) -> &[AtomicU64] {
        self.backing.words()
    }

    #[inline]
    pub fn len_words(&self) -> usize {
        self.words().len()
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.len_words() * 8
    }

    /// The word at `idx`. Panics when out of range.
    #[inline]
    pub fn word(&self, idx: usize) -> &AtomicU64 {
        &self.words()[idx]
    }

    pub fn flush(&self) -> Result<()> {
        self.backing.flush()
    }

    /// Copy `out.len()` bytes starting at byte offset `off`.
    pub fn load_bytes(&self, off: usize, out: &mut [u8]) {
        let words = self.words();
        let mut pos = off;
        let mut done = 0;
        while done < out.len() {
            let shift = pos % 8;
            let bytes = words[pos / 8].load(Ordering::Relaxed).to_le_bytes();
            let n = (8 - shift).min(out.len() - done);
            out[done..done + n].copy_from_slice(&bytes[shift..shift + n]);
            done += n;
            pos += n;
        }
    }

    /// Store `src` starting at byte offset `off`.
    ///
    /// Partial words are read-modified-written; the caller must own every
    /// word touched.
    pub fn store_bytes(&self, off: usize, src: &[u8]) {
        let words = self.words();
        let mut pos = off;
        let mut done = 0;
        while done < src.len() {
            let shift = pos % 8;
            let n = (8 - shift).min(src.len() - done);
            let word = &words[pos / 8];
            if n == 8 {
                let mut bytes = [0_u8; 8];
                bytes.copy_from_slice(&src[done..done + 8]);
                word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                let mut bytes = word.load(Ordering::Relaxed).to_le_bytes();
                bytes[shift..shift + n].copy_from_slice(&src[done..done + n]);
                word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            }
            done += n;
            pos += n;
        }
    }

    /// Zero `len` bytes starting at byte offset `off`.
    pub fn zero_bytes(&self, off: usize, len: usize) {
        let words = self.words();
        let mut pos = off;
        let end = off + len;
        while pos < end {
            let shift = pos % 8;
            let n = (8 - shift).min(end - pos);
            let word = &words[pos / 8];
            if n == 8 {
                word.store(0, Ordering::Relaxed);
            } else {
                let mut bytes = word.load(Ordering::Relaxed).to_le_bytes();
                bytes[shift..shift + n].fill(0);
                word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            }
            pos += n;
        }
    }

    /// Copy `count` words from `src` to `dst`, lowest index first.
    ///
    /// Safe for overlapping ranges when `dst <= src`.
    pub fn copy_words(&self, src: usize, dst: usize, count: usize) {
        let words = self.words();
        for i in 0..count {
            let v = words[src + i].load(Ordering::Relaxed);
            words[dst + i].store(v, Ordering::Relaxed);
        }
    }

    /// Zero `count` words starting at `start`.
    pub fn zero_words(&self, start: usize, count: usize) {
        for w in &self.words()[start..start + count] {
            w.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn heap(len: usize) -> ShmRegion {
        ShmRegion::create(&StorageBackend::Heap, len).unwrap()
    }

    #[test]
    fn byte_helpers_handle_unaligned_ranges() {
        let region = heap(256);
        region.store_bytes(3, b"hello, shared world");
        let mut out = [0_u8; 19];
        region.load_bytes(3, &mut out);
        assert_eq!(&out, b"hello, shared world");
        let mut edge = [0_u8; 3];
        region.load_bytes(0, &mut edge);
        assert_eq!(edge, [0, 0, 0]);
    }

    #[test]
    fn zero_bytes_leaves_neighbours() {
        let region = heap(64);
        region.store_bytes(0, &[0xff; 24]);
        region.zero_bytes(5, 10);
        let mut out = [0_u8; 24];
        region.load_bytes(0, &mut out);
        assert_eq!(&out[..5], &[0xff; 5]);
        assert_eq!(&out[5..15], &[0; 10]);
        assert_eq!(&out[15..], &[0xff; 9]);
    }

    #[test]
    fn copy_words_overlapping_down() {
        let region = heap(128);
        for i in 0..8 {
            region.word(4 + i).store(i as u64 + 1, Ordering::Relaxed);
        }
        region.copy_words(4, 2, 8);
        for i in 0..8 {
            assert_eq!(region.word(2 + i).load(Ordering::Relaxed), i as u64 + 1);
        }
    }

    #[test]
    fn heap_regions_cannot_be_opened_by_name() {
        let err = ShmRegion::open(&StorageBackend::Heap).unwrap_err();
        assert!(matches!(err, KvError::Unsupported { .. }));
    }

    proptest! {
        #[test]
        fn store_then_load_any_range(off in 0_usize..64, data in proptest::collection::vec(any::<u8>(), 0..120)) {
            let region = heap(256);
            region.store_bytes(off, &data);
            let mut out = vec![0_u8; data.len()];
            region.load_bytes(off, &mut out);
            prop_assert_eq!(out, data);
        }
    }
}
