//! The map handle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;
use rand::rngs::OsRng;
use shmkv_error::Result;
use shmkv_region::{BackendKind, ShmRegion, StorageBackend};
use tracing::info;

use crate::atomic::now_ns;
use crate::cell::{CellState, cw};
use crate::config::MapConfig;
use crate::context::xw;
use crate::hash::{Candidates, KeyIdentity, hash_key, linear_probe};
use crate::layout::{MAX_CTX, MAX_DB, MapGeometry, hdr, publish_signature};
use crate::mcs::QueueLock;

/// A mapped key-value region.
///
/// Shared by every thread of a process through `Arc`; other processes map
/// the same region and get their own `HashTab`. Threads operate on it
/// through a [`ThreadCtx`](crate::ThreadCtx).
pub struct HashTab {
    region: ShmRegion,
    geom: MapGeometry,
    backend: StorageBackend,
    kind: BackendKind,
}

impl fmt::Debug for HashTab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTab")
            .field("backend", &self.backend)
            .field("ht_size", &self.geom.ht_size)
            .field("seg_count", &self.geom.seg_count)
            .finish_non_exhaustive()
    }
}

impl Drop for HashTab {
    fn drop(&mut self) {
        info!(backend = %self.backend, "map detached");
    }
}

impl HashTab {
    /// Create and initialize a new map.
    pub fn create(config: &MapConfig) -> Result<Arc<Self>> {
        let geom = config.geometry()?;
        let region = ShmRegion::create(&config.backend, geom.map_size as usize)?;
        let kind = config.backend.kind();
        geom.write_header(&region, kind, now_ns());
        let tab = Self {
            region,
            geom,
            backend: config.backend.clone(),
            kind,
        };
        tab.seed_entropy();
        tab.init_segments();
        publish_signature(&tab.region);
        info!(
            backend = %tab.backend,
            map_size = geom.map_size,
            ht_size = geom.ht_size,
            seg_count = geom.seg_count,
            seg_size = geom.seg_size,
            arity = geom.cuckoo_arity,
            buckets = geom.cuckoo_buckets,
            "map created"
        );
        Ok(Arc::new(tab))
    }

    /// Attach to an existing named map (file or POSIX shm).
    pub fn attach(backend: &StorageBackend) -> Result<Arc<Self>> {
        let region = ShmRegion::open(backend)?;
        let tab = Self::from_region_with(region, backend.clone())?;
        info!(backend = %backend, ht_size = tab.geom.ht_size, "map attached");
        Ok(tab)
    }

    /// Attach to a region that is already mapped, e.g. an anonymous map
    /// inherited across `fork`.
    pub fn from_region(region: ShmRegion) -> Result<Arc<Self>> {
        let backend = match region.kind() {
            BackendKind::Anonymous => StorageBackend::Anonymous { huge_pages: false },
            _ => StorageBackend::Heap,
        };
        Self::from_region_with(region, backend)
    }

    fn from_region_with(region: ShmRegion, backend: StorageBackend) -> Result<Arc<Self>> {
        let (geom, kind) = MapGeometry::read_header(&region)?;
        Ok(Arc::new(Self {
            region,
            geom,
            backend,
            kind,
        }))
    }

    fn seed_entropy(&self) {
        for db in 0..MAX_DB {
            let base = self.geom.db_base(db);
            self.region.word(base).store(OsRng.next_u64(), Ordering::Relaxed);
            self.region
                .word(base + 1)
                .store(OsRng.next_u64(), Ordering::Relaxed);
        }
        for ctx in 0..MAX_CTX {
            self.ctx_word(ctx, xw::SEED)
                .store(OsRng.next_u64(), Ordering::Relaxed);
            self.ctx_word(ctx, xw::SEED2)
                .store(OsRng.next_u64(), Ordering::Relaxed);
        }
    }

    pub const fn geom(&self) -> &MapGeometry {
        &self.geom
    }

    pub const fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Backend recorded by the creator.
    pub const fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// The underlying region, for sharing with another handle.
    pub const fn region(&self) -> &ShmRegion {
        &self.region
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Remove the map's name (file or POSIX shm). Mappings stay valid.
    pub fn unlink(&self) -> Result<()> {
        ShmRegion::unlink(&self.backend)
    }

    #[inline]
    pub(crate) fn hdr(&self, idx: usize) -> &AtomicU64 {
        self.region.word(idx)
    }

    #[inline]
    pub(crate) fn ctx_word(&self, ctx: usize, field: usize) -> &AtomicU64 {
        self.region.word(self.geom.ctx_base(ctx) + field)
    }

    #[inline]
    pub(crate) fn cell_word(&self, pos: usize, field: usize) -> &AtomicU64 {
        self.region.word(self.geom.cell_base(pos) + field)
    }

    #[inline]
    pub(crate) const fn qlock(&self) -> QueueLock<'_> {
        QueueLock::new(&self.region, &self.geom)
    }

    /// The seed pair of database `db`.
    pub fn db_seed(&self, db: u8) -> (u64, u64) {
        let base = self.geom.db_base(usize::from(db));
        (
            self.region.word(base).load(Ordering::Relaxed),
            self.region.word(base + 1).load(Ordering::Relaxed),
        )
    }

    /// Key identity of `key` in database `db`.
    pub fn hash_key(&self, db: u8, key: &[u8]) -> KeyIdentity {
        hash_key(self.db_seed(db), key)
    }

    pub(crate) fn open_db(&self, db: u8) {
        self.hdr(hdr::DB_OPENED + usize::from(db) / 64)
            .fetch_or(1 << (db % 64), Ordering::Relaxed);
    }

    /// Databases any context has opened since creation.
    pub fn opened_dbs(&self) -> Vec<u8> {
        (0..=u8::MAX)
            .filter(|&db| {
                self.hdr(hdr::DB_OPENED + usize::from(db) / 64)
                    .load(Ordering::Relaxed)
                    & (1 << (db % 64))
                    != 0
            })
            .collect()
    }

    /// Every cell `id` may live in, in probe order.
    pub(crate) fn candidate_positions(&self, id: KeyIdentity) -> Vec<usize> {
        if self.geom.is_cuckoo() {
            Candidates::compute(id, &self.geom).iter().collect()
        } else {
            linear_probe(id, &self.geom).collect()
        }
    }

    /// Lock-free peek at cell `pos`.
    pub fn cell_state(&self, pos: usize) -> CellState {
        let word = self.cell_word(pos, cw::HASH).load(Ordering::Acquire);
        CellState::decode(
            word,
            self.cell_word(pos, cw::HASH2).load(Ordering::Relaxed),
            self.cell_word(pos, cw::DROP).load(Ordering::Relaxed),
        )
    }

    /// Cuckoo move counters `(begin, end)`; unequal while a move is running.
    pub fn move_counters(&self) -> (u64, u64) {
        (
            self.hdr(hdr::MOVE_BEGIN).load(Ordering::Acquire),
            self.hdr(hdr::MOVE_END).load(Ordering::Acquire),
        )
    }
}
