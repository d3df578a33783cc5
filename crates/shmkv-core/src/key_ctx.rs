//! Key operation context.
//!
//! A `KeyCtx` carries one key through an operation: hash it, lock its cell
//! (`acquire`), read or write the value, and publish (`release`). Readers
//! that do not need the lock use `find`, which copies the cell without
//! locking and validates the copy against the lock word and serial.
//!
//! ```text
//!   Idle --acquire--> Held --release--> Idle
//!   Idle --find-----> Found --release-> Idle
//! ```

use std::hint::spin_loop;
use std::sync::atomic::{Ordering, fence};

use shmkv_error::{KvError, KvStatus, Result};

use crate::atomic::now_ns;
use crate::cell::{
    CELL_HEADER_BYTES, CellFlags, CellMeta, CellState, DROPPED_HASH, EMPTY_HASH, SegRef, ZOMBIE64,
    cw, pack_size, unpack_size,
};
use crate::context::ThreadCtx;
use crate::cuckoo::Relocator;
use crate::hash::{Candidates, KeyIdentity, linear_probe};
use crate::layout::{MAX_MSG_CHAIN, MapGeometry};
use crate::mcs::LockId;
use crate::msg::{MSG_HEADER_BYTES, MsgFlags, MsgHeader, align8, msg_size};
use crate::stats::{Counter, bump};
use crate::table::HashTab;

/// Full rescans before `acquire` reports `Busy`.
const ACQUIRE_RESTARTS: u32 = 8;
/// Spins `find` waits on a locked cell before reporting `Busy`.
const FIND_SPIN_LIMIT: u64 = 4096;
/// Attempts `scan` makes on a cell that keeps changing under it.
const SCAN_RETRIES: u32 = 16;
/// Smallest capacity given to a new list message.
const LIST_MIN_CAPACITY: usize = 256;

/// Where a key context stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    /// The cell is locked by this context.
    Held,
    /// A validated copy of the cell is held.
    Found,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Block,
    Try,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapValue {
    None,
    Bytes(Vec<u8>),
    List(Vec<Vec<u8>>),
}

/// Validated copy of a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    key: Vec<u8>,
    meta: CellMeta,
    serial: u64,
    expire_ns: u64,
    update_ns: u64,
    value: SnapValue,
}

/// How a locked cell relates to the key being acquired.
enum Slot {
    Empty,
    /// Tombstone left by another key.
    Dropped,
    /// Tombstone left by this key.
    Recycle,
    Mine,
    Other { update_ns: u64 },
}

enum Probe {
    Skip,
    /// Linear probing hit an empty cell; the key cannot be further on.
    Stop,
    Done(KvStatus),
}

enum CopyFail {
    NotMine,
    Mutated,
}

/// One key's view of the map.
pub struct KeyCtx<'t> {
    thr: &'t ThreadCtx,
    tab: &'t HashTab,
    db: u8,
    stat_base: usize,
    key: Vec<u8>,
    id: KeyIdentity,
    state: KeyState,
    pos: usize,
    lock: Option<LockId>,
    is_new: bool,
    dirty: bool,
    dropped: bool,
    stamped: bool,
    found: Option<Snapshot>,
}

impl std::fmt::Debug for KeyCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCtx")
            .field("db", &self.db)
            .field("key_len", &self.key.len())
            .field("state", &self.state)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<'t> KeyCtx<'t> {
    /// A key context for database `db`, attaching the database if needed.
    pub fn new(thr: &'t ThreadCtx, db: u8) -> Result<Self> {
        let stat_base = thr.stat_base(db)?;
        Ok(Self {
            thr,
            tab: thr.table(),
            db,
            stat_base,
            key: Vec::new(),
            id: KeyIdentity::default(),
            state: KeyState::Idle,
            pos: 0,
            lock: None,
            is_new: false,
            dirty: false,
            dropped: false,
            stamped: false,
            found: None,
        })
    }

    /// Set the key and compute its identity. Releases any held cell.
    pub fn set_key(&mut self, key: &[u8]) {
        let id = self.tab.hash_key(self.db, key);
        self.set_key_hash(key, id);
    }

    /// Set the key with a precomputed identity.
    pub fn set_key_hash(&mut self, key: &[u8], id: KeyIdentity) {
        if self.state != KeyState::Idle {
            self.release_implicit("set_key");
        }
        self.key.clear();
        self.key.extend_from_slice(key);
        self.id = KeyIdentity::new(id.hash, id.hash2);
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub const fn identity(&self) -> KeyIdentity {
        self.id
    }

    pub const fn db(&self) -> u8 {
        self.db
    }

    pub const fn state(&self) -> KeyState {
        self.state
    }

    /// Cell position of the held or found key.
    pub fn pos(&self) -> Option<usize> {
        (self.state != KeyState::Idle).then_some(self.pos)
    }

    /// Whether the held cell was claimed for a new key.
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    // ---------------------------------------------------------------------
    // Cell helpers
    // ---------------------------------------------------------------------

    fn geom(&self) -> &'t MapGeometry {
        self.tab.geom()
    }

    fn word(&self, pos: usize, field: usize) -> &'t std::sync::atomic::AtomicU64 {
        self.tab.cell_word(pos, field)
    }

    fn stat(&self, counter: Counter, n: u64) {
        bump(self.tab, self.stat_base, counter, n);
    }

    /// Byte offset of a cell's inline data area.
    fn data_off(&self, pos: usize) -> usize {
        self.geom().cell_base(pos) * 8 + CELL_HEADER_BYTES
    }

    fn meta_at(&self, pos: usize) -> CellMeta {
        CellMeta::decode(self.word(pos, cw::META).load(Ordering::Relaxed))
    }

    fn set_meta(&self, meta: CellMeta) {
        self.word(self.pos, cw::META)
            .store(meta.encode(), Ordering::Relaxed);
    }

    fn key_inline(&self) -> bool {
        self.key.len() <= self.geom().inline_capacity()
    }

    fn lock_cell(&self, pos: usize, wait: Wait) -> std::result::Result<(LockId, u64), KvStatus> {
        let lock = self.thr.alloc_lock().ok_or(KvStatus::Busy)?;
        let link = self.word(pos, cw::HASH);
        match wait {
            Wait::Block => {
                let got = self.tab.qlock().acquire(link, pos as u64 + 1, lock);
                self.stat(Counter::Spins, got.spins);
                Ok((lock, got.value))
            }
            Wait::Try => {
                if let Some(prior) = self.tab.qlock().try_acquire(link, pos as u64 + 1, lock) {
                    Ok((lock, prior))
                } else {
                    self.thr.free_lock(lock);
                    Err(KvStatus::Busy)
                }
            }
        }
    }

    fn unlock_cell(&self, pos: usize, lock: LockId, value: u64) {
        let spins = self
            .tab
            .qlock()
            .release(self.word(pos, cw::HASH), value, lock);
        self.thr.free_lock(lock);
        self.stat(Counter::Spins, spins);
    }

    /// With `pos` locked, compare the stored key with ours.
    fn stored_key_matches(&self, pos: usize) -> bool {
        let meta = self.meta_at(pos);
        if meta.db != self.db || usize::from(meta.key_len) != self.key.len() {
            return false;
        }
        let mut stored = vec![0_u8; self.key.len()];
        if meta.flags.contains(CellFlags::KEY_IN_MSG) {
            let Some(r) = SegRef::unpack(self.word(pos, cw::VALUE).load(Ordering::Relaxed)) else {
                return false;
            };
            if !self.tab.valid_ref(r, msg_size(self.key.len(), 0) as u64) {
                return false;
            }
            self.tab.region().load_bytes(
                self.tab.msg_base(r) * 8 + MSG_HEADER_BYTES,
                &mut stored,
            );
        } else {
            self.tab.region().load_bytes(self.data_off(pos), &mut stored);
        }
        stored == self.key
    }

    fn classify(&self, pos: usize, prior: u64) -> Slot {
        let hash2 = self.word(pos, cw::HASH2).load(Ordering::Relaxed);
        let drop = self.word(pos, cw::DROP).load(Ordering::Relaxed);
        match CellState::decode(prior, hash2, drop) {
            CellState::Empty => Slot::Empty,
            CellState::Dropped { saved } if saved == self.id => Slot::Recycle,
            CellState::Dropped { .. } => Slot::Dropped,
            CellState::Occupied { hash }
                if hash == self.id.hash && hash2 == self.id.hash2 && self.stored_key_matches(pos) =>
            {
                Slot::Mine
            }
            CellState::Occupied { .. } | CellState::Locked { .. } => Slot::Other {
                update_ns: self.word(pos, cw::UPDATE).load(Ordering::Relaxed),
            },
        }
    }

    fn hold(&mut self, pos: usize, lock: LockId, is_new: bool) {
        self.pos = pos;
        self.lock = Some(lock);
        self.state = KeyState::Held;
        self.is_new = is_new;
        self.dirty = false;
        self.dropped = false;
        self.stamped = false;
        self.found = None;
    }

    // ---------------------------------------------------------------------
    // Acquire
    // ---------------------------------------------------------------------

    /// Lock the key's cell, claiming one if the key is absent.
    ///
    /// Returns `Ok` when the key exists, `IsNew` when a cell was claimed.
    /// The cell stays locked until [`Self::release`].
    pub fn acquire(&mut self) -> KvStatus {
        self.acquire_with(Wait::Block)
    }

    /// Like [`Self::acquire`] but returns `Busy` instead of queueing.
    pub fn try_acquire(&mut self) -> KvStatus {
        self.acquire_with(Wait::Try)
    }

    fn acquire_with(&mut self, wait: Wait) -> KvStatus {
        if self.state == KeyState::Held {
            return KvStatus::Ok;
        }
        self.state = KeyState::Idle;
        self.found = None;
        if self.key.len() > usize::from(u16::MAX)
            || (!self.key_inline() && self.geom().seg_count == 0)
        {
            return KvStatus::TooBig;
        }
        if self.geom().is_cuckoo() {
            self.acquire_cuckoo(wait)
        } else {
            self.acquire_linear(wait)
        }
    }

    fn acquire_linear(&mut self, wait: Wait) -> KvStatus {
        let geom = *self.geom();
        'restart: for _ in 0..ACQUIRE_RESTARTS {
            let mut first_free = None;
            let mut oldest: Option<(usize, u64, u64)> = None;
            let mut chains = 0;
            for pos in linear_probe(self.id, &geom) {
                let (lock, prior) = match self.lock_cell(pos, wait) {
                    Ok(got) => got,
                    Err(status) => return status,
                };
                match self.classify(pos, prior) {
                    Slot::Mine => {
                        self.stat(Counter::Chains, chains);
                        return self.take_existing(pos, lock, prior);
                    }
                    Slot::Recycle => {
                        self.stat(Counter::Chains, chains);
                        if self.stake(pos, lock, prior) {
                            return self.claim_new(pos, lock, prior);
                        }
                        continue 'restart;
                    }
                    Slot::Empty => {
                        self.stat(Counter::Chains, chains);
                        if let Some(free) = first_free {
                            self.unlock_cell(pos, lock, prior);
                            match self.claim_at(free, wait) {
                                Some(status) => return status,
                                None => continue 'restart,
                            }
                        }
                        if self.stake(pos, lock, prior) {
                            return self.claim_new(pos, lock, prior);
                        }
                        continue 'restart;
                    }
                    Slot::Dropped => {
                        first_free.get_or_insert(pos);
                    }
                    Slot::Other { update_ns } => {
                        if oldest.is_none_or(|(_, _, stamp)| update_ns < stamp) {
                            oldest = Some((pos, prior, update_ns));
                        }
                    }
                }
                self.unlock_cell(pos, lock, prior);
                chains += 1;
            }
            if let Some(free) = first_free {
                if let Some(status) = self.claim_at(free, wait) {
                    return status;
                }
                continue;
            }
            if let Some((pos, hash, _)) = oldest {
                if let Some(status) = self.evict(pos, hash, wait) {
                    return status;
                }
            }
        }
        KvStatus::Busy
    }

    fn acquire_cuckoo(&mut self, wait: Wait) -> KvStatus {
        let cands = Candidates::compute(self.id, self.geom());
        for _ in 0..ACQUIRE_RESTARTS {
            let mut first_free = None;
            let mut recycle = None;
            for pos in cands.iter() {
                let (lock, prior) = match self.lock_cell(pos, wait) {
                    Ok(got) => got,
                    Err(status) => return status,
                };
                match self.classify(pos, prior) {
                    Slot::Mine => return self.take_existing(pos, lock, prior),
                    Slot::Recycle => {
                        recycle = Some((pos, lock, prior));
                        break;
                    }
                    Slot::Empty | Slot::Dropped => {
                        first_free.get_or_insert(pos);
                    }
                    Slot::Other { .. } => {}
                }
                self.unlock_cell(pos, lock, prior);
            }
            if let Some((pos, lock, prior)) = recycle {
                if self.stake(pos, lock, prior) {
                    return self.claim_new(pos, lock, prior);
                }
                continue;
            }
            if let Some(free) = first_free {
                if let Some(status) = self.claim_at(free, wait) {
                    return status;
                }
                continue;
            }
            match Relocator::new(self.tab, self.thr, self.stat_base).relocate(&cands) {
                Ok((pos, lock)) => {
                    if self.stake(pos, lock, EMPTY_HASH) {
                        return self.claim_new(pos, lock, EMPTY_HASH);
                    }
                }
                Err(KvStatus::Busy) => {}
                Err(status) => return status,
            }
        }
        KvStatus::Busy
    }

    /// With `pos` locked by us, advertise our identity in its `HASH2` word
    /// and look for the key in every other candidate, published or held
    /// mid-claim. Of two claimants racing on different cells at least one
    /// sees the other. On a clash the cell is restored and unlocked and the
    /// caller rescans.
    fn stake(&self, pos: usize, lock: LockId, prior: u64) -> bool {
        let hash2 = self.word(pos, cw::HASH2);
        let saved = hash2.swap(self.id.hash2, Ordering::SeqCst);
        let clash = self
            .tab
            .candidate_positions(self.id)
            .into_iter()
            .filter(|&p| p != pos)
            .any(|p| {
                self.word(p, cw::HASH2).load(Ordering::SeqCst) == self.id.hash2 && {
                    let word = self.word(p, cw::HASH).load(Ordering::SeqCst);
                    word == self.id.hash || word & ZOMBIE64 != 0
                }
            });
        if clash {
            hash2.store(saved, Ordering::Relaxed);
            self.unlock_cell(pos, lock, prior);
            tracing::trace!(pos, "acquire: key is claimed in another cell, rescanning");
        }
        !clash
    }

    /// Relock a cell seen free during the scan. `None` means it was taken
    /// in between, or the key showed up elsewhere, and the scan must
    /// restart.
    fn claim_at(&mut self, pos: usize, wait: Wait) -> Option<KvStatus> {
        let (lock, prior) = match self.lock_cell(pos, wait) {
            Ok(got) => got,
            Err(status) => return Some(status),
        };
        match self.classify(pos, prior) {
            Slot::Empty | Slot::Dropped | Slot::Recycle => self
                .stake(pos, lock, prior)
                .then(|| self.claim_new(pos, lock, prior)),
            Slot::Mine => Some(self.take_existing(pos, lock, prior)),
            Slot::Other { .. } => {
                self.unlock_cell(pos, lock, prior);
                None
            }
        }
    }

    /// Replace the least recently updated key of a full probe chain.
    fn evict(&mut self, pos: usize, hash: u64, wait: Wait) -> Option<KvStatus> {
        let (lock, prior) = match self.lock_cell(pos, wait) {
            Ok(got) => got,
            Err(status) => return Some(status),
        };
        if prior != hash {
            self.unlock_cell(pos, lock, prior);
            return None;
        }
        let meta = self.meta_at(pos);
        if !self.stake(pos, lock, prior) {
            return None;
        }
        self.free_value_at(pos, meta);
        self.stat(Counter::HtEvict, 1);
        self.stat(Counter::Drop, 1);
        tracing::debug!(pos, "acquire: evicted oldest key from full chain");
        Some(self.claim_new(pos, lock, prior))
    }

    fn free_value_at(&self, pos: usize, meta: CellMeta) {
        if meta.has_msg() {
            if let Some(head) = SegRef::unpack(self.word(pos, cw::VALUE).load(Ordering::Relaxed)) {
                self.tab.free_chain(head);
            }
        }
    }

    fn take_existing(&mut self, pos: usize, lock: LockId, prior: u64) -> KvStatus {
        self.hold(pos, lock, false);
        let meta = self.meta_at(pos);
        let expire = self.word(pos, cw::EXPIRE).load(Ordering::Relaxed);
        if meta.flags.contains(CellFlags::EXPIRES) && expire != 0 && expire <= now_ns() {
            self.free_value_at(pos, meta);
            self.stat(Counter::Expire, 1);
            self.stat(Counter::Drop, 1);
            return self.init_cell(pos, lock, prior);
        }
        KvStatus::Ok
    }

    fn claim_new(&mut self, pos: usize, lock: LockId, prior: u64) -> KvStatus {
        self.hold(pos, lock, true);
        self.init_cell(pos, lock, prior)
    }

    /// Write a fresh cell for our key. The cell is locked by us.
    fn init_cell(&mut self, pos: usize, lock: LockId, prior: u64) -> KvStatus {
        self.is_new = true;
        let mut meta = CellMeta {
            flags: CellFlags::empty(),
            key_len: self.key.len() as u16,
            db: self.db,
            type_byte: 0,
        };
        let mut value_ref = 0;
        if self.key_inline() {
            self.tab.region().store_bytes(self.data_off(pos), &self.key);
        } else {
            let hdr = MsgHeader::new(
                msg_size(self.key.len(), 0),
                MsgFlags::LIVE | MsgFlags::KEY,
                self.key.len() as u16,
                self.id,
            );
            match self.tab.alloc_msg(self.thr, self.stat_base, &hdr) {
                Ok(r) => {
                    self.tab.region().store_bytes(
                        self.tab.msg_base(r) * 8 + MSG_HEADER_BYTES,
                        &self.key,
                    );
                    value_ref = r.pack();
                    meta.flags |= CellFlags::KEY_IN_MSG;
                }
                Err(status) => {
                    self.state = KeyState::Idle;
                    self.lock = None;
                    // a key whose value was already freed cannot come back
                    let publish = if matches!(prior, EMPTY_HASH | DROPPED_HASH) {
                        prior
                    } else {
                        self.tab.tombstone_cell(pos, prior, self.meta_at(pos));
                        DROPPED_HASH
                    };
                    self.unlock_cell(pos, lock, publish);
                    return status;
                }
            }
        }
        self.word(pos, cw::HASH2).store(self.id.hash2, Ordering::Relaxed);
        self.word(pos, cw::META).store(meta.encode(), Ordering::Relaxed);
        self.word(pos, cw::VALUE).store(value_ref, Ordering::Relaxed);
        self.word(pos, cw::SIZE).store(0, Ordering::Relaxed);
        self.word(pos, cw::EXPIRE).store(0, Ordering::Relaxed);
        self.word(pos, cw::UPDATE).store(0, Ordering::Relaxed);
        self.word(pos, cw::DROP).store(0, Ordering::Relaxed);
        KvStatus::IsNew
    }

    // ---------------------------------------------------------------------
    // Release, tombstone, expiry
    // ---------------------------------------------------------------------

    /// Release on the caller's behalf. Nobody is left to see the status,
    /// so anything but `Ok` is logged.
    fn release_implicit(&mut self, during: &'static str) {
        let status = self.release();
        if status != KvStatus::Ok {
            tracing::debug!(?status, during, pos = self.pos, "implicit release did not succeed");
        }
    }

    /// Publish changes and unlock, or drop a found copy.
    ///
    /// A newly claimed cell released without a value becomes a tombstone.
    pub fn release(&mut self) -> KvStatus {
        let Some(lock) = self.lock.take() else {
            self.state = KeyState::Idle;
            self.found = None;
            return KvStatus::Ok;
        };
        let pos = self.pos;
        let meta = self.meta_at(pos);
        let published = if self.dropped {
            DROPPED_HASH
        } else if self.is_new && !meta.has_value() {
            self.free_value_at(pos, meta);
            self.tab.tombstone_cell(pos, self.id.hash, meta);
            DROPPED_HASH
        } else {
            if self.dirty {
                let serial = self.word(pos, cw::SERIAL).load(Ordering::Relaxed) + 1;
                if meta.has_msg() {
                    if let Some(head) =
                        SegRef::unpack(self.word(pos, cw::VALUE).load(Ordering::Relaxed))
                    {
                        let base = self.tab.msg_base(head);
                        let mut hdr = MsgHeader::load(self.tab.region(), base);
                        hdr.serial = serial;
                        hdr.store_sealed(self.tab.region(), base);
                    }
                }
                if !self.stamped {
                    self.word(pos, cw::UPDATE).store(now_ns(), Ordering::Relaxed);
                    self.set_meta(CellMeta {
                        flags: meta.flags | CellFlags::UPDATED,
                        ..meta
                    });
                }
                self.word(pos, cw::SERIAL).store(serial, Ordering::Release);
                self.stat(Counter::Write, 1);
                if self.is_new {
                    self.stat(Counter::Add, 1);
                }
            }
            self.id.hash
        };
        self.unlock_cell(pos, lock, published);
        self.state = KeyState::Idle;
        self.found = None;
        KvStatus::Ok
    }

    fn require_held(&self) -> std::result::Result<(), KvStatus> {
        if self.state == KeyState::Held && self.lock.is_some() {
            Ok(())
        } else {
            Err(KvStatus::WriteIllegal)
        }
    }

    /// Turn the held cell into a tombstone. Takes effect at release.
    pub fn tombstone(&mut self) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        if self.dropped {
            return KvStatus::Ok;
        }
        let meta = self.meta_at(self.pos);
        self.free_value_at(self.pos, meta);
        self.tab.tombstone_cell(self.pos, self.id.hash, meta);
        self.dropped = true;
        if !self.is_new {
            self.stat(Counter::Drop, 1);
        }
        KvStatus::Ok
    }

    /// Tombstone the held cell and count it as expired.
    pub fn expire(&mut self) -> KvStatus {
        let was_live = !self.is_new && !self.dropped;
        let status = self.tombstone();
        if status == KvStatus::Ok && was_live {
            self.stat(Counter::Expire, 1);
        }
        status
    }

    /// Set the expiration time; 0 clears it.
    pub fn set_expire_ns(&mut self, ns: u64) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        let mut meta = self.meta_at(self.pos);
        meta.flags.set(CellFlags::EXPIRES, ns != 0);
        self.word(self.pos, cw::EXPIRE).store(ns, Ordering::Relaxed);
        self.set_meta(meta);
        self.dirty = true;
        KvStatus::Ok
    }

    pub fn clear_expire(&mut self) -> KvStatus {
        self.set_expire_ns(0)
    }

    /// Set the update stamp explicitly instead of the release time.
    pub fn set_update_ns(&mut self, ns: u64) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        let mut meta = self.meta_at(self.pos);
        meta.flags.set(CellFlags::UPDATED, ns != 0);
        self.word(self.pos, cw::UPDATE).store(ns, Ordering::Relaxed);
        self.set_meta(meta);
        self.stamped = true;
        self.dirty = true;
        KvStatus::Ok
    }

    /// Set the caller-defined value type byte.
    pub fn set_type(&mut self, type_byte: u8) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        let meta = self.meta_at(self.pos);
        self.set_meta(CellMeta { type_byte, ..meta });
        self.dirty = true;
        KvStatus::Ok
    }

    fn current_meta(&self) -> Option<CellMeta> {
        match self.state {
            KeyState::Held => Some(self.meta_at(self.pos)),
            KeyState::Found => self.found.as_ref().map(|s| s.meta),
            KeyState::Idle => None,
        }
    }

    pub fn expire_ns(&self) -> Option<u64> {
        let meta = self.current_meta()?;
        if !meta.flags.contains(CellFlags::EXPIRES) {
            return None;
        }
        match self.state {
            KeyState::Held => Some(self.word(self.pos, cw::EXPIRE).load(Ordering::Relaxed)),
            _ => self.found.as_ref().map(|s| s.expire_ns),
        }
    }

    pub fn update_ns(&self) -> Option<u64> {
        let meta = self.current_meta()?;
        if !meta.flags.contains(CellFlags::UPDATED) {
            return None;
        }
        match self.state {
            KeyState::Held => Some(self.word(self.pos, cw::UPDATE).load(Ordering::Relaxed)),
            _ => self.found.as_ref().map(|s| s.update_ns),
        }
    }

    pub fn value_type(&self) -> Option<u8> {
        self.current_meta().map(|m| m.type_byte)
    }

    /// Serial of the held cell or of the found copy.
    pub fn serial(&self) -> Option<u64> {
        match self.state {
            KeyState::Held => Some(self.word(self.pos, cw::SERIAL).load(Ordering::Relaxed)),
            KeyState::Found => self.found.as_ref().map(|s| s.serial),
            KeyState::Idle => None,
        }
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    /// Make room for a `size`-byte value, replacing any current value.
    ///
    /// Small values go inline in the cell, larger ones into a segment
    /// message. The new bytes are zero.
    pub fn alloc(&mut self, size: usize) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        if size > self.geom().max_value_size as usize {
            return KvStatus::TooBig;
        }
        let pos = self.pos;
        let mut meta = self.meta_at(pos);
        let key_in_msg = meta.flags.contains(CellFlags::KEY_IN_MSG);
        let old = SegRef::unpack(self.word(pos, cw::VALUE).load(Ordering::Relaxed))
            .filter(|_| meta.has_msg());

        if !key_in_msg && align8(self.key.len()) + size <= self.geom().inline_capacity() {
            if let Some(old) = old {
                self.tab.free_chain(old);
            }
            self.tab
                .region()
                .zero_bytes(self.data_off(pos) + align8(self.key.len()), size);
            meta.flags.remove(CellFlags::SEGMENT | CellFlags::MSG_LIST);
            meta.flags.insert(CellFlags::IMMEDIATE);
            self.word(pos, cw::VALUE).store(0, Ordering::Relaxed);
            self.word(pos, cw::SIZE)
                .store(pack_size(size as u32, 0), Ordering::Relaxed);
        } else {
            let stored_key = if key_in_msg { self.key.len() } else { 0 };
            let mut hdr = MsgHeader::new(
                msg_size(stored_key, size),
                if key_in_msg {
                    MsgFlags::LIVE | MsgFlags::KEY
                } else {
                    MsgFlags::LIVE
                },
                stored_key as u16,
                self.id,
            );
            hdr.payload_len = size as u32;
            let r = match self.tab.alloc_msg(self.thr, self.stat_base, &hdr) {
                Ok(r) => r,
                Err(status) => return status,
            };
            hdr.store_unsealed(self.tab.region(), self.tab.msg_base(r));
            let msg_off = self.tab.msg_base(r) * 8;
            if key_in_msg {
                self.tab
                    .region()
                    .store_bytes(msg_off + MSG_HEADER_BYTES, &self.key);
            }
            self.tab
                .region()
                .zero_bytes(msg_off + hdr.payload_offset(), size);
            if let Some(old) = old {
                self.tab.free_chain(old);
            }
            meta.flags.remove(CellFlags::IMMEDIATE | CellFlags::MSG_LIST);
            meta.flags.insert(CellFlags::SEGMENT);
            self.word(pos, cw::VALUE).store(r.pack(), Ordering::Relaxed);
            self.word(pos, cw::SIZE)
                .store(pack_size(size as u32, hdr.size), Ordering::Relaxed);
        }
        self.set_meta(meta);
        self.dirty = true;
        KvStatus::Ok
    }

    /// Byte offset of the current value's first byte, and its length.
    fn value_area(&self) -> std::result::Result<(usize, usize), KvStatus> {
        let meta = self.meta_at(self.pos);
        let (len, _) = unpack_size(self.word(self.pos, cw::SIZE).load(Ordering::Relaxed));
        if meta.flags.contains(CellFlags::MSG_LIST) {
            return Err(KvStatus::NoValue);
        }
        if meta.flags.contains(CellFlags::IMMEDIATE) {
            return Ok((self.data_off(self.pos) + align8(self.key.len()), len as usize));
        }
        if meta.flags.contains(CellFlags::SEGMENT) {
            let r = SegRef::unpack(self.word(self.pos, cw::VALUE).load(Ordering::Relaxed))
                .ok_or(KvStatus::NoValue)?;
            let base = self.tab.msg_base(r);
            let hdr = MsgHeader::load(self.tab.region(), base);
            return Ok((base * 8 + hdr.payload_offset(), len as usize));
        }
        Err(KvStatus::NoValue)
    }

    /// Overwrite part of the current value.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        let (off, len) = match self.value_area() {
            Ok(area) => area,
            Err(status) => return status,
        };
        if offset + data.len() > len {
            return KvStatus::TooBig;
        }
        self.tab.region().store_bytes(off + offset, data);
        self.dirty = true;
        KvStatus::Ok
    }

    /// Replace the value with `data`.
    pub fn load(&mut self, data: &[u8]) -> KvStatus {
        match self.alloc(data.len()) {
            KvStatus::Ok => self.write(0, data),
            status => status,
        }
    }

    /// Change the value's size, keeping the common prefix.
    pub fn resize(&mut self, new_size: usize) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        let old = self.value().unwrap_or_default();
        match self.alloc(new_size) {
            KvStatus::Ok => {}
            status => return status,
        }
        let keep = old.len().min(new_size);
        if keep == 0 {
            return KvStatus::Ok;
        }
        self.write(0, &old[..keep])
    }

    /// Copy of the value. Lists are read with [`Self::read_vector`].
    pub fn value(&self) -> std::result::Result<Vec<u8>, KvStatus> {
        match self.state {
            KeyState::Held => {
                let (off, len) = self.value_area()?;
                let mut out = vec![0_u8; len];
                self.tab.region().load_bytes(off, &mut out);
                Ok(out)
            }
            KeyState::Found => match self.found.as_ref().map(|s| &s.value) {
                Some(SnapValue::Bytes(bytes)) => Ok(bytes.clone()),
                _ => Err(KvStatus::NoValue),
            },
            KeyState::Idle => Err(KvStatus::NoValue),
        }
    }

    /// Copy the value into `buf`, returning its length. `PartOnly` when
    /// `buf` held only a prefix.
    pub fn value_into(&self, buf: &mut [u8]) -> std::result::Result<usize, KvStatus> {
        let value = self.value()?;
        let n = value.len().min(buf.len());
        buf[..n].copy_from_slice(&value[..n]);
        if n < value.len() {
            Err(KvStatus::PartOnly)
        } else {
            Ok(n)
        }
    }

    /// Length of the value (for lists, of all encoded records).
    pub fn value_len(&self) -> std::result::Result<usize, KvStatus> {
        match self.state {
            KeyState::Held => {
                let meta = self.meta_at(self.pos);
                if !meta.has_value() {
                    return Err(KvStatus::NoValue);
                }
                let (len, _) = unpack_size(self.word(self.pos, cw::SIZE).load(Ordering::Relaxed));
                Ok(len as usize)
            }
            KeyState::Found => match self.found.as_ref().map(|s| &s.value) {
                Some(SnapValue::Bytes(bytes)) => Ok(bytes.len()),
                Some(SnapValue::List(records)) => {
                    Ok(records.iter().map(|r| r.len() + 4).sum())
                }
                _ => Err(KvStatus::NoValue),
            },
            KeyState::Idle => Err(KvStatus::NoValue),
        }
    }

    /// Append records to a list value, chaining a new message when the
    /// head is full.
    pub fn append_vector(&mut self, records: &[&[u8]]) -> KvStatus {
        if let Err(status) = self.require_held() {
            return status;
        }
        if self.geom().seg_count == 0 {
            return KvStatus::TooBig;
        }
        let encoded: usize = records.iter().map(|r| r.len() + 4).sum();
        let max = self.geom().max_value_size as usize;
        if encoded > max {
            return KvStatus::TooBig;
        }
        let pos = self.pos;
        let mut meta = self.meta_at(pos);
        let key_in_msg = meta.flags.contains(CellFlags::KEY_IN_MSG);
        let head = SegRef::unpack(self.word(pos, cw::VALUE).load(Ordering::Relaxed));
        let (total, _) = unpack_size(self.word(pos, cw::SIZE).load(Ordering::Relaxed));

        let is_list = meta.flags.contains(CellFlags::SEGMENT | CellFlags::MSG_LIST);
        if let (true, Some(head)) = (is_list, head) {
            let base = self.tab.msg_base(head);
            let mut hdr = MsgHeader::load(self.tab.region(), base);
            if hdr.capacity().saturating_sub(hdr.payload_len as usize) >= encoded {
                let at = base * 8 + hdr.payload_offset() + hdr.payload_len as usize;
                self.write_records(at, records);
                hdr.payload_len += encoded as u32;
                hdr.count += records.len() as u32;
                hdr.store_unsealed(self.tab.region(), base);
                self.word(pos, cw::SIZE)
                    .store(pack_size(total + encoded as u32, hdr.size), Ordering::Relaxed);
                self.dirty = true;
                return KvStatus::Ok;
            }
            if self.chain_len(head) >= MAX_MSG_CHAIN {
                return KvStatus::MsgListFull;
            }
            let cap = encoded.max((hdr.capacity() * 2).min(max));
            let serial = self.word(pos, cw::SERIAL).load(Ordering::Relaxed) + 1;
            hdr.serial = serial;
            hdr.store_sealed(self.tab.region(), base);
            let r = match self.new_list_msg(cap, Some(head), records, key_in_msg) {
                Ok(r) => r,
                Err(status) => return status,
            };
            let size = MsgHeader::load(self.tab.region(), self.tab.msg_base(r)).size;
            self.word(pos, cw::VALUE).store(r.pack(), Ordering::Relaxed);
            self.word(pos, cw::SIZE)
                .store(pack_size(total + encoded as u32, size), Ordering::Relaxed);
            self.dirty = true;
            return KvStatus::Ok;
        }

        let cap = encoded.max(LIST_MIN_CAPACITY).min(max.max(encoded));
        let r = match self.new_list_msg(cap, None, records, key_in_msg) {
            Ok(r) => r,
            Err(status) => return status,
        };
        if meta.has_msg() {
            if let Some(old) = head {
                self.tab.free_chain(old);
            }
        }
        let size = MsgHeader::load(self.tab.region(), self.tab.msg_base(r)).size;
        meta.flags.remove(CellFlags::IMMEDIATE);
        meta.flags.insert(CellFlags::SEGMENT | CellFlags::MSG_LIST);
        self.set_meta(meta);
        self.word(pos, cw::VALUE).store(r.pack(), Ordering::Relaxed);
        self.word(pos, cw::SIZE)
            .store(pack_size(encoded as u32, size), Ordering::Relaxed);
        self.dirty = true;
        KvStatus::Ok
    }

    fn new_list_msg(
        &self,
        cap: usize,
        prev: Option<SegRef>,
        records: &[&[u8]],
        key_in_msg: bool,
    ) -> std::result::Result<SegRef, KvStatus> {
        let stored_key = if key_in_msg { self.key.len() } else { 0 };
        let mut flags = MsgFlags::LIVE | MsgFlags::LIST;
        if key_in_msg {
            flags |= MsgFlags::KEY;
        }
        let mut hdr = MsgHeader::new(msg_size(stored_key, cap), flags, stored_key as u16, self.id);
        let r = self.tab.alloc_msg(self.thr, self.stat_base, &hdr)?;
        let base = self.tab.msg_base(r);
        if key_in_msg {
            self.tab
                .region()
                .store_bytes(base * 8 + MSG_HEADER_BYTES, &self.key);
        }
        let encoded = self.write_records(base * 8 + hdr.payload_offset(), records);
        hdr.prev = prev;
        hdr.payload_len = encoded as u32;
        hdr.count = records.len() as u32;
        hdr.store_unsealed(self.tab.region(), base);
        Ok(r)
    }

    fn write_records(&self, mut at: usize, records: &[&[u8]]) -> usize {
        let start = at;
        for rec in records {
            self.tab
                .region()
                .store_bytes(at, &(rec.len() as u32).to_le_bytes());
            self.tab.region().store_bytes(at + 4, rec);
            at += 4 + rec.len();
        }
        at - start
    }

    fn chain_len(&self, head: SegRef) -> usize {
        let mut n = 0;
        let mut cur = Some(head);
        while let Some(r) = cur {
            n += 1;
            if n >= MAX_MSG_CHAIN || !self.tab.valid_ref(r, MSG_HEADER_BYTES as u64) {
                break;
            }
            cur = MsgHeader::load(self.tab.region(), self.tab.msg_base(r)).prev;
        }
        n
    }

    /// Every record of a list value, oldest first.
    pub fn read_vector(&self) -> std::result::Result<Vec<Vec<u8>>, KvStatus> {
        match self.state {
            KeyState::Held => {
                let meta = self.meta_at(self.pos);
                if !meta.flags.contains(CellFlags::MSG_LIST) {
                    return Err(KvStatus::NoValue);
                }
                let head = SegRef::unpack(self.word(self.pos, cw::VALUE).load(Ordering::Relaxed))
                    .ok_or(KvStatus::NoValue)?;
                self.read_chain(head, false).map_err(|_| KvStatus::NoValue)
            }
            KeyState::Found => match self.found.as_ref().map(|s| &s.value) {
                Some(SnapValue::List(records)) => Ok(records.clone()),
                _ => Err(KvStatus::NoValue),
            },
            KeyState::Idle => Err(KvStatus::NoValue),
        }
    }

    /// Number of records in a list value.
    pub fn msg_count(&self) -> std::result::Result<usize, KvStatus> {
        self.read_vector().map(|r| r.len())
    }

    /// Decode a message chain. With `checked`, every header must be sealed
    /// and carry our identity; failures mean a concurrent change.
    fn read_chain(&self, head: SegRef, checked: bool) -> std::result::Result<Vec<Vec<u8>>, CopyFail> {
        let max = self.geom().max_value_size as usize;
        let mut chunks = Vec::new();
        let mut cur = Some(head);
        let mut hops = 0;
        while let Some(r) = cur {
            hops += 1;
            if hops > MAX_MSG_CHAIN || !self.tab.valid_ref(r, MSG_HEADER_BYTES as u64) {
                return Err(CopyFail::Mutated);
            }
            let base = self.tab.msg_base(r);
            let hdr = MsgHeader::load(self.tab.region(), base);
            if checked && (!hdr.is_sealed() || hdr.id != self.id) {
                return Err(CopyFail::Mutated);
            }
            let len = hdr.payload_len as usize;
            if len > max || len > hdr.capacity() || !self.tab.valid_ref(r, u64::from(hdr.size)) {
                return Err(CopyFail::Mutated);
            }
            let mut payload = vec![0_u8; len];
            self.tab
                .region()
                .load_bytes(base * 8 + hdr.payload_offset(), &mut payload);
            chunks.push((payload, hdr.count));
            cur = hdr.prev;
        }
        let mut records = Vec::new();
        for (payload, count) in chunks.into_iter().rev() {
            let mut at = 0;
            for _ in 0..count {
                if at + 4 > payload.len() {
                    return Err(CopyFail::Mutated);
                }
                let mut len = [0_u8; 4];
                len.copy_from_slice(&payload[at..at + 4]);
                let len = u32::from_le_bytes(len) as usize;
                if at + 4 + len > payload.len() {
                    return Err(CopyFail::Mutated);
                }
                records.push(payload[at + 4..at + 4 + len].to_vec());
                at += 4 + len;
            }
        }
        Ok(records)
    }

    // ---------------------------------------------------------------------
    // Lock-free reads
    // ---------------------------------------------------------------------

    /// Look the key up without locking.
    ///
    /// `Ok` leaves a validated copy readable through the value accessors.
    /// `Mutated` means a writer or a cuckoo move raced the copy; retry.
    pub fn find(&mut self) -> KvStatus {
        if self.state == KeyState::Held {
            return KvStatus::Ok;
        }
        self.state = KeyState::Idle;
        self.found = None;
        self.stat(Counter::Read, 1);
        let geom = *self.geom();
        let moves_before = self.tab.move_counters();
        let positions = self.tab.candidate_positions(self.id);
        for pos in positions {
            match self.probe(pos, true) {
                Probe::Skip => {}
                Probe::Stop if !geom.is_cuckoo() => break,
                Probe::Stop => {}
                Probe::Done(status) => return status,
            }
        }
        if geom.is_cuckoo() {
            let (begin, _) = self.tab.move_counters();
            if moves_before.0 != moves_before.1 || begin != moves_before.0 {
                return KvStatus::Mutated;
            }
        }
        self.stat(Counter::Miss, 1);
        KvStatus::NotFound
    }

    /// Read whatever cell `pos` holds, adopting its key.
    ///
    /// Returns `NotFound` for empty cells and for keys of other databases,
    /// `Tombstone` for dropped ones; used to scan the table.
    pub fn fetch(&mut self, pos: usize) -> KvStatus {
        if self.state != KeyState::Idle {
            self.release_implicit("fetch");
        }
        if pos as u64 >= self.geom().ht_size {
            return KvStatus::NotFound;
        }
        self.stat(Counter::Read, 1);
        match self.probe(pos, false) {
            Probe::Skip | Probe::Stop => KvStatus::NotFound,
            Probe::Done(status) => status,
        }
    }

    fn probe(&mut self, pos: usize, match_key: bool) -> Probe {
        let link = self.word(pos, cw::HASH);
        let mut word = link.load(Ordering::Acquire);
        let mut spins = 0;
        while word & ZOMBIE64 != 0 {
            if spins >= FIND_SPIN_LIMIT {
                self.stat(Counter::Spins, spins);
                return Probe::Done(KvStatus::Busy);
            }
            spin_loop();
            spins += 1;
            word = link.load(Ordering::Acquire);
        }
        self.stat(Counter::Spins, spins);
        match word {
            EMPTY_HASH => return Probe::Stop,
            DROPPED_HASH if match_key => return Probe::Skip,
            DROPPED_HASH => return Probe::Done(KvStatus::Tombstone),
            h if match_key && h != self.id.hash => return Probe::Skip,
            _ => {}
        }
        match self.copy_cell(pos, word, match_key) {
            Ok(snap) => {
                let expired = snap.meta.flags.contains(CellFlags::EXPIRES)
                    && snap.expire_ns != 0
                    && snap.expire_ns <= now_ns();
                if !match_key {
                    self.key.clone_from(&snap.key);
                    self.id = KeyIdentity {
                        hash: word,
                        hash2: self.word(pos, cw::HASH2).load(Ordering::Relaxed),
                    };
                }
                self.pos = pos;
                self.found = Some(snap);
                self.state = KeyState::Found;
                if expired {
                    Probe::Done(KvStatus::Expired)
                } else {
                    self.stat(Counter::Hit, 1);
                    Probe::Done(KvStatus::Ok)
                }
            }
            Err(CopyFail::NotMine) => Probe::Skip,
            Err(CopyFail::Mutated) => Probe::Done(KvStatus::Mutated),
        }
    }

    /// Optimistically copy cell `pos`, whose lock word read as `word`.
    fn copy_cell(
        &mut self,
        pos: usize,
        word: u64,
        match_key: bool,
    ) -> std::result::Result<Snapshot, CopyFail> {
        let serial = self.word(pos, cw::SERIAL).load(Ordering::Acquire);
        let attempt = self.copy_body(pos, word, serial, match_key);
        fence(Ordering::Acquire);
        let word2 = self.word(pos, cw::HASH).load(Ordering::Relaxed);
        let serial2 = self.word(pos, cw::SERIAL).load(Ordering::Relaxed);
        if word2 != word || serial2 != serial {
            return Err(CopyFail::Mutated);
        }
        attempt
    }

    fn copy_body(
        &mut self,
        pos: usize,
        word: u64,
        serial: u64,
        match_key: bool,
    ) -> std::result::Result<Snapshot, CopyFail> {
        let r = |field: usize| self.word(pos, field).load(Ordering::Relaxed);
        let hash2 = r(cw::HASH2);
        let meta = CellMeta::decode(r(cw::META));
        let value_ref = SegRef::unpack(r(cw::VALUE));
        let (value_len, msg_len) = unpack_size(r(cw::SIZE));
        let expire_ns = r(cw::EXPIRE);
        let update_ns = r(cw::UPDATE);
        if meta.db != self.db
            || (match_key
                && (hash2 != self.id.hash2 || usize::from(meta.key_len) != self.key.len()))
        {
            return Err(CopyFail::NotMine);
        }
        if !match_key {
            self.id = KeyIdentity { hash: word, hash2 };
        }

        let key_len = usize::from(meta.key_len);
        let geom = self.geom();
        let mut key = vec![0_u8; key_len];
        if meta.flags.contains(CellFlags::KEY_IN_MSG) {
            let head = value_ref.ok_or(CopyFail::Mutated)?;
            if !self.tab.valid_ref(head, msg_size(key_len, 0) as u64) {
                return Err(CopyFail::Mutated);
            }
            self.tab
                .region()
                .load_bytes(self.tab.msg_base(head) * 8 + MSG_HEADER_BYTES, &mut key);
        } else {
            if key_len > geom.inline_capacity() {
                return Err(CopyFail::Mutated);
            }
            self.tab.region().load_bytes(self.data_off(pos), &mut key);
        }
        if match_key && key != self.key {
            return Err(CopyFail::NotMine);
        }

        let value = if meta.flags.contains(CellFlags::IMMEDIATE) {
            let len = value_len as usize;
            if align8(key_len) + len > geom.inline_capacity() {
                return Err(CopyFail::Mutated);
            }
            let mut bytes = vec![0_u8; len];
            self.tab
                .region()
                .load_bytes(self.data_off(pos) + align8(key_len), &mut bytes);
            SnapValue::Bytes(bytes)
        } else if meta.flags.contains(CellFlags::SEGMENT) {
            let head = value_ref.ok_or(CopyFail::Mutated)?;
            if meta.flags.contains(CellFlags::MSG_LIST) {
                SnapValue::List(self.read_chain(head, true)?)
            } else {
                let len = value_len as usize;
                if len > geom.max_value_size as usize
                    || !self.tab.valid_ref(head, u64::from(msg_len))
                {
                    return Err(CopyFail::Mutated);
                }
                let base = self.tab.msg_base(head);
                let hdr = MsgHeader::load(self.tab.region(), base);
                if !hdr.is_sealed() || hdr.id != self.id || hdr.capacity() < len {
                    return Err(CopyFail::Mutated);
                }
                let mut bytes = vec![0_u8; len];
                self.tab
                    .region()
                    .load_bytes(base * 8 + hdr.payload_offset(), &mut bytes);
                SnapValue::Bytes(bytes)
            }
        } else {
            SnapValue::None
        };

        Ok(Snapshot {
            key,
            meta,
            serial,
            expire_ns,
            update_ns,
            value,
        })
    }
}

impl Drop for KeyCtx<'_> {
    fn drop(&mut self) {
        if self.lock.is_some() {
            self.release_implicit("drop");
        }
    }
}

impl HashTab {
    /// Visit every live key of database `db`, in directory order.
    ///
    /// `visit` sees a key context holding a validated copy of the cell.
    /// Expired keys are skipped. A key relocated while the scan runs may be
    /// seen twice or not at all. Returns the number of keys visited.
    pub fn scan<F>(&self, thr: &ThreadCtx, db: u8, mut visit: F) -> Result<usize>
    where
        F: FnMut(&KeyCtx<'_>),
    {
        if !std::ptr::eq(thr.table().as_ref(), self) {
            return Err(KvError::BadContext {
                ctx_id: thr.id().index() as u32,
                expected: "attached to this map",
            });
        }
        let mut kctx = KeyCtx::new(thr, db)?;
        let mut seen = 0;
        for pos in 0..self.geom().ht_size as usize {
            for _ in 0..SCAN_RETRIES {
                match kctx.fetch(pos) {
                    KvStatus::Ok => {
                        visit(&kctx);
                        seen += 1;
                        break;
                    }
                    KvStatus::Mutated | KvStatus::Busy => spin_loop(),
                    _ => break,
                }
            }
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::MapConfig;

    fn table(cfg: MapConfig) -> Arc<HashTab> {
        HashTab::create(&cfg).unwrap()
    }

    fn small() -> MapConfig {
        MapConfig {
            map_size: 2 << 20,
            max_value_size: 4096,
            ..MapConfig::default()
        }
    }

    fn put(kctx: &mut KeyCtx<'_>, key: &[u8], value: &[u8]) {
        kctx.set_key(key);
        assert!(kctx.acquire().is_success());
        assert_eq!(kctx.load(value), KvStatus::Ok);
        assert_eq!(kctx.release(), KvStatus::Ok);
    }

    #[test]
    fn insert_then_find_inline() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"alpha");
        assert_eq!(k.acquire(), KvStatus::IsNew);
        assert_eq!(k.load(b"one"), KvStatus::Ok);
        assert_eq!(k.release(), KvStatus::Ok);

        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.value().unwrap(), b"one");
        assert_eq!(k.state(), KeyState::Found);
        assert_eq!(k.release(), KvStatus::Ok);

        assert_eq!(k.acquire(), KvStatus::Ok);
        assert_eq!(k.value().unwrap(), b"one");
        assert_eq!(k.release(), KvStatus::Ok);
        assert_eq!(thr.locks_held(), 0);
    }

    #[test]
    fn segment_value_round_trip() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        let big: Vec<u8> = (0..3000_u32).map(|i| (i % 251) as u8).collect();
        put(&mut k, b"big", &big);
        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.value().unwrap(), big);
        let mut small_buf = [0_u8; 10];
        assert_eq!(k.value_into(&mut small_buf), Err(KvStatus::PartOnly));
        assert_eq!(&small_buf, &big[..10]);
    }

    #[test]
    fn value_too_big_is_rejected() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"k");
        k.acquire();
        assert_eq!(k.alloc(4097), KvStatus::TooBig);
        k.release();
        assert_eq!(k.find(), KvStatus::NotFound);
    }

    #[test]
    fn release_without_value_leaves_tombstone() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"ghost");
        assert_eq!(k.acquire(), KvStatus::IsNew);
        let pos = k.pos().unwrap();
        k.release();
        assert!(matches!(tab.cell_state(pos), CellState::Dropped { .. }));
        assert_eq!(k.find(), KvStatus::NotFound);
        assert_eq!(k.acquire(), KvStatus::IsNew);
        assert_eq!(k.pos(), Some(pos));
        k.release();
    }

    #[test]
    fn tombstone_twice_is_idempotent() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        put(&mut k, b"gone", b"soon");
        for _ in 0..2 {
            k.set_key(b"gone");
            assert!(k.acquire().is_success());
            assert_eq!(k.tombstone(), KvStatus::Ok);
            assert_eq!(k.tombstone(), KvStatus::Ok);
            k.release();
            assert_eq!(k.find(), KvStatus::NotFound);
        }
        let totals = tab.totals();
        assert_eq!(totals.add, 1);
        assert_eq!(totals.drop, 1);
    }

    #[test]
    fn writes_need_the_lock() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        put(&mut k, b"ro", b"value");
        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.load(b"x"), KvStatus::WriteIllegal);
        assert_eq!(k.tombstone(), KvStatus::WriteIllegal);
        assert_eq!(k.append_vector(&[b"x"]), KvStatus::WriteIllegal);
    }

    #[test]
    fn resize_keeps_prefix_across_storage_kinds() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"grow");
        k.acquire();
        assert_eq!(k.load(b"abcdef"), KvStatus::Ok);
        assert_eq!(k.resize(1000), KvStatus::Ok);
        let v = k.value().unwrap();
        assert_eq!(v.len(), 1000);
        assert_eq!(&v[..6], b"abcdef");
        assert!(v[6..].iter().all(|&b| b == 0));
        assert_eq!(k.resize(3), KvStatus::Ok);
        assert_eq!(k.value().unwrap(), b"abc");
        k.release();
        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.value().unwrap(), b"abc");
    }

    #[test]
    fn long_keys_live_in_messages() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        let key = vec![b'k'; 200];
        put(&mut k, &key, b"v");
        let mut other = KeyCtx::new(&thr, 0).unwrap();
        other.set_key(&key);
        assert_eq!(other.find(), KvStatus::Ok);
        assert_eq!(other.value().unwrap(), b"v");
        let mut near = key.clone();
        near[199] = b'j';
        other.set_key(&near);
        assert_eq!(other.find(), KvStatus::NotFound);
    }

    #[test]
    fn list_values_chain_messages() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"log");
        k.acquire();
        let rec = [7_u8; 100];
        for _ in 0..20 {
            assert_eq!(k.append_vector(&[&rec]), KvStatus::Ok);
        }
        assert_eq!(k.msg_count().unwrap(), 20);
        assert_eq!(k.value(), Err(KvStatus::NoValue));
        k.release();
        assert_eq!(k.find(), KvStatus::Ok);
        let records = k.read_vector().unwrap();
        assert_eq!(records.len(), 20);
        assert!(records.iter().all(|r| r.as_slice() == rec));
        assert_eq!(k.value_len().unwrap(), 20 * 104);
    }

    #[test]
    fn list_chain_limit() {
        let tab = table(MapConfig {
            max_value_size: 64,
            ..small()
        });
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"chain");
        k.acquire();
        let rec = [1_u8; 60];
        let mut status = KvStatus::Ok;
        let mut appended = 0;
        while status == KvStatus::Ok && appended < 200 {
            status = k.append_vector(&[&rec]);
            if status == KvStatus::Ok {
                appended += 1;
            }
        }
        assert_eq!(status, KvStatus::MsgListFull);
        assert_eq!(appended, MAX_MSG_CHAIN);
        k.release();
    }

    #[test]
    fn expired_keys_report_and_recycle() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"ttl");
        k.acquire();
        k.load(b"v");
        assert_eq!(k.set_expire_ns(1), KvStatus::Ok);
        k.release();
        assert_eq!(k.find(), KvStatus::Expired);
        assert_eq!(k.expire_ns(), Some(1));
        assert_eq!(k.acquire(), KvStatus::IsNew);
        assert_eq!(k.value(), Err(KvStatus::NoValue));
        k.release();
        assert_eq!(tab.totals().expire, 1);
    }

    #[test]
    fn stamps_and_value_type() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"typed");
        k.acquire();
        k.load(b"v");
        k.set_type(9);
        k.set_update_ns(12345);
        k.release();
        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.value_type(), Some(9));
        assert_eq!(k.update_ns(), Some(12345));
        assert_eq!(k.expire_ns(), None);
    }

    #[test]
    fn fetch_scans_every_state() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        put(&mut k, b"a", b"1");
        put(&mut k, b"b", b"2");
        k.set_key(b"c");
        k.acquire();
        k.release();
        let mut scan = KeyCtx::new(&thr, 0).unwrap();
        let mut keys = Vec::new();
        let mut tombstones = 0;
        for pos in 0..tab.geom().ht_size as usize {
            match scan.fetch(pos) {
                KvStatus::Ok => keys.push((scan.key().to_vec(), scan.value().unwrap())),
                KvStatus::Tombstone => tombstones += 1,
                KvStatus::NotFound => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        keys.sort();
        assert_eq!(keys, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
        assert_eq!(tombstones, 1);
    }

    #[test]
    fn scan_visits_one_database() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k0 = KeyCtx::new(&thr, 0).unwrap();
        let mut k5 = KeyCtx::new(&thr, 5).unwrap();
        for i in 0..10_u8 {
            put(&mut k0, &[b'k', i], &[i]);
        }
        put(&mut k5, b"other", b"db");
        let mut keys = Vec::new();
        let seen = tab.scan(&thr, 0, |k| keys.push(k.key().to_vec())).unwrap();
        assert_eq!(seen, 10);
        keys.sort();
        assert_eq!(keys, (0..10_u8).map(|i| vec![b'k', i]).collect::<Vec<_>>());
        let mut other = Vec::new();
        tab.scan(&thr, 5, |k| other.push(k.value().unwrap())).unwrap();
        assert_eq!(other, vec![b"db".to_vec()]);
    }

    #[test]
    fn scan_rejects_foreign_context() {
        let tab = table(small());
        let other = table(small());
        let thr = other.attach_ctx(1).unwrap();
        assert!(tab.scan(&thr, 0, |_| {}).is_err());
    }

    #[test]
    fn clear_expire_keeps_key_live() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"lease");
        k.acquire();
        k.load(b"v");
        k.set_expire_ns(1);
        assert_eq!(k.clear_expire(), KvStatus::Ok);
        k.release();
        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.expire_ns(), None);
    }

    #[test]
    fn full_linear_chain_evicts_oldest() {
        let tab = table(MapConfig {
            ht_cells: 16,
            max_chains: 16,
            ..small()
        });
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        for i in 0..16_u32 {
            k.set_key(&i.to_le_bytes());
            k.acquire();
            k.load(b"x");
            k.set_update_ns(u64::from(i) + 100);
            k.release();
        }
        k.set_key(b"newcomer");
        assert_eq!(k.acquire(), KvStatus::IsNew);
        k.load(b"y");
        k.release();
        k.set_key(&0_u32.to_le_bytes());
        assert_eq!(k.find(), KvStatus::NotFound);
        assert_eq!(tab.totals().htevict, 1);
    }

    #[test]
    fn try_acquire_reports_busy() {
        let tab = table(small());
        let a = tab.attach_ctx(1).unwrap();
        let mut holder = KeyCtx::new(&a, 0).unwrap();
        holder.set_key(b"hot");
        holder.acquire();
        let pos = holder.pos().unwrap();

        let tab2 = Arc::clone(&tab);
        let busy = std::thread::spawn(move || {
            let b = tab2.attach_ctx(2).unwrap();
            let mut k = KeyCtx::new(&b, 0).unwrap();
            k.set_key(b"hot");
            (k.try_acquire(), k.find())
        })
        .join()
        .unwrap();
        assert_eq!(busy, (KvStatus::Busy, KvStatus::Busy));
        assert!(matches!(tab.cell_state(pos), CellState::Locked { .. }));
        holder.release();
    }

    #[test]
    fn claim_backs_off_when_the_key_is_staked_in_another_cell() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut first = KeyCtx::new(&thr, 0).unwrap();
        let mut second = KeyCtx::new(&thr, 0).unwrap();
        first.set_key(b"contended");
        second.set_key(b"contended");
        let cands = tab.candidate_positions(first.id);
        let (p0, p1) = (cands[0], cands[1]);

        // `first` is mid-claim at p0 when `second` locks p1.
        let (lock0, prior0) = first.lock_cell(p0, Wait::Block).unwrap();
        assert!(first.stake(p0, lock0, prior0));
        let (lock1, prior1) = second.lock_cell(p1, Wait::Block).unwrap();
        assert!(!second.stake(p1, lock1, prior1));
        assert_eq!(tab.cell_state(p1), CellState::Empty);

        assert_eq!(first.claim_new(p0, lock0, prior0), KvStatus::IsNew);
        assert_eq!(first.load(b"once"), KvStatus::Ok);
        assert_eq!(first.release(), KvStatus::Ok);

        // the rescan finds the published cell
        assert_eq!(second.acquire(), KvStatus::Ok);
        assert_eq!(second.pos(), Some(p0));
        assert_eq!(second.value().unwrap(), b"once");
        second.release();
        assert_eq!(tab.totals().elements(), 1);
    }

    #[test]
    fn switching_keys_releases_the_held_cell() {
        let tab = table(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"abandoned");
        assert_eq!(k.acquire(), KvStatus::IsNew);
        assert_eq!(k.load(b"kept"), KvStatus::Ok);
        let pos = k.pos().unwrap();

        k.set_key(b"next");
        assert_eq!(k.state(), KeyState::Idle);
        assert!(matches!(tab.cell_state(pos), CellState::Occupied { .. }));
        k.set_key(b"abandoned");
        assert_eq!(k.find(), KvStatus::Ok);
        assert_eq!(k.value().unwrap(), b"kept");
    }
}
