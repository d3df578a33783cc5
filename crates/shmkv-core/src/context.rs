//! Per-thread contexts.
//!
//! Each attached thread owns one context slot in the region. The slot
//! records who owns it (caller id, pid, thread), carries the thread's MCS
//! queue slots, and remembers which segment the thread allocates from.
//! Slots are 136 words (17 cache lines):
//!
//! ```text
//! word 0    KEY        caller id, used for slot affinity on reattach
//! word 1    STATE      free / busy / zombie
//! word 2    PID
//! word 3    TID        hash of the owning thread's id
//! word 4    BIRTH_NS
//! word 5-6  SEED       per-slot entropy written at map creation
//! word 7    FAVOR_SEG  segment this context allocates from first
//! word 8    MCS_USED   bitmap of MCS slots in use
//! word 9    SEG_LOCK   segment whose lock this context holds, plus one
//! word 10   MOVING     set while a cuckoo move is open
//! word 16+  30 MCS slots of 4 words
//! ```

use std::cell::{RefCell, RefMut};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use shmkv_error::{KvError, Result};
use tracing::{debug, info};

use crate::atomic::now_ns;
use crate::layout::{MAX_CTX, MAX_DB, hdr};
use crate::mcs::{LockId, MCS_WORDS};
use crate::stats::{self, KeyStats};
use crate::table::HashTab;

pub const CTX_MCS_BASE: usize = 16;
pub const MCS_PER_CTX: usize = 30;
pub const CTX_WORDS: usize = CTX_MCS_BASE + MCS_PER_CTX * MCS_WORDS;

/// Word indices inside a context slot.
pub mod xw {
    pub const KEY: usize = 0;
    pub const STATE: usize = 1;
    pub const PID: usize = 2;
    pub const TID: usize = 3;
    pub const BIRTH_NS: usize = 4;
    pub const SEED: usize = 5;
    pub const SEED2: usize = 6;
    pub const FAVOR_SEG: usize = 7;
    pub const MCS_USED: usize = 8;
    /// segment index + 1 while this context holds that segment's lock
    pub const SEG_LOCK: usize = 9;
    /// 1 between a cuckoo move's begin and end counter bumps
    pub const MOVING: usize = 10;
}

/// Lifecycle of a context slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u64)]
pub enum CtxState {
    Free = 0,
    Busy = 1,
    /// Owner found dead; waiting for recovery.
    Zombie = 2,
}

impl CtxState {
    pub const fn from_word(w: u64) -> Self {
        match w {
            0 => Self::Free,
            1 => Self::Busy,
            _ => Self::Zombie,
        }
    }
}

/// Index of a context slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(u32);

impl ContextId {
    pub fn new(idx: usize) -> Option<Self> {
        (idx < MAX_CTX).then(|| Self(idx as u32))
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Snapshot of a context slot, for administration and recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub state: CtxState,
    pub caller_id: u64,
    pub pid: u32,
    pub birth_ns: u64,
    pub locks_held: u32,
}

/// A thread's attachment to a map.
///
/// Not `Sync`: a context belongs to one thread at a time. Dropping it
/// retires its statistics and frees the slot.
pub struct ThreadCtx {
    tab: Arc<HashTab>,
    id: ContextId,
    rng: RefCell<StdRng>,
    dbs: RefCell<Vec<Option<usize>>>,
}

impl fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCtx").field("id", &self.id).finish_non_exhaustive()
    }
}

fn thread_tag() -> u64 {
    let mut h = DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    h.finish()
}

impl HashTab {
    /// Claim a context slot for the calling thread.
    ///
    /// A free slot last used by the same `caller_id` is preferred, so a
    /// restarted worker lands on its old slot and segment.
    pub fn attach_ctx(self: &Arc<Self>, caller_id: u64) -> Result<ThreadCtx> {
        let claim = |idx: usize| {
            self.ctx_word(idx, xw::STATE)
                .compare_exchange(
                    CtxState::Free as u64,
                    CtxState::Busy as u64,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        };
        let idx = (0..MAX_CTX)
            .find(|&i| {
                self.ctx_word(i, xw::KEY).load(Ordering::Relaxed) == caller_id
                    && self.ctx_word(i, xw::BIRTH_NS).load(Ordering::Relaxed) != 0
                    && claim(i)
            })
            .or_else(|| (0..MAX_CTX).find(|&i| claim(i)))
            .ok_or(KvError::NoFreeContext { capacity: MAX_CTX })?;

        let birth = now_ns();
        let tid = thread_tag();
        let set = |field: usize, v: u64| self.ctx_word(idx, field).store(v, Ordering::Relaxed);
        set(xw::KEY, caller_id);
        set(xw::PID, u64::from(std::process::id()));
        set(xw::TID, tid);
        set(xw::BIRTH_NS, birth);
        set(xw::MCS_USED, 0);
        set(xw::SEG_LOCK, 0);
        set(xw::MOVING, 0);
        if self.geom().seg_count > 0 {
            let favored = self.ctx_word(idx, xw::FAVOR_SEG).load(Ordering::Relaxed);
            if favored >= u64::from(self.geom().seg_count) {
                set(xw::FAVOR_SEG, idx as u64 % u64::from(self.geom().seg_count));
            }
        }
        let mcs = self.geom().ctx_base(idx) + CTX_MCS_BASE;
        self.region().zero_words(mcs, MCS_PER_CTX * MCS_WORDS);
        self.hdr(hdr::CTX_USED + idx / 64)
            .fetch_or(1 << (idx % 64), Ordering::Release);

        let seed = self.ctx_word(idx, xw::SEED).load(Ordering::Relaxed)
            ^ self.ctx_word(idx, xw::SEED2).load(Ordering::Relaxed).rotate_left(17)
            ^ birth
            ^ tid;
        let id = ContextId(idx as u32);
        info!(ctx = %id, caller_id, pid = std::process::id(), "context attached");
        Ok(ThreadCtx {
            tab: Arc::clone(self),
            id,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            dbs: RefCell::new(vec![None; MAX_DB]),
        })
    }

    /// Read a context slot.
    pub fn context_info(&self, id: ContextId) -> ContextInfo {
        let r = |field: usize| self.ctx_word(id.index(), field).load(Ordering::Acquire);
        ContextInfo {
            id,
            state: CtxState::from_word(r(xw::STATE)),
            caller_id: r(xw::KEY),
            pid: r(xw::PID) as u32,
            birth_ns: r(xw::BIRTH_NS),
            locks_held: r(xw::MCS_USED).count_ones(),
        }
    }

    /// Contexts currently marked busy or zombie.
    pub fn active_contexts(&self) -> Vec<ContextInfo> {
        (0..MAX_CTX)
            .filter_map(ContextId::new)
            .map(|id| self.context_info(id))
            .filter(|info| info.state != CtxState::Free)
            .collect()
    }

    pub(crate) fn release_ctx_slot(&self, idx: usize) {
        self.ctx_word(idx, xw::MCS_USED).store(0, Ordering::Relaxed);
        self.hdr(hdr::CTX_USED + idx / 64)
            .fetch_and(!(1 << (idx % 64)), Ordering::Release);
        self.hdr(hdr::CTX_DEAD + idx / 64)
            .fetch_and(!(1 << (idx % 64)), Ordering::Release);
        self.ctx_word(idx, xw::STATE)
            .store(CtxState::Free as u64, Ordering::Release);
    }
}

impl ThreadCtx {
    pub const fn id(&self) -> ContextId {
        self.id
    }

    pub const fn table(&self) -> &Arc<HashTab> {
        &self.tab
    }

    /// Take a free MCS slot. `None` if all are in use.
    pub(crate) fn alloc_lock(&self) -> Option<LockId> {
        let used_word = self.tab.ctx_word(self.id.index(), xw::MCS_USED);
        let used = used_word.load(Ordering::Relaxed);
        let free = (!used).trailing_zeros() as usize;
        if free >= MCS_PER_CTX {
            return None;
        }
        used_word.store(used | (1 << free), Ordering::Release);
        Some(LockId::new(self.id.index(), free))
    }

    pub(crate) fn free_lock(&self, id: LockId) {
        debug_assert_eq!(id.ctx(), self.id.index());
        let used_word = self.tab.ctx_word(self.id.index(), xw::MCS_USED);
        let used = used_word.load(Ordering::Relaxed);
        used_word.store(used & !(1 << id.slot()), Ordering::Release);
    }

    /// MCS slots currently in use.
    pub fn locks_held(&self) -> u32 {
        self.tab
            .ctx_word(self.id.index(), xw::MCS_USED)
            .load(Ordering::Relaxed)
            .count_ones()
    }

    pub(crate) fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }

    pub(crate) fn favored_segment(&self) -> usize {
        self.tab
            .ctx_word(self.id.index(), xw::FAVOR_SEG)
            .load(Ordering::Relaxed) as usize
    }

    pub(crate) fn seg_lock_word(&self) -> &std::sync::atomic::AtomicU64 {
        self.tab.ctx_word(self.id.index(), xw::SEG_LOCK)
    }

    pub(crate) fn moving_word(&self) -> &std::sync::atomic::AtomicU64 {
        self.tab.ctx_word(self.id.index(), xw::MOVING)
    }

    pub(crate) fn set_favored_segment(&self, seg: usize) {
        self.tab
            .ctx_word(self.id.index(), xw::FAVOR_SEG)
            .store(seg as u64, Ordering::Relaxed);
    }

    /// Open database `db` for this context, linking a statistics block.
    pub fn attach_db(&self, db: u8) -> Result<()> {
        let mut dbs = self.dbs.borrow_mut();
        if dbs[usize::from(db)].is_some() {
            return Ok(());
        }
        let link = stats::claim_link(&self.tab, self.id, db)?;
        dbs[usize::from(db)] = Some(link);
        self.tab.open_db(db);
        debug!(ctx = %self.id, db, link, "database attached");
        Ok(())
    }

    /// Fold this context's counters for `db` into the map totals and
    /// unlink them.
    pub fn detach_db(&self, db: u8) {
        if let Some(link) = self.dbs.borrow_mut()[usize::from(db)].take() {
            stats::retire_link(&self.tab, link);
            debug!(ctx = %self.id, db, link, "database detached");
        }
    }

    /// Word index of the statistics block for `db`, attaching on demand.
    pub(crate) fn stat_base(&self, db: u8) -> Result<usize> {
        if let Some(link) = self.dbs.borrow()[usize::from(db)] {
            return Ok(self.tab.geom().stat_base(link));
        }
        self.attach_db(db)?;
        let link = self.dbs.borrow()[usize::from(db)]
            .ok_or(KvError::NoFreeStatLink {
                capacity: crate::layout::MAX_STAT_LINKS,
            })?;
        Ok(self.tab.geom().stat_base(link))
    }

    /// This context's counters for `db`, if attached.
    pub fn db_stats(&self, db: u8) -> Option<KeyStats> {
        self.dbs.borrow()[usize::from(db)].map(|link| stats::read_link(&self.tab, link))
    }
}

impl Drop for ThreadCtx {
    fn drop(&mut self) {
        let links: Vec<usize> = self.dbs.borrow_mut().iter_mut().filter_map(Option::take).collect();
        for link in links {
            stats::retire_link(&self.tab, link);
        }
        let held = self.locks_held();
        if held != 0 {
            tracing::warn!(ctx = %self.id, held, "context detached with MCS slots in use");
        }
        self.tab.release_ctx_slot(self.id.index());
        info!(ctx = %self.id, "context detached");
    }
}
