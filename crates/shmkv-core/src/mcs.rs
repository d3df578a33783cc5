//! MCS queue lock embedded in a hash cell's lock word.
//!
//! The lock word holds the key hash while unlocked. Locking swaps in
//! `ZOMBIE64 | id` of the newest waiter, where `id` names an MCS slot inside
//! some context. The displaced value travels down the queue: the first
//! locker reads it from the swap, every later one receives it in its slot's
//! `VAL` word from its predecessor. Releasing puts a value back (possibly a
//! new one) either straight into the lock word or into the successor's slot.
//!
//! Slots live in shared memory, so a dead context's position in a queue is
//! visible to recovery, which can finish its turn on its behalf.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use shmkv_region::ShmRegion;

use crate::atomic::Backoff;
use crate::cell::ZOMBIE64;
use crate::context::{CTX_MCS_BASE, MCS_PER_CTX};
use crate::layout::{MAX_CTX, MapGeometry};

/// Words per MCS slot.
pub const MCS_WORDS: usize = 4;

/// Word indices inside an MCS slot.
pub mod slot {
    /// value handed over by the predecessor, or read from the lock word
    pub const VAL: usize = 0;
    /// 1 while waiting, 0 once the lock is ours
    pub const LOCK: usize = 1;
    /// id of the successor, 0 until one links in
    pub const NEXT: usize = 2;
    /// cell position + 1 of the lock word this slot is queued on
    pub const LINK: usize = 3;
}

/// Slots per context in the id encoding; only `MCS_PER_CTX` are usable.
const IDS_PER_CTX: u64 = 32;

/// Identity of one MCS slot: `ctx * 32 + slot + 1`, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
    pub const fn new(ctx: usize, slot: usize) -> Self {
        Self(ctx as u64 * IDS_PER_CTX + slot as u64 + 1)
    }

    /// Decode an id read from shared memory, rejecting out-of-range values.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        let ctx = (raw - 1) / IDS_PER_CTX;
        let slot = (raw - 1) % IDS_PER_CTX;
        if ctx as usize >= MAX_CTX || slot as usize >= MCS_PER_CTX {
            return None;
        }
        Some(Self(raw))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn ctx(self) -> usize {
        ((self.0 - 1) / IDS_PER_CTX) as usize
    }

    pub const fn slot(self) -> usize {
        ((self.0 - 1) % IDS_PER_CTX) as usize
    }

    /// The value a lock word holds while this slot is the queue tail.
    pub const fn locked_word(self) -> u64 {
        ZOMBIE64 | self.0
    }
}

/// Outcome of a blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// The value the lock word held for us.
    pub value: u64,
    /// Spins spent waiting.
    pub spins: u64,
}

/// Queue lock operations over the MCS slots of a region.
#[derive(Debug, Clone, Copy)]
pub struct QueueLock<'a> {
    region: &'a ShmRegion,
    geom: &'a MapGeometry,
}

impl<'a> QueueLock<'a> {
    pub const fn new(region: &'a ShmRegion, geom: &'a MapGeometry) -> Self {
        Self { region, geom }
    }

    #[inline]
    fn slot_word(&self, id: LockId, field: usize) -> &'a AtomicU64 {
        let base = self.geom.ctx_base(id.ctx()) + CTX_MCS_BASE + id.slot() * MCS_WORDS;
        self.region.word(base + field)
    }

    fn prepare(&self, id: LockId, value: u64, waiting: u64, link_pos: u64) {
        self.slot_word(id, slot::VAL).store(value, Ordering::Relaxed);
        self.slot_word(id, slot::NEXT).store(0, Ordering::Relaxed);
        self.slot_word(id, slot::LOCK).store(waiting, Ordering::Relaxed);
        self.slot_word(id, slot::LINK).store(link_pos, Ordering::Relaxed);
    }

    /// Queue on `link` and wait for our turn.
    ///
    /// `link_pos` is recorded in the slot so recovery can find the lock word
    /// if this context dies while queued or holding it.
    pub fn acquire(&self, link: &AtomicU64, link_pos: u64, id: LockId) -> Acquired {
        self.prepare(id, 0, 1, link_pos);
        let prev = link.swap(id.locked_word(), Ordering::AcqRel);
        if prev & ZOMBIE64 == 0 {
            self.slot_word(id, slot::VAL).store(prev, Ordering::Relaxed);
            self.slot_word(id, slot::LOCK).store(0, Ordering::Relaxed);
            fence(Ordering::Release);
            return Acquired {
                value: prev,
                spins: 0,
            };
        }
        let Some(pred) = LockId::from_raw(prev & !ZOMBIE64) else {
            // The tail names no slot; nobody can hand the lock to us, so
            // take it with the cell marked dropped.
            tracing::warn!(raw = prev, link_pos, "corrupt queue tail, forcing lock");
            self.slot_word(id, slot::VAL)
                .store(crate::cell::DROPPED_HASH, Ordering::Relaxed);
            self.slot_word(id, slot::LOCK).store(0, Ordering::Relaxed);
            fence(Ordering::Release);
            return Acquired {
                value: crate::cell::DROPPED_HASH,
                spins: 0,
            };
        };
        self.slot_word(pred, slot::NEXT)
            .store(id.raw(), Ordering::Release);
        let mut backoff = Backoff::new();
        while self.slot_word(id, slot::LOCK).load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        let value = self.slot_word(id, slot::VAL).load(Ordering::Relaxed);
        fence(Ordering::Release);
        Acquired {
            value,
            spins: backoff.spins(),
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self, link: &AtomicU64, link_pos: u64, id: LockId) -> Option<u64> {
        let cur = link.load(Ordering::Relaxed);
        if cur & ZOMBIE64 != 0 {
            return None;
        }
        self.prepare(id, cur, 0, link_pos);
        if link
            .compare_exchange(cur, id.locked_word(), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            self.slot_word(id, slot::LINK).store(0, Ordering::Relaxed);
            return None;
        }
        fence(Ordering::Release);
        Some(cur)
    }

    /// Hand `value` to the next waiter, or store it in the lock word if
    /// nobody is queued. Returns spins spent waiting for a successor to
    /// finish linking in.
    pub fn release(&self, link: &AtomicU64, value: u64, id: LockId) -> u64 {
        debug_assert_eq!(value & ZOMBIE64, 0, "lock word value with the lock bit");
        if link
            .compare_exchange(id.locked_word(), value, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.slot_word(id, slot::LINK).store(0, Ordering::Relaxed);
            return 0;
        }
        // a successor swapped the tail but has not linked in yet
        let mut backoff = Backoff::new();
        let next = loop {
            let raw = self.slot_word(id, slot::NEXT).load(Ordering::Acquire);
            if let Some(next) = LockId::from_raw(raw) {
                break next;
            }
            backoff.snooze();
        };
        self.slot_word(next, slot::VAL).store(value, Ordering::Relaxed);
        self.slot_word(id, slot::LINK).store(0, Ordering::Relaxed);
        self.slot_word(next, slot::LOCK).store(0, Ordering::Release);
        backoff.spins()
    }

    /// Wait (bounded) until `dead` owns the lock, then return the value it
    /// holds. `None` if `dead` is still queued after `spin_limit` spins.
    pub fn recover_lock(&self, dead: LockId, spin_limit: u64) -> Option<u64> {
        let mut spins = 0;
        while self.slot_word(dead, slot::LOCK).load(Ordering::Acquire) != 0 {
            if spins >= spin_limit {
                return None;
            }
            spin_loop();
            spins += 1;
        }
        Some(self.slot_word(dead, slot::VAL).load(Ordering::Relaxed))
    }

    /// Release on behalf of a dead owner.
    pub fn recover_unlock(&self, link: &AtomicU64, value: u64, dead: LockId) -> u64 {
        self.release(link, value, dead)
    }

    /// Cell position + 1 recorded by `id`, or 0.
    pub fn linked_pos(&self, id: LockId) -> u64 {
        self.slot_word(id, slot::LINK).load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shmkv_region::StorageBackend;

    use super::*;
    use crate::config::MapConfig;

    fn setup() -> (ShmRegion, MapGeometry) {
        let geom = MapConfig {
            map_size: 2 << 20,
            ..MapConfig::default()
        }
        .geometry()
        .unwrap();
        let region = ShmRegion::create(&StorageBackend::Heap, geom.map_size as usize).unwrap();
        (region, geom)
    }

    #[test]
    fn lock_id_encoding() {
        let id = LockId::new(3, 5);
        assert_eq!(id.raw(), 3 * 32 + 6);
        assert_eq!(id.ctx(), 3);
        assert_eq!(id.slot(), 5);
        assert_eq!(LockId::from_raw(id.raw()), Some(id));
        assert_eq!(LockId::from_raw(0), None);
        assert_eq!(LockId::from_raw(31), None);
        assert_eq!(LockId::from_raw(MAX_CTX as u64 * 32 + 1), None);
    }

    #[test]
    fn uncontended_acquire_returns_prior_value() {
        let (region, geom) = setup();
        let q = QueueLock::new(&region, &geom);
        let link = AtomicU64::new(0xabc);
        let id = LockId::new(0, 0);
        let got = q.acquire(&link, 1, id);
        assert_eq!(got.value, 0xabc);
        assert_eq!(link.load(Ordering::Relaxed), id.locked_word());
        assert!(q.try_acquire(&link, 1, LockId::new(1, 0)).is_none());
        q.release(&link, 0xdef, id);
        assert_eq!(link.load(Ordering::Relaxed), 0xdef);
        assert_eq!(q.try_acquire(&link, 1, LockId::new(1, 0)), Some(0xdef));
    }

    #[test]
    fn value_travels_down_the_queue() {
        let (region, geom) = setup();
        let region = Arc::new(region);
        let link = Arc::new(AtomicU64::new(100));
        let threads = 8;
        let rounds = 500;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let region = Arc::clone(&region);
                let link = Arc::clone(&link);
                std::thread::spawn(move || {
                    let q = QueueLock::new(&region, &geom);
                    let id = LockId::new(t, 0);
                    for _ in 0..rounds {
                        let got = q.acquire(&link, 1, id);
                        q.release(&link, got.value + 1, id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(link.load(Ordering::Relaxed), 100 + (threads * rounds) as u64);
    }

    #[test]
    fn queued_waiter_backs_off_until_handoff() {
        let (region, geom) = setup();
        let region = Arc::new(region);
        let link = Arc::new(AtomicU64::new(5));
        let holder = LockId::new(0, 0);
        let q = QueueLock::new(&region, &geom);
        q.acquire(&link, 1, holder);

        let waiter = {
            let region = Arc::clone(&region);
            let link = Arc::clone(&link);
            std::thread::spawn(move || {
                QueueLock::new(&region, &geom).acquire(&link, 1, LockId::new(1, 0))
            })
        };
        while link.load(Ordering::Acquire) == holder.locked_word() {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.release(&link, 6, holder);

        let got = waiter.join().unwrap();
        assert_eq!(got.value, 6);
        assert!(got.spins > 0);
        assert_eq!(link.load(Ordering::Relaxed), LockId::new(1, 0).locked_word());
    }

    #[test]
    fn recovery_releases_for_dead_owner() {
        let (region, geom) = setup();
        let q = QueueLock::new(&region, &geom);
        let link = AtomicU64::new(77);
        let dead = LockId::new(5, 2);
        q.acquire(&link, 9, dead);
        assert_eq!(q.linked_pos(dead), 9);
        assert_eq!(q.recover_lock(dead, 10), Some(77));
        q.recover_unlock(&link, 1, dead);
        assert_eq!(link.load(Ordering::Relaxed), 1);
        assert_eq!(q.linked_pos(dead), 0);
    }
}
