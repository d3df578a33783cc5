//! Small atomic building blocks shared by the rest of the map.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Test-and-test-and-set spin lock on one bit of a shared word.
///
/// Used for short critical sections in the region header and segment
/// descriptors where a full queue lock would be overkill. Other bits of the
/// word are left untouched.
#[derive(Debug, Clone, Copy)]
pub struct BitSpinLock<'a> {
    word: &'a AtomicU64,
    mask: u64,
}

impl<'a> BitSpinLock<'a> {
    pub const fn new(word: &'a AtomicU64, bit: u32) -> Self {
        Self {
            word,
            mask: 1 << bit,
        }
    }

    /// Spin until the bit is ours.
    #[inline]
    pub fn lock(self) -> BitSpinGuard<'a> {
        let mut backoff = Backoff::new();
        loop {
            while self.word.load(Ordering::Relaxed) & self.mask != 0 {
                backoff.snooze();
            }
            if self.word.fetch_or(self.mask, Ordering::Acquire) & self.mask == 0 {
                return BitSpinGuard { lock: self };
            }
        }
    }

    /// Take the bit if it is clear right now.
    #[inline]
    pub fn try_lock(self) -> Option<BitSpinGuard<'a>> {
        if self.word.load(Ordering::Relaxed) & self.mask != 0 {
            return None;
        }
        (self.word.fetch_or(self.mask, Ordering::Acquire) & self.mask == 0)
            .then_some(BitSpinGuard { lock: self })
    }

    /// Clear the bit without a guard. Only for recovering a lock whose
    /// holder is known to be dead.
    pub fn force_unlock(self) {
        self.word.fetch_and(!self.mask, Ordering::Release);
    }
}

/// Releases the bit on drop.
#[derive(Debug)]
pub struct BitSpinGuard<'a> {
    lock: BitSpinLock<'a>,
}

impl Drop for BitSpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.word.fetch_and(!self.lock.mask, Ordering::Release);
    }
}

/// Bounded spin helper.
///
/// Counts spins so callers can report contention, and yields to the
/// scheduler once the spin budget is spent.
#[derive(Debug, Default)]
pub struct Backoff {
    spins: u64,
}

const SPINS_BEFORE_YIELD: u64 = 128;

impl Backoff {
    pub const fn new() -> Self {
        Self { spins: 0 }
    }

    #[inline]
    pub fn snooze(&mut self) {
        self.spins += 1;
        if self.spins % SPINS_BEFORE_YIELD == 0 {
            std::thread::yield_now();
        } else {
            spin_loop();
        }
    }

    pub const fn spins(&self) -> u64 {
        self.spins
    }
}

/// Wall clock in nanoseconds since the Unix epoch.
///
/// Expiry and update stamps are compared across processes, so they use the
/// shared wall clock rather than a monotonic per-process one.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
