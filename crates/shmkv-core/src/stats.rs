//! Operation counters.
//!
//! Every (context, database) pair owns a statistics link: an owner word
//! followed by 16 counters that only the owning context writes. When the
//! link is released its counters are folded into the retired totals in the
//! header, so map-wide totals survive thread churn.

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use shmkv_error::{KvError, Result};

use crate::atomic::BitSpinLock;
use crate::context::{ContextId, CtxState};
use crate::layout::{MAX_CTX, MAX_STAT_LINKS, hdr};
use crate::table::HashTab;

pub const STAT_LINK_WORDS: usize = 24;
pub const COUNTER_COUNT: usize = 16;
const LINK_OWNER: usize = 0;
const LINK_COUNTERS: usize = 1;

/// Counter slots in a statistics link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    Read = 0,
    Write,
    Spins,
    Chains,
    Add,
    Drop,
    Expire,
    HtEvict,
    AllocFail,
    Hit,
    Miss,
    CuckooAcquire,
    CuckooFetch,
    CuckooMove,
    CuckooRetry,
    /// Longest relocation path; merged with `max`, not `+`.
    CuckooMax,
}

/// Counter values for one context, one database, or the whole map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStats {
    pub rd: u64,
    pub wr: u64,
    pub spins: u64,
    pub chains: u64,
    pub add: u64,
    pub drop: u64,
    pub expire: u64,
    pub htevict: u64,
    pub afail: u64,
    pub hit: u64,
    pub miss: u64,
    pub cuckacq: u64,
    pub cuckfet: u64,
    pub cuckmov: u64,
    pub cuckret: u64,
    pub cuckmax: u64,
}

impl KeyStats {
    pub const fn from_counters(c: [u64; COUNTER_COUNT]) -> Self {
        Self {
            rd: c[0],
            wr: c[1],
            spins: c[2],
            chains: c[3],
            add: c[4],
            drop: c[5],
            expire: c[6],
            htevict: c[7],
            afail: c[8],
            hit: c[9],
            miss: c[10],
            cuckacq: c[11],
            cuckfet: c[12],
            cuckmov: c[13],
            cuckret: c[14],
            cuckmax: c[15],
        }
    }

    pub const fn to_counters(self) -> [u64; COUNTER_COUNT] {
        [
            self.rd,
            self.wr,
            self.spins,
            self.chains,
            self.add,
            self.drop,
            self.expire,
            self.htevict,
            self.afail,
            self.hit,
            self.miss,
            self.cuckacq,
            self.cuckfet,
            self.cuckmov,
            self.cuckret,
            self.cuckmax,
        ]
    }

    pub fn merge(&mut self, other: &Self) {
        let mut mine = self.to_counters();
        for (i, v) in other.to_counters().into_iter().enumerate() {
            if i == Counter::CuckooMax as usize {
                mine[i] = mine[i].max(v);
            } else {
                mine[i] = mine[i].wrapping_add(v);
            }
        }
        *self = Self::from_counters(mine);
    }

    /// Live keys implied by the counters.
    pub const fn elements(&self) -> u64 {
        self.add.saturating_sub(self.drop)
    }
}

/// Occupancy of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub seg: u16,
    /// bytes below the bump pointer
    pub ring: u64,
    /// bytes not held by live messages
    pub avail: u64,
    pub gc_passes: u64,
}

/// Map-wide statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapStats {
    pub totals: KeyStats,
    pub elements: u64,
    pub ht_size: u64,
    pub load: f64,
    pub contexts_busy: usize,
    pub contexts_dead: usize,
    pub dbs_opened: Vec<u8>,
    pub segments: Vec<SegmentStats>,
}

const fn owner_word(ctx: ContextId, db: u8) -> u64 {
    ((ctx.index() as u64 + 1) << 8) | db as u64
}

const fn owner_ctx(word: u64) -> Option<usize> {
    if word == 0 {
        None
    } else {
        Some((word >> 8) as usize - 1)
    }
}

const fn owner_db(word: u64) -> u8 {
    word as u8
}

fn read_counters(tab: &HashTab, base: usize) -> [u64; COUNTER_COUNT] {
    let mut out = [0_u64; COUNTER_COUNT];
    for (i, v) in out.iter_mut().enumerate() {
        *v = tab.region().word(base + i).load(Ordering::Relaxed);
    }
    out
}

/// Claim a free link for `(ctx, db)`.
pub(crate) fn claim_link(tab: &HashTab, ctx: ContextId, db: u8) -> Result<usize> {
    let owner = owner_word(ctx, db);
    for link in 0..MAX_STAT_LINKS {
        let base = tab.geom().stat_base(link);
        let word = tab.region().word(base + LINK_OWNER);
        if word
            .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            tab.region()
                .zero_words(base + LINK_COUNTERS, COUNTER_COUNT);
            return Ok(link);
        }
    }
    Err(KvError::NoFreeStatLink {
        capacity: MAX_STAT_LINKS,
    })
}

/// Fold a link's counters into the retired totals and free it.
pub(crate) fn retire_link(tab: &HashTab, link: usize) {
    let base = tab.geom().stat_base(link);
    let counters = read_counters(tab, base + LINK_COUNTERS);
    {
        let _guard = BitSpinLock::new(tab.hdr(hdr::STAT_LOCK), 0).lock();
        for (i, v) in counters.into_iter().enumerate() {
            let total = tab.hdr(hdr::RETIRED + i);
            if i == Counter::CuckooMax as usize {
                total.fetch_max(v, Ordering::Relaxed);
            } else {
                total.fetch_add(v, Ordering::Relaxed);
            }
        }
    }
    tab.region().zero_words(base + LINK_COUNTERS, COUNTER_COUNT);
    tab.region()
        .word(base + LINK_OWNER)
        .store(0, Ordering::Release);
}

pub(crate) fn read_link(tab: &HashTab, link: usize) -> KeyStats {
    KeyStats::from_counters(read_counters(
        tab,
        tab.geom().stat_base(link) + LINK_COUNTERS,
    ))
}

/// Links owned by `ctx`.
pub(crate) fn links_of(tab: &HashTab, ctx: ContextId) -> Vec<usize> {
    (0..MAX_STAT_LINKS)
        .filter(|&link| {
            let w = tab
                .region()
                .word(tab.geom().stat_base(link) + LINK_OWNER)
                .load(Ordering::Acquire);
            owner_ctx(w) == Some(ctx.index())
        })
        .collect()
}

/// Bump a counter in the link starting at `base`.
#[inline]
pub(crate) fn bump(tab: &HashTab, base: usize, counter: Counter, n: u64) {
    if n == 0 {
        return;
    }
    let word = tab.region().word(base + LINK_COUNTERS + counter as usize);
    if counter == Counter::CuckooMax {
        word.fetch_max(n, Ordering::Relaxed);
    } else {
        word.fetch_add(n, Ordering::Relaxed);
    }
}

impl HashTab {
    /// Totals for one database across live and retired contexts.
    ///
    /// Retired totals are not split by database, so only live links
    /// contribute here.
    pub fn db_stats(&self, db: u8) -> KeyStats {
        let mut out = KeyStats::default();
        for link in 0..MAX_STAT_LINKS {
            let w = self
                .region()
                .word(self.geom().stat_base(link) + LINK_OWNER)
                .load(Ordering::Acquire);
            if w != 0 && owner_db(w) == db {
                out.merge(&read_link(self, link));
            }
        }
        out
    }

    /// Map-wide counters: retired totals plus every live link.
    pub fn totals(&self) -> KeyStats {
        let mut out = {
            let _guard = BitSpinLock::new(self.hdr(hdr::STAT_LOCK), 0).lock();
            let mut c = [0_u64; COUNTER_COUNT];
            for (i, v) in c.iter_mut().enumerate() {
                *v = self.hdr(hdr::RETIRED + i).load(Ordering::Relaxed);
            }
            KeyStats::from_counters(c)
        };
        for link in 0..MAX_STAT_LINKS {
            let w = self
                .region()
                .word(self.geom().stat_base(link) + LINK_OWNER)
                .load(Ordering::Acquire);
            if w != 0 {
                out.merge(&read_link(self, link));
            }
        }
        out
    }

    /// Full statistics snapshot.
    pub fn stats(&self) -> MapStats {
        let totals = self.totals();
        let elements = totals.elements();
        let ht_size = self.geom().ht_size;
        let mut busy = 0;
        let mut dead = 0;
        for idx in 0..MAX_CTX {
            match CtxState::from_word(
                self.ctx_word(idx, crate::context::xw::STATE)
                    .load(Ordering::Relaxed),
            ) {
                CtxState::Busy => busy += 1,
                CtxState::Zombie => dead += 1,
                CtxState::Free => {}
            }
        }
        MapStats {
            totals,
            elements,
            ht_size,
            load: elements as f64 / ht_size as f64,
            contexts_busy: busy,
            contexts_dead: dead,
            dbs_opened: self.opened_dbs(),
            segments: (0..self.geom().seg_count as usize)
                .map(|seg| self.segment_stats(seg))
                .collect(),
        }
    }
}
