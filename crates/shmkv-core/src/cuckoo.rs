//! Cuckoo relocation.
//!
//! When every candidate cell of a new key is occupied, search outward for a
//! free cell: each occupant could live in any of its own candidates, so the
//! cells form a graph. The search expands a randomly chosen frontier node
//! at a time until it reaches a free cell, then shifts occupants along the
//! path back toward the requester, one locked pair of cells per hop, so the
//! requester's candidate is the one left free.
//!
//! Moves are bracketed by the header's move counters so a lock-free reader
//! that missed a key while it was in flight can tell and retry.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use rand::Rng;
use shmkv_error::KvStatus;

use crate::cell::{CellState, EMPTY_HASH, cw};
use crate::context::ThreadCtx;
use crate::hash::{Candidates, KeyIdentity};
use crate::layout::hdr;
use crate::mcs::LockId;
use crate::stats::{Counter, bump};
use crate::table::HashTab;

/// Fresh searches before giving up with `HtFull`.
pub const CUCKOO_RESTARTS: u32 = 5;
/// Nodes one search may visit.
pub const MAX_VISITS: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Node {
    pos: usize,
    parent: Option<usize>,
    occupant: Option<KeyIdentity>,
}

enum Occupant {
    Key(KeyIdentity),
    Free,
    Locked,
}

pub(crate) struct Relocator<'a> {
    tab: &'a HashTab,
    thr: &'a ThreadCtx,
    stat_base: usize,
}

impl<'a> Relocator<'a> {
    pub(crate) const fn new(tab: &'a HashTab, thr: &'a ThreadCtx, stat_base: usize) -> Self {
        Self {
            tab,
            thr,
            stat_base,
        }
    }

    /// Free one of `cands` by relocation. On success the freed cell is
    /// returned locked and empty.
    ///
    /// `Busy` means a candidate became free or a path went stale; the caller
    /// should rescan. `HtFull` means no path was found.
    pub(crate) fn relocate(&self, cands: &Candidates) -> Result<(usize, LockId), KvStatus> {
        bump(self.tab, self.stat_base, Counter::CuckooAcquire, 1);
        for attempt in 0..CUCKOO_RESTARTS {
            if attempt > 0 {
                bump(self.tab, self.stat_base, Counter::CuckooRetry, 1);
            }
            match self.search(cands) {
                Some(Ok(claimed)) => return Ok(claimed),
                Some(Err(status)) => return Err(status),
                None => {}
            }
        }
        tracing::debug!(candidates = cands.len(), "relocate: no free cell reachable");
        Err(KvStatus::HtFull)
    }

    /// One randomized search. `None` if the frontier ran dry.
    fn search(&self, cands: &Candidates) -> Option<Result<(usize, LockId), KvStatus>> {
        let geom = self.tab.geom();
        let mut nodes: Vec<Node> = cands
            .iter()
            .map(|pos| Node {
                pos,
                parent: None,
                occupant: None,
            })
            .collect();
        let mut seen: HashSet<usize> = nodes.iter().map(|n| n.pos).collect();
        let mut frontier: Vec<usize> = (0..nodes.len()).collect();

        while !frontier.is_empty() && nodes.len() < MAX_VISITS {
            let pick = self.thr.rng().gen_range(0..frontier.len());
            let ni = frontier.swap_remove(pick);
            match self.read_occupant(nodes[ni].pos) {
                Occupant::Locked => {}
                Occupant::Free if nodes[ni].parent.is_none() => {
                    return Some(Err(KvStatus::Busy));
                }
                Occupant::Free => return Some(self.shift_path(&nodes, ni)),
                Occupant::Key(id) => {
                    nodes[ni].occupant = Some(id);
                    for alt in Candidates::compute(id, geom).iter() {
                        if seen.insert(alt) {
                            frontier.push(nodes.len());
                            nodes.push(Node {
                                pos: alt,
                                parent: Some(ni),
                                occupant: None,
                            });
                        }
                    }
                }
            }
        }
        None
    }

    /// Try-lock `pos` just long enough to read who lives there.
    fn read_occupant(&self, pos: usize) -> Occupant {
        let Some(lock) = self.thr.alloc_lock() else {
            return Occupant::Locked;
        };
        let link = self.tab.cell_word(pos, cw::HASH);
        let Some(prior) = self.tab.qlock().try_acquire(link, pos as u64 + 1, lock) else {
            self.thr.free_lock(lock);
            return Occupant::Locked;
        };
        bump(self.tab, self.stat_base, Counter::CuckooFetch, 1);
        let hash2 = self.tab.cell_word(pos, cw::HASH2).load(Ordering::Relaxed);
        let drop = self.tab.cell_word(pos, cw::DROP).load(Ordering::Relaxed);
        self.tab.qlock().release(link, prior, lock);
        self.thr.free_lock(lock);
        match CellState::decode(prior, hash2, drop) {
            CellState::Empty | CellState::Dropped { .. } => Occupant::Free,
            CellState::Occupied { hash } => Occupant::Key(KeyIdentity { hash, hash2 }),
            CellState::Locked { .. } => Occupant::Locked,
        }
    }

    /// Move each occupant on the path from `free_ni` back to a requester
    /// candidate one hop forward, leaving that candidate locked and empty.
    fn shift_path(&self, nodes: &[Node], free_ni: usize) -> Result<(usize, LockId), KvStatus> {
        let qlock = self.tab.qlock();
        let cell_words = self.tab.geom().cell_words();

        let mut chain = Vec::new();
        let mut cur = nodes[free_ni].parent;
        while let Some(i) = cur {
            chain.push(i);
            cur = nodes[i].parent;
        }

        let dst_pos = nodes[free_ni].pos;
        let dst_lock = self.thr.alloc_lock().ok_or(KvStatus::Busy)?;
        let dst_link = self.tab.cell_word(dst_pos, cw::HASH);
        let Some(dst_prior) = qlock.try_acquire(dst_link, dst_pos as u64 + 1, dst_lock) else {
            self.thr.free_lock(dst_lock);
            return Err(KvStatus::Busy);
        };
        if !matches!(dst_prior, EMPTY_HASH | crate::cell::DROPPED_HASH) {
            qlock.release(dst_link, dst_prior, dst_lock);
            self.thr.free_lock(dst_lock);
            return Err(KvStatus::Busy);
        }

        self.begin_move();
        // (position, lock, value to publish if we abort)
        let mut dst = (dst_pos, dst_lock, dst_prior);
        for &ni in &chain {
            let src_pos = nodes[ni].pos;
            let moved = nodes[ni]
                .occupant
                .and_then(|expect| self.lock_occupant(src_pos, expect));
            let Some((src_lock, expect)) = moved else {
                qlock.release(self.tab.cell_word(dst.0, cw::HASH), dst.2, dst.1);
                self.thr.free_lock(dst.1);
                self.end_move();
                return Err(KvStatus::Busy);
            };

            let src_base = self.tab.geom().cell_base(src_pos);
            let dst_base = self.tab.geom().cell_base(dst.0);
            let region = self.tab.region();
            let dst_serial = region.word(dst_base + cw::SERIAL).load(Ordering::Relaxed);
            let src_serial = region.word(src_base + cw::SERIAL).load(Ordering::Relaxed);
            region.copy_words(src_base + 1, dst_base + 1, cell_words - 1);
            region
                .word(dst_base + cw::SERIAL)
                .store(dst_serial.max(src_serial) + 1, Ordering::Release);
            qlock.release(self.tab.cell_word(dst.0, cw::HASH), expect.hash, dst.1);
            self.thr.free_lock(dst.1);

            region.zero_words(src_base + 1, cell_words - 1);
            region
                .word(src_base + cw::SERIAL)
                .store(src_serial + 1, Ordering::Release);
            bump(self.tab, self.stat_base, Counter::CuckooMove, 1);
            dst = (src_pos, src_lock, EMPTY_HASH);
        }
        self.end_move();
        bump(self.tab, self.stat_base, Counter::CuckooMax, chain.len() as u64);
        tracing::trace!(hops = chain.len(), pos = dst.0, "shift_path: freed candidate");
        Ok((dst.0, dst.1))
    }

    fn begin_move(&self) {
        self.thr.moving_word().store(1, Ordering::Relaxed);
        self.tab.hdr(hdr::MOVE_BEGIN).fetch_add(1, Ordering::AcqRel);
    }

    fn end_move(&self) {
        self.tab.hdr(hdr::MOVE_END).fetch_add(1, Ordering::AcqRel);
        self.thr.moving_word().store(0, Ordering::Release);
    }

    /// Try-lock `pos` and check it still holds `expect`.
    fn lock_occupant(&self, pos: usize, expect: KeyIdentity) -> Option<(LockId, KeyIdentity)> {
        let lock = self.thr.alloc_lock()?;
        let link = self.tab.cell_word(pos, cw::HASH);
        let Some(prior) = self.tab.qlock().try_acquire(link, pos as u64 + 1, lock) else {
            self.thr.free_lock(lock);
            return None;
        };
        let hash2 = self.tab.cell_word(pos, cw::HASH2).load(Ordering::Relaxed);
        if prior != expect.hash || hash2 != expect.hash2 {
            self.tab.qlock().release(link, prior, lock);
            self.thr.free_lock(lock);
            return None;
        }
        Some((lock, expect))
    }
}
