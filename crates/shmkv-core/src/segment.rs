//! Segment allocator and compacting collector.
//!
//! Each segment is a bump arena. `ring` is the bump pointer: bytes below it
//! hold messages (live or zombie), bytes above it are free. `avail` counts
//! every byte not held by a live message, so it only changes on allocation
//! (down) and free (up); compaction moves live bytes without touching it.
//!
//! Allocation and collection run under the segment's bit lock. Freeing a
//! message does not need it: only the owner of the referencing cell may
//! free, and the collector never moves a message without first locking
//! that cell.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use shmkv_error::KvStatus;

use crate::atomic::{BitSpinGuard, BitSpinLock, now_ns};
use crate::cell::{CellFlags, CellMeta, DROPPED_HASH, SegRef, ZOMBIE64, cw};
use crate::context::ThreadCtx;
use crate::layout::MAX_MSG_CHAIN;
use crate::mcs::LockId;
use crate::msg::{MSG_HEADER_BYTES, MsgHeader, write_filler, zombify};
use crate::stats::{Counter, SegmentStats, bump};
use crate::table::HashTab;

pub const SEG_DESC_WORDS: usize = 8;

/// Word indices inside a segment descriptor.
pub mod sd {
    pub const RING: usize = 0;
    pub const AVAIL: usize = 1;
    /// bit 0 is the segment lock
    pub const LOCK: usize = 2;
    pub const GC_PASSES: usize = 3;
}

/// What one collection pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub seg: u16,
    pub moved: u32,
    pub immovable: u32,
    pub zombies: u32,
    pub orphans: u32,
    pub expired: u32,
    /// Bytes returned to the tail.
    pub reclaimed: u64,
}

/// Segment lock held on behalf of a context. The context slot names the
/// segment while the lock is held so recovery can break it.
struct SegGuard<'a> {
    _lock: BitSpinGuard<'a>,
    owner: &'a AtomicU64,
}

impl Drop for SegGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

enum MsgOwner {
    Cell {
        pos: usize,
        lock: LockId,
        prior: u64,
        referrer: Option<SegRef>,
    },
    Orphan,
    Busy,
}

impl HashTab {
    fn seg_word(&self, seg: usize, field: usize) -> &AtomicU64 {
        self.region().word(self.geom().seg_desc(seg) + field)
    }

    pub(crate) fn seg_lock(&self, seg: usize) -> BitSpinLock<'_> {
        BitSpinLock::new(self.seg_word(seg, sd::LOCK), 0)
    }

    fn lock_segment<'a>(&'a self, thr: &'a ThreadCtx, seg: usize) -> SegGuard<'a> {
        let lock = self.seg_lock(seg).lock();
        let owner = thr.seg_lock_word();
        owner.store(seg as u64 + 1, Ordering::Release);
        SegGuard { _lock: lock, owner }
    }

    pub(crate) fn init_segments(&self) {
        for seg in 0..self.geom().seg_count as usize {
            self.seg_word(seg, sd::RING).store(0, Ordering::Relaxed);
            self.seg_word(seg, sd::AVAIL)
                .store(self.geom().seg_size, Ordering::Relaxed);
        }
    }

    /// First word of the message `r` refers to.
    #[inline]
    pub(crate) fn msg_base(&self, r: SegRef) -> usize {
        self.geom().seg_base(usize::from(r.seg)) + (r.off / 8) as usize
    }

    /// Whether `r` could name a message of at least `size` bytes.
    pub(crate) fn valid_ref(&self, r: SegRef, size: u64) -> bool {
        u32::from(r.seg) < self.geom().seg_count
            && r.off % 8 == 0
            && size >= MSG_HEADER_BYTES as u64
            && r.off + size <= self.geom().seg_size
    }

    pub(crate) fn segment_stats(&self, seg: usize) -> SegmentStats {
        SegmentStats {
            seg: seg as u16,
            ring: self.seg_word(seg, sd::RING).load(Ordering::Relaxed),
            avail: self.seg_word(seg, sd::AVAIL).load(Ordering::Relaxed),
            gc_passes: self.seg_word(seg, sd::GC_PASSES).load(Ordering::Relaxed),
        }
    }

    /// Bump-allocate `hdr.size` bytes in `seg` and write `hdr` unsealed.
    fn try_alloc(&self, thr: &ThreadCtx, seg: usize, hdr: &MsgHeader) -> Option<SegRef> {
        let size = u64::from(hdr.size);
        let _guard = self.lock_segment(thr, seg);
        let ring = self.seg_word(seg, sd::RING).load(Ordering::Relaxed);
        if ring + size > self.geom().seg_size {
            return None;
        }
        let r = SegRef::new(seg as u16, ring);
        hdr.store_unsealed(self.region(), self.msg_base(r));
        self.seg_word(seg, sd::RING)
            .store(ring + size, Ordering::Relaxed);
        self.seg_word(seg, sd::AVAIL)
            .fetch_sub(size, Ordering::AcqRel);
        Some(r)
    }

    /// Allocate a message for the cell the caller holds.
    ///
    /// Tries the context's favored segment, then the others, collecting a
    /// segment first when it has enough free bytes that are not contiguous.
    pub(crate) fn alloc_msg(
        &self,
        thr: &ThreadCtx,
        stat_base: usize,
        hdr: &MsgHeader,
    ) -> Result<SegRef, KvStatus> {
        let n = self.geom().seg_count as usize;
        let size = u64::from(hdr.size);
        if n == 0 || size > self.geom().seg_size {
            return Err(KvStatus::TooBig);
        }
        let first = thr.favored_segment() % n;
        for k in 0..n {
            let seg = (first + k) % n;
            let mut got = self.try_alloc(thr, seg, hdr);
            if got.is_none() && self.seg_word(seg, sd::AVAIL).load(Ordering::Acquire) >= size {
                self.gc_segment(thr, seg);
                got = self.try_alloc(thr, seg, hdr);
            }
            if let Some(r) = got {
                if k != 0 {
                    thr.set_favored_segment(seg);
                }
                return Ok(r);
            }
        }
        bump(self, stat_base, Counter::AllocFail, 1);
        tracing::warn!(size, segments = n, "alloc_msg: no segment has room");
        Err(KvStatus::AllocFailed)
    }

    /// Free one message. The caller must own the referencing cell.
    pub(crate) fn free_msg(&self, r: SegRef) {
        let base = self.msg_base(r);
        let hdr = MsgHeader::load(self.region(), base);
        if hdr.is_zombie() {
            return;
        }
        let size = u64::from(hdr.size);
        if !self.valid_ref(r, size) {
            tracing::warn!(seg = r.seg, off = r.off, size, "free_msg: bad message size");
            return;
        }
        zombify(self.region(), base, size as usize);
        let seg = usize::from(r.seg);
        self.seg_word(seg, sd::AVAIL)
            .fetch_add(size, Ordering::AcqRel);
        if let Some(_guard) = self.seg_lock(seg).try_lock() {
            let ring = self.seg_word(seg, sd::RING);
            if ring.load(Ordering::Relaxed) == r.off + size {
                ring.store(r.off, Ordering::Relaxed);
            }
        }
    }

    /// Free a message and every older message chained behind it.
    pub(crate) fn free_chain(&self, head: SegRef) {
        let mut cur = Some(head);
        for _ in 0..MAX_MSG_CHAIN {
            let Some(r) = cur else { break };
            if !self.valid_ref(r, MSG_HEADER_BYTES as u64) {
                break;
            }
            let hdr = MsgHeader::load(self.region(), self.msg_base(r));
            cur = hdr.prev;
            self.free_msg(r);
        }
    }

    /// Find and lock the cell that references the message at `here`.
    ///
    /// A cuckoo move can carry the owner past the search, so an empty
    /// search only proves an orphan when no move was open or completed
    /// while it ran.
    fn find_owner(&self, thr: &ThreadCtx, here: SegRef, hdr: &MsgHeader) -> MsgOwner {
        let moves = self.move_counters();
        let mut busy = moves.0 != moves.1;
        for pos in self.candidate_positions(hdr.id) {
            let link = self.cell_word(pos, cw::HASH);
            let peek = link.load(Ordering::Relaxed);
            if peek & ZOMBIE64 != 0 {
                busy = true;
                continue;
            }
            if peek != hdr.id.hash {
                continue;
            }
            let Some(lock) = thr.alloc_lock() else {
                return MsgOwner::Busy;
            };
            let Some(prior) = self.qlock().try_acquire(link, pos as u64 + 1, lock) else {
                thr.free_lock(lock);
                busy = true;
                continue;
            };
            if let Some(referrer) = self.references(pos, prior, here, hdr) {
                return MsgOwner::Cell {
                    pos,
                    lock,
                    prior,
                    referrer,
                };
            }
            self.qlock().release(link, prior, lock);
            thr.free_lock(lock);
        }
        if busy || self.move_counters() != moves {
            MsgOwner::Busy
        } else {
            MsgOwner::Orphan
        }
    }

    /// With cell `pos` locked: `Some(None)` if its value is `here`,
    /// `Some(Some(m))` if list message `m` chains to `here`.
    fn references(
        &self,
        pos: usize,
        prior: u64,
        here: SegRef,
        hdr: &MsgHeader,
    ) -> Option<Option<SegRef>> {
        if prior != hdr.id.hash
            || self.cell_word(pos, cw::HASH2).load(Ordering::Relaxed) != hdr.id.hash2
        {
            return None;
        }
        let meta = CellMeta::decode(self.cell_word(pos, cw::META).load(Ordering::Relaxed));
        if !meta.has_msg() {
            return None;
        }
        let head = SegRef::unpack(self.cell_word(pos, cw::VALUE).load(Ordering::Relaxed))?;
        if head == here {
            return Some(None);
        }
        if !meta.flags.contains(CellFlags::MSG_LIST) {
            return None;
        }
        let mut cur = head;
        for _ in 0..MAX_MSG_CHAIN {
            if !self.valid_ref(cur, MSG_HEADER_BYTES as u64) {
                return None;
            }
            let m = MsgHeader::load(self.region(), self.msg_base(cur));
            match m.prev {
                Some(prev) if prev == here => return Some(Some(cur)),
                Some(prev) => cur = prev,
                None => return None,
            }
        }
        None
    }

    /// Compact one segment.
    ///
    /// Live messages slide toward the segment start. A message whose owner
    /// cell is locked by someone else stays put and a zombie filler covers
    /// the gap in front of it. Messages no cell references are reclaimed,
    /// as are values whose expiration has passed.
    pub fn gc_segment(&self, thr: &ThreadCtx, seg: usize) -> GcReport {
        let mut report = GcReport {
            seg: seg as u16,
            ..GcReport::default()
        };
        if seg >= self.geom().seg_count as usize {
            return report;
        }
        let _guard = self.lock_segment(thr, seg);
        let ring = self.seg_word(seg, sd::RING).load(Ordering::Relaxed);
        let seg_base = self.geom().seg_base(seg);
        let now = now_ns();
        let (mut i, mut j) = (0_u64, 0_u64);

        while i < ring {
            let here = SegRef::new(seg as u16, i);
            let hdr = MsgHeader::load(self.region(), seg_base + (i / 8) as usize);
            let size = u64::from(hdr.size);
            if size == 0 || size % 8 != 0 || i + size > ring {
                tracing::warn!(seg, off = i, size, "gc_segment: corrupt message size, stopping");
                if j < i {
                    write_filler(self.region(), seg_base + (j / 8) as usize, (i - j) as usize);
                }
                j = ring;
                break;
            }
            if hdr.is_zombie() {
                report.zombies += 1;
                i += size;
                continue;
            }
            match self.find_owner(thr, here, &hdr) {
                MsgOwner::Busy => {
                    if j < i {
                        write_filler(self.region(), seg_base + (j / 8) as usize, (i - j) as usize);
                    }
                    report.immovable += 1;
                    i += size;
                    j = i;
                }
                MsgOwner::Orphan => {
                    // the owner may have freed it while we searched
                    let again = MsgHeader::load(self.region(), seg_base + (i / 8) as usize);
                    if !again.is_zombie() {
                        zombify(self.region(), seg_base + (i / 8) as usize, size as usize);
                        self.seg_word(seg, sd::AVAIL)
                            .fetch_add(size, Ordering::AcqRel);
                        report.orphans += 1;
                    }
                    i += size;
                }
                MsgOwner::Cell {
                    pos,
                    lock,
                    prior,
                    referrer,
                } => {
                    let link = self.cell_word(pos, cw::HASH);
                    if self.cell_expired(pos, now) {
                        // frees `here` too; it becomes part of the gap
                        self.expire_locked_cell(thr, pos, prior);
                        self.qlock().release(link, DROPPED_HASH, lock);
                        thr.free_lock(lock);
                        report.expired += 1;
                        i += size;
                        continue;
                    }
                    if j != i {
                        self.move_msg(pos, here, SegRef::new(seg as u16, j), size, referrer);
                        // keep the walk intact up to `i + size` if we stop here
                        write_filler(
                            self.region(),
                            seg_base + ((j + size) / 8) as usize,
                            (i - j) as usize,
                        );
                        report.moved += 1;
                    }
                    self.qlock().release(link, prior, lock);
                    thr.free_lock(lock);
                    i += size;
                    j += size;
                }
            }
        }

        self.seg_word(seg, sd::RING).store(j, Ordering::Release);
        self.seg_word(seg, sd::GC_PASSES)
            .fetch_add(1, Ordering::Relaxed);
        report.reclaimed = ring - j;
        tracing::debug!(
            seg,
            moved = report.moved,
            immovable = report.immovable,
            orphans = report.orphans,
            expired = report.expired,
            reclaimed = report.reclaimed,
            "gc_segment: pass complete"
        );
        report
    }

    /// Slide a message down and repoint whoever referenced it. The owning
    /// cell is locked by the caller.
    fn move_msg(&self, pos: usize, from: SegRef, to: SegRef, size: u64, referrer: Option<SegRef>) {
        let region = self.region();
        let serial = self.cell_word(pos, cw::SERIAL).load(Ordering::Relaxed) + 1;
        region.copy_words(self.msg_base(from), self.msg_base(to), (size / 8) as usize);
        let mut moved = MsgHeader::load(region, self.msg_base(to));
        moved.serial = serial;
        moved.store_sealed(region, self.msg_base(to));
        match referrer {
            None => self
                .cell_word(pos, cw::VALUE)
                .store(to.pack(), Ordering::Relaxed),
            Some(r) => {
                let mut newer = MsgHeader::load(region, self.msg_base(r));
                newer.prev = Some(to);
                newer.store_sealed(region, self.msg_base(r));
            }
        }
        self.cell_word(pos, cw::SERIAL)
            .store(serial, Ordering::Release);
    }

    fn cell_expired(&self, pos: usize, now: u64) -> bool {
        let meta = CellMeta::decode(self.cell_word(pos, cw::META).load(Ordering::Relaxed));
        let expire = self.cell_word(pos, cw::EXPIRE).load(Ordering::Relaxed);
        meta.flags.contains(CellFlags::EXPIRES) && expire != 0 && expire <= now
    }

    /// Turn a locked, expired cell into a tombstone and free its value.
    /// The caller publishes `DROPPED_HASH` when it releases the lock.
    pub(crate) fn expire_locked_cell(&self, thr: &ThreadCtx, pos: usize, hash: u64) {
        let meta = CellMeta::decode(self.cell_word(pos, cw::META).load(Ordering::Relaxed));
        if meta.has_msg() {
            if let Some(head) =
                SegRef::unpack(self.cell_word(pos, cw::VALUE).load(Ordering::Relaxed))
            {
                self.free_chain(head);
            }
        }
        self.tombstone_cell(pos, hash, meta);
        if let Ok(base) = thr.stat_base(meta.db) {
            bump(self, base, Counter::Expire, 1);
            bump(self, base, Counter::Drop, 1);
        }
    }

    /// Write tombstone contents into a locked cell.
    pub(crate) fn tombstone_cell(&self, pos: usize, hash: u64, meta: CellMeta) {
        let dropped = CellMeta {
            flags: CellFlags::DROPPED,
            key_len: 0,
            db: meta.db,
            type_byte: 0,
        };
        self.cell_word(pos, cw::DROP).store(hash, Ordering::Relaxed);
        self.cell_word(pos, cw::META)
            .store(dropped.encode(), Ordering::Relaxed);
        self.cell_word(pos, cw::VALUE).store(0, Ordering::Relaxed);
        self.cell_word(pos, cw::SIZE).store(0, Ordering::Relaxed);
        self.cell_word(pos, cw::EXPIRE).store(0, Ordering::Relaxed);
        let serial = self.cell_word(pos, cw::SERIAL).load(Ordering::Relaxed) + 1;
        self.cell_word(pos, cw::SERIAL)
            .store(serial, Ordering::Release);
    }

    /// Walk a segment's messages. For inspection and tests.
    pub fn segment_messages(&self, seg: usize) -> Vec<(u64, MsgHeader)> {
        let mut out = Vec::new();
        if seg >= self.geom().seg_count as usize {
            return out;
        }
        let _guard = self.seg_lock(seg).lock();
        let ring = self.seg_word(seg, sd::RING).load(Ordering::Relaxed);
        let base = self.geom().seg_base(seg);
        let mut i = 0;
        while i < ring {
            let hdr = MsgHeader::load(self.region(), base + (i / 8) as usize);
            if hdr.size == 0 || u64::from(hdr.size) % 8 != 0 {
                break;
            }
            out.push((i, hdr));
            i += u64::from(hdr.size);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::MapConfig;
    use crate::hash::KeyIdentity;
    use crate::layout::hdr;
    use crate::msg::MsgFlags;

    fn table() -> Arc<HashTab> {
        HashTab::create(&MapConfig {
            map_size: 2 << 20,
            max_value_size: 1024,
            ..MapConfig::default()
        })
        .unwrap()
    }

    fn live_bytes(tab: &HashTab, seg: usize) -> u64 {
        tab.segment_messages(seg)
            .iter()
            .filter(|(_, h)| !h.is_zombie())
            .map(|(_, h)| u64::from(h.size))
            .sum()
    }

    #[test]
    fn orphans_are_reclaimed_and_bytes_conserved() {
        let tab = table();
        let thr = tab.attach_ctx(1).unwrap();
        let base = thr.stat_base(0).unwrap();
        let seg_size = tab.geom().seg_size;
        let hdr = MsgHeader::new(128, MsgFlags::LIVE, 0, KeyIdentity::new(77, 88));
        let a = tab.alloc_msg(&thr, base, &hdr).unwrap();
        let b = tab.alloc_msg(&thr, base, &hdr).unwrap();
        assert_eq!(a.seg, b.seg);
        let seg = usize::from(a.seg);
        let before = tab.segment_stats(seg);
        assert_eq!(before.ring, 256);
        assert_eq!(before.avail + live_bytes(&tab, seg), seg_size);

        let report = tab.gc_segment(&thr, seg);
        assert_eq!(report.orphans, 2);
        assert_eq!(report.reclaimed, 256);
        let after = tab.segment_stats(seg);
        assert_eq!(after.ring, 0);
        assert_eq!(after.avail, seg_size);
        assert_eq!(after.gc_passes, 1);
    }

    #[test]
    fn open_cuckoo_move_defers_orphan_reclaim() {
        let tab = table();
        let thr = tab.attach_ctx(1).unwrap();
        let base = thr.stat_base(0).unwrap();
        let msg = MsgHeader::new(128, MsgFlags::LIVE, 0, KeyIdentity::new(31, 41));
        let r = tab.alloc_msg(&thr, base, &msg).unwrap();
        let seg = usize::from(r.seg);
        let avail = tab.segment_stats(seg).avail;

        tab.hdr(hdr::MOVE_BEGIN).fetch_add(1, Ordering::AcqRel);
        let report = tab.gc_segment(&thr, seg);
        assert_eq!(report.orphans, 0);
        assert_eq!(report.immovable, 1);
        assert_eq!(tab.segment_stats(seg).avail, avail);

        tab.hdr(hdr::MOVE_END).fetch_add(1, Ordering::AcqRel);
        let report = tab.gc_segment(&thr, seg);
        assert_eq!(report.orphans, 1);
        assert_eq!(tab.segment_stats(seg).avail, tab.geom().seg_size);
    }

    #[test]
    fn free_at_tail_retreats_ring() {
        let tab = table();
        let thr = tab.attach_ctx(1).unwrap();
        let base = thr.stat_base(0).unwrap();
        let hdr = MsgHeader::new(64, MsgFlags::LIVE, 0, KeyIdentity::new(5, 6));
        let a = tab.alloc_msg(&thr, base, &hdr).unwrap();
        let b = tab.alloc_msg(&thr, base, &hdr).unwrap();
        tab.free_msg(a);
        assert_eq!(tab.segment_stats(usize::from(a.seg)).ring, 128);
        tab.free_msg(b);
        assert_eq!(tab.segment_stats(usize::from(b.seg)).ring, 64);
        tab.free_msg(b);
        let seg = usize::from(a.seg);
        assert_eq!(
            tab.segment_stats(seg).avail + live_bytes(&tab, seg),
            tab.geom().seg_size
        );
    }

    #[test]
    fn oversized_message_is_too_big() {
        let tab = table();
        let thr = tab.attach_ctx(1).unwrap();
        let base = thr.stat_base(0).unwrap();
        let size = tab.geom().seg_size as usize + 8;
        let hdr = MsgHeader::new(size, MsgFlags::LIVE, 0, KeyIdentity::new(5, 6));
        assert_eq!(tab.alloc_msg(&thr, base, &hdr), Err(KvStatus::TooBig));
    }
}
