//! Dead context detection and recovery.
//!
//! A context whose process exited without detaching may still hold cell
//! locks, sit in a lock queue, hold a segment lock, or have a cuckoo move
//! open. Recovery finishes each of those on its behalf:
//!
//! - a held cell is released. Cells it was writing become tombstones, since
//!   their contents may be half written; cells it had claimed but not yet
//!   filled go back to their previous state.
//! - a segment lock it held is broken.
//! - an open move bracket is closed.
//! - its statistics links are folded into the retired totals.
//!
//! A context still queued behind a live lock holder cannot be finished
//! until that holder releases; it stays a zombie and recovery can be rerun.

use std::sync::atomic::Ordering;

use serde::Serialize;
use shmkv_error::{KvError, Result};
use tracing::{info, warn};

use crate::cell::{CellMeta, DROPPED_HASH, EMPTY_HASH, ZOMBIE64, cw};
use crate::context::{ContextId, CtxState, MCS_PER_CTX, xw};
use crate::layout::{MAX_CTX, hdr};
use crate::mcs::LockId;
use crate::stats;
use crate::table::HashTab;

/// Spins recovery waits for a dead context's turn in a lock queue.
const RECOVER_SPIN_LIMIT: u64 = 1 << 20;

/// What recovery did for one dead context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub ctx: Option<ContextId>,
    /// Cell locks released on the dead context's behalf.
    pub locks_recovered: u32,
    /// Cells turned into tombstones.
    pub cells_dropped: u32,
    /// Queue slots whose turn never came; the context stays a zombie.
    pub still_waiting: u32,
    /// Segment whose lock was broken.
    pub segment_unlocked: Option<u16>,
    pub move_closed: bool,
    pub stat_links_folded: u32,
}

impl RecoveryReport {
    /// Whether the context slot was freed.
    pub const fn complete(&self) -> bool {
        self.still_waiting == 0
    }
}

/// Whether process `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // EPERM means it exists but belongs to someone else
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

impl HashTab {
    /// Mark busy contexts whose process is gone as zombies.
    pub fn check_dead_contexts(&self) -> Vec<ContextId> {
        let mut dead = Vec::new();
        for idx in 0..MAX_CTX {
            if self.ctx_word(idx, xw::STATE).load(Ordering::Acquire) != CtxState::Busy as u64 {
                continue;
            }
            let pid = self.ctx_word(idx, xw::PID).load(Ordering::Relaxed) as u32;
            if pid == 0 || process_alive(pid) {
                continue;
            }
            if let Some(id) = ContextId::new(idx) {
                if self.mark_dead(id).is_ok() {
                    warn!(ctx = %id, pid, "context owner is gone");
                    dead.push(id);
                }
            }
        }
        dead
    }

    /// Declare a busy context dead, e.g. a thread that exited without
    /// dropping its context.
    pub fn mark_dead(&self, id: ContextId) -> Result<()> {
        let idx = id.index();
        self.ctx_word(idx, xw::STATE)
            .compare_exchange(
                CtxState::Busy as u64,
                CtxState::Zombie as u64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .map_err(|_| KvError::BadContext {
                ctx_id: id.index() as u32,
                expected: "busy",
            })?;
        self.hdr(hdr::CTX_DEAD + idx / 64)
            .fetch_or(1 << (idx % 64), Ordering::Release);
        Ok(())
    }

    /// Finish whatever the zombie context `dead` left locked or open.
    pub fn recover_context(&self, dead: ContextId) -> Result<RecoveryReport> {
        let idx = dead.index();
        if self.ctx_word(idx, xw::STATE).load(Ordering::Acquire) != CtxState::Zombie as u64 {
            return Err(KvError::BadContext {
                ctx_id: idx as u32,
                expected: "a zombie",
            });
        }
        let mut report = RecoveryReport {
            ctx: Some(dead),
            ..RecoveryReport::default()
        };

        let used_word = self.ctx_word(idx, xw::MCS_USED);
        let used = used_word.load(Ordering::Acquire);
        for slot in (0..MCS_PER_CTX).filter(|s| used & (1 << s) != 0) {
            let id = LockId::new(idx, slot);
            if self.recover_slot(id, &mut report) {
                used_word.fetch_and(!(1 << slot), Ordering::AcqRel);
            }
        }

        let seg_word = self.ctx_word(idx, xw::SEG_LOCK);
        let seg = seg_word.swap(0, Ordering::AcqRel);
        if seg != 0 && seg <= u64::from(self.geom().seg_count) {
            self.seg_lock((seg - 1) as usize).force_unlock();
            report.segment_unlocked = Some((seg - 1) as u16);
        }

        if self.ctx_word(idx, xw::MOVING).swap(0, Ordering::AcqRel) != 0 {
            let (begin, end) = self.move_counters();
            if begin > end {
                self.hdr(hdr::MOVE_END).fetch_add(1, Ordering::AcqRel);
                report.move_closed = true;
            }
        }

        for link in stats::links_of(self, dead) {
            stats::retire_link(self, link);
            report.stat_links_folded += 1;
        }

        if report.complete() {
            self.release_ctx_slot(idx);
            info!(
                ctx = %dead,
                locks = report.locks_recovered,
                dropped = report.cells_dropped,
                "context recovered"
            );
        } else {
            warn!(
                ctx = %dead,
                waiting = report.still_waiting,
                "context still queued on live locks; rerun recovery later"
            );
        }
        Ok(report)
    }

    /// Recover one MCS slot. `false` if it is still waiting in a queue.
    fn recover_slot(&self, id: LockId, report: &mut RecoveryReport) -> bool {
        let qlock = self.qlock();
        let link_pos = qlock.linked_pos(id);
        if link_pos == 0 {
            return true;
        }
        let pos = (link_pos - 1) as usize;
        if pos as u64 >= self.geom().ht_size {
            warn!(lock = id.raw(), link_pos, "recovery: slot names no cell");
            return true;
        }
        let link = self.cell_word(pos, cw::HASH);
        // A slot prepared but never swapped in names a cell it does not
        // hold and is not queued on.
        if link.load(Ordering::Acquire) & ZOMBIE64 == 0 {
            return true;
        }
        let Some(prior) = qlock.recover_lock(id, RECOVER_SPIN_LIMIT) else {
            report.still_waiting += 1;
            return false;
        };
        let publish = match prior {
            EMPTY_HASH | DROPPED_HASH => prior,
            hash => {
                let meta = CellMeta::decode(self.cell_word(pos, cw::META).load(Ordering::Relaxed));
                self.tombstone_cell(pos, hash, meta);
                report.cells_dropped += 1;
                DROPPED_HASH
            }
        };
        qlock.recover_unlock(link, publish, id);
        report.locks_recovered += 1;
        true
    }

    /// Detect dead contexts and recover each of them.
    pub fn recover_dead(&self) -> Vec<RecoveryReport> {
        self.check_dead_contexts();
        (0..MAX_CTX)
            .filter(|&idx| {
                self.ctx_word(idx, xw::STATE).load(Ordering::Acquire) == CtxState::Zombie as u64
            })
            .filter_map(ContextId::new)
            .filter_map(|id| self.recover_context(id).ok())
            .collect()
    }
}
