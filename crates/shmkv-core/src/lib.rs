//! Lock-embedded hash table over a shared region.
//!
//! Every cell's first word is both the key hash and an MCS queue lock.
//! Writers lock the cell, readers copy it optimistically and validate.
//! Values too large for a cell live in segment messages, which a copying
//! collector compacts. Cuckoo mode spreads each key over several candidate
//! buckets and relocates occupants to make room.

pub mod atomic;
pub mod cell;
pub mod config;
pub mod context;
mod cuckoo;
pub mod hash;
pub mod key_ctx;
pub mod layout;
pub mod mcs;
pub mod msg;
pub mod recovery;
pub mod segment;
pub mod stats;
pub mod table;

pub use cell::{CellFlags, CellMeta, CellState, SegRef};
pub use config::{MapConfig, parse_size};
pub use context::{ContextId, ContextInfo, CtxState, ThreadCtx};
pub use cuckoo::{CUCKOO_RESTARTS, MAX_VISITS};
pub use hash::{Candidates, KeyIdentity, hash_key};
pub use key_ctx::{KeyCtx, KeyState};
pub use layout::{
    LAYOUT_VERSION, MAX_ARITY, MAX_BUCKETS, MAX_CTX, MAX_DB, MAX_MSG_CHAIN, MAX_SEGMENTS,
    MapGeometry,
};
pub use mcs::{Acquired, LockId, QueueLock};
pub use msg::{MsgFlags, MsgHeader};
pub use recovery::{RecoveryReport, process_alive};
pub use segment::GcReport;
pub use stats::{Counter, KeyStats, MapStats, SegmentStats};
pub use table::HashTab;
