//! Multi-process shared-memory key-value store.
//!
//! A map lives in one shared region: a hash directory whose cells double as
//! queue locks, plus segments holding values too large for a cell. Any
//! number of processes can attach the same region and operate on keys
//! concurrently.
//!
//! ```no_run
//! use shmkv::{HashTab, KeyCtx, KvStatus, MapConfig};
//!
//! let tab = HashTab::create(&MapConfig::parse_params("map_size=64m").unwrap()).unwrap();
//! let thr = tab.attach_ctx(u64::from(std::process::id())).unwrap();
//! let mut key = KeyCtx::new(&thr, 0).unwrap();
//! key.set_key(b"greeting");
//! if key.acquire().is_success() {
//!     assert_eq!(key.load(b"hello"), KvStatus::Ok);
//!     key.release();
//! }
//! ```

pub use shmkv_core::{
    CellState, ContextId, ContextInfo, Counter, CtxState, GcReport, HashTab, KeyCtx, KeyIdentity,
    KeyState, KeyStats, MapConfig, MapGeometry, MapStats, RecoveryReport, SegmentStats,
    ThreadCtx, parse_size, process_alive,
};
pub use shmkv_error::{ErrorCode, KvError, KvStatus, Result};
pub use shmkv_region::{BackendKind, ShmRegion, StorageBackend};

pub use shmkv_core;
pub use shmkv_region;
