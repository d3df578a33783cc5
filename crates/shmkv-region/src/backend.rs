use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};
use shmkv_error::Result;

/// Where a map's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-private heap words. Useful for tests and single-process use.
    #[default]
    Heap,
    /// Anonymous shared mapping, inherited across `fork`.
    Anonymous { huge_pages: bool },
    /// A regular file mapped shared; survives process exit.
    File { path: PathBuf },
    /// A POSIX shared memory object (`shm_open`).
    Posix { name: String },
}

impl StorageBackend {
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Heap => BackendKind::Heap,
            Self::Anonymous { .. } => BackendKind::Anonymous,
            Self::File { .. } => BackendKind::File,
            Self::Posix { .. } => BackendKind::Posix,
        }
    }

    /// Whether another process can attach to this backend by name.
    pub const fn is_named(&self) -> bool {
        matches!(self, Self::File { .. } | Self::Posix { .. })
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap => f.write_str("heap"),
            Self::Anonymous { huge_pages: false } => f.write_str("anon"),
            Self::Anonymous { huge_pages: true } => f.write_str("anon_huge"),
            Self::File { path } => write!(f, "file:{}", path.display()),
            Self::Posix { name } => write!(f, "posix:{name}"),
        }
    }
}

/// Backend type recorded in the region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BackendKind {
    Heap = 1,
    Anonymous = 2,
    File = 3,
    Posix = 4,
}

impl BackendKind {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Heap),
            2 => Some(Self::Anonymous),
            3 => Some(Self::File),
            4 => Some(Self::Posix),
            _ => None,
        }
    }
}

/// Storage that can be viewed as a slice of atomic words.
///
/// Implementations own the mapping and keep it alive for as long as the
/// backing value exists. The word slice must be 8-byte aligned and its
/// contents zero on creation.
pub trait RegionBacking: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// The mapped words.
    fn words(&self) -> &[AtomicU64];

    /// Push dirty pages to the backing store. A no-op for memory backends.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
