use thiserror::Error;

/// Outcome of a key operation.
///
/// Key operations never allocate an error object on the hot path; they
/// return one of these codes. `Ok` and `IsNew` are successes, everything
/// else tells the caller why the operation did not take effect.
#[must_use]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum KvStatus {
    /// Operation completed.
    #[error("ok")]
    Ok = 0,
    /// The key was not present and a cell was claimed for it.
    #[error("new key claimed")]
    IsNew = 1,
    /// The key is not in the table.
    #[error("key not found")]
    NotFound = 2,
    /// The cell is locked by another context.
    #[error("cell is busy")]
    Busy = 3,
    /// No cell could be claimed or relocated for the key.
    #[error("hash table full")]
    HtFull = 4,
    /// The value does not fit in the cell or in a segment message.
    #[error("value too big")]
    TooBig = 5,
    /// The message chain of a list value reached its length limit.
    #[error("message list full")]
    MsgListFull = 6,
    /// No segment had room for the message, even after collection.
    #[error("segment allocation failed")]
    AllocFailed = 7,
    /// A concurrent writer changed the cell during an optimistic read.
    #[error("value mutated during read")]
    Mutated = 8,
    /// The key exists but carries no value.
    #[error("key has no value")]
    NoValue = 9,
    /// The cell holds a tombstone.
    #[error("cell is tombstoned")]
    Tombstone = 10,
    /// The destination buffer held only a prefix of the value.
    #[error("only part of the value was copied")]
    PartOnly = 11,
    /// A write was attempted through a context that does not hold the cell.
    #[error("write through a context that does not hold the cell")]
    WriteIllegal = 12,
    /// The key was found but its expiration time has passed.
    #[error("key expired")]
    Expired = 13,
}

impl KvStatus {
    /// Every status in code order.
    pub const ALL: [Self; 14] = [
        Self::Ok,
        Self::IsNew,
        Self::NotFound,
        Self::Busy,
        Self::HtFull,
        Self::TooBig,
        Self::MsgListFull,
        Self::AllocFailed,
        Self::Mutated,
        Self::NoValue,
        Self::Tombstone,
        Self::PartOnly,
        Self::WriteIllegal,
        Self::Expired,
    ];

    /// `Ok` or `IsNew`.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::IsNew)
    }

    /// Whether retrying the same operation may succeed.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Busy | Self::Mutated)
    }

    /// Whether the map ran out of some fixed capacity.
    pub const fn is_capacity(self) -> bool {
        matches!(
            self,
            Self::HtFull | Self::TooBig | Self::MsgListFull | Self::AllocFailed
        )
    }

    /// Stable integer code, shared with the C interface.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`Self::code`].
    pub const fn from_code(code: i32) -> Option<Self> {
        if code < 0 || code as usize >= Self::ALL.len() {
            None
        } else {
            Some(Self::ALL[code as usize])
        }
    }

    /// Static, NUL-free description.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::IsNew => "is_new",
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::HtFull => "ht_full",
            Self::TooBig => "too_big",
            Self::MsgListFull => "msg_list_full",
            Self::AllocFailed => "alloc_failed",
            Self::Mutated => "mutated",
            Self::NoValue => "no_value",
            Self::Tombstone => "tombstone",
            Self::PartOnly => "part_only",
            Self::WriteIllegal => "write_illegal",
            Self::Expired => "expired",
        }
    }

    /// Convert to a `Result`, treating both success codes as `Ok`.
    pub const fn into_result(self) -> std::result::Result<Self, Self> {
        if self.is_success() { Ok(self) } else { Err(self) }
    }
}

/// Errors from opening, creating, or administering a map.
#[derive(Error, Debug)]
pub enum KvError {
    /// The region is smaller than the layout it must hold.
    #[error("region too small: need {need} bytes, have {have}")]
    RegionTooSmall { need: u64, have: u64 },

    /// The region does not start with the map signature.
    #[error("region signature mismatch: found {found:#018x}")]
    BadSignature { found: u64 },

    /// The region was laid out by an incompatible version.
    #[error("region layout version {found} not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    /// The immutable header words fail their checksum.
    #[error("region header checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Every context slot is in use.
    #[error("no free context slot (capacity {capacity})")]
    NoFreeContext { capacity: usize },

    /// Every statistics link is in use.
    #[error("no free statistics link (capacity {capacity})")]
    NoFreeStatLink { capacity: usize },

    /// A database number outside the supported range.
    #[error("database {db} out of range (max {max})")]
    BadDatabase { db: u32, max: u32 },

    /// A context id that does not name a slot, or names one in the wrong state.
    #[error("context {ctx_id} is not {expected}")]
    BadContext {
        ctx_id: u32,
        expected: &'static str,
    },

    /// The storage backend cannot be used on this platform or for this call.
    #[error("storage backend unsupported: {detail}")]
    Unsupported { detail: String },

    /// OS-level failure while mapping, sizing, or flushing a region.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Integer codes for [`KvError`] on the C interface.
///
/// These sit above the [`KvStatus`] range so the two never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    RegionTooSmall = 100,
    BadSignature = 101,
    VersionMismatch = 102,
    ChecksumMismatch = 103,
    InvalidConfig = 104,
    NoFreeContext = 105,
    NoFreeStatLink = 106,
    BadDatabase = 107,
    BadContext = 108,
    Unsupported = 109,
    Io = 110,
}

impl KvError {
    /// Map this error to its stable integer code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::RegionTooSmall { .. } => ErrorCode::RegionTooSmall,
            Self::BadSignature { .. } => ErrorCode::BadSignature,
            Self::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::NoFreeContext { .. } => ErrorCode::NoFreeContext,
            Self::NoFreeStatLink { .. } => ErrorCode::NoFreeStatLink,
            Self::BadDatabase { .. } => ErrorCode::BadDatabase,
            Self::BadContext { .. } => ErrorCode::BadContext,
            Self::Unsupported { .. } => ErrorCode::Unsupported,
            Self::Io(_) => ErrorCode::Io,
        }
    }

    /// Whether the region itself is unusable (as opposed to a bad request).
    pub const fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::BadSignature { .. }
                | Self::VersionMismatch { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Whether the call may succeed later without any change by the caller.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoFreeContext { .. } | Self::NoFreeStatLink { .. }
        )
    }

    /// Create an invalid configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Create an unsupported backend error.
    pub fn unsupported(detail: impl Into<String>) -> Self {
        Self::Unsupported {
            detail: detail.into(),
        }
    }
}

/// Result type alias for map administration.
pub type Result<T> = std::result::Result<T, KvError>;
