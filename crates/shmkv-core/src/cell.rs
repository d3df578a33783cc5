//! Hash cell layout.
//!
//! ```text
//! word 0  HASH    lock word: 0 empty, 1 dropped, bit 63 locked, else key hash
//! word 1  HASH2   second half of the key identity
//! word 2  META    flags u16 | key_len u16 | db u8 | type u8
//! word 3  SERIAL  bumped on every published change
//! word 4  VALUE   segment reference of the value message (0 = none)
//! word 5  SIZE    value length u32 | message size u32
//! word 6  EXPIRE  expiration, ns since epoch (0 = never)
//! word 7  UPDATE  last update, ns since epoch
//! word 8  DROP    key hash saved by a tombstone
//! word 9+ inline key bytes, then inline value bytes
//! ```

use bitflags::bitflags;

use crate::hash::KeyIdentity;

pub const ZOMBIE64: u64 = 1 << 63;
pub const EMPTY_HASH: u64 = 0;
pub const DROPPED_HASH: u64 = 1;

pub mod cw {
    pub const HASH: usize = 0;
    pub const HASH2: usize = 1;
    pub const META: usize = 2;
    pub const SERIAL: usize = 3;
    pub const VALUE: usize = 4;
    pub const SIZE: usize = 5;
    pub const EXPIRE: usize = 6;
    pub const UPDATE: usize = 7;
    pub const DROP: usize = 8;
    pub const DATA: usize = 9;
}

pub const CELL_HEADER_BYTES: usize = cw::DATA * 8;

bitflags! {
    /// Per-cell state flags stored in the META word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CellFlags: u16 {
        /// Value bytes are stored inline after the key.
        const IMMEDIATE = 0x01;
        /// Value lives in a segment message.
        const SEGMENT = 0x02;
        /// Key is too long for the cell and lives in the message.
        const KEY_IN_MSG = 0x04;
        /// Value is a chain of list messages.
        const MSG_LIST = 0x08;
        /// EXPIRE word is set.
        const EXPIRES = 0x10;
        /// UPDATE word is set.
        const UPDATED = 0x20;
        /// Cell holds a tombstone.
        const DROPPED = 0x40;
    }
}

/// Decoded META word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellMeta {
    pub flags: CellFlags,
    pub key_len: u16,
    pub db: u8,
    pub type_byte: u8,
}

impl CellMeta {
    pub const fn decode(word: u64) -> Self {
        Self {
            flags: CellFlags::from_bits_truncate(word as u16),
            key_len: (word >> 16) as u16,
            db: (word >> 32) as u8,
            type_byte: (word >> 40) as u8,
        }
    }

    pub const fn encode(self) -> u64 {
        self.flags.bits() as u64
            | ((self.key_len as u64) << 16)
            | ((self.db as u64) << 32)
            | ((self.type_byte as u64) << 40)
    }

    pub const fn has_value(self) -> bool {
        self.flags.intersects(CellFlags::IMMEDIATE.union(CellFlags::SEGMENT))
    }

    /// Whether `VALUE` points at a segment message (value or long key).
    pub const fn has_msg(self) -> bool {
        self.flags.intersects(CellFlags::SEGMENT.union(CellFlags::KEY_IN_MSG))
    }
}

/// What a cell's lock word (plus its saved identity) says about the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Empty,
    /// Tombstone. `saved` is the identity of the key that was dropped, so
    /// the same key can reclaim the cell.
    Dropped { saved: KeyIdentity },
    /// Held by the queue lock; `tail` is the current queue tail.
    Locked { tail: u64 },
    Occupied { hash: u64 },
}

impl CellState {
    /// Decode a lock word. `hash2` and `drop` are only consulted for
    /// tombstones.
    pub const fn decode(word: u64, hash2: u64, drop: u64) -> Self {
        if word & ZOMBIE64 != 0 {
            Self::Locked {
                tail: word & !ZOMBIE64,
            }
        } else if word == EMPTY_HASH {
            Self::Empty
        } else if word == DROPPED_HASH {
            Self::Dropped {
                saved: KeyIdentity { hash: drop, hash2 },
            }
        } else {
            Self::Occupied { hash: word }
        }
    }

    pub const fn is_free(&self) -> bool {
        matches!(self, Self::Empty | Self::Dropped { .. })
    }
}

/// Reference to a message: segment number plus byte offset in the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegRef {
    pub seg: u16,
    pub off: u64,
}

const SEGREF_OFF_MASK: u64 = (1 << 48) - 1;

impl SegRef {
    pub const fn new(seg: u16, off: u64) -> Self {
        Self { seg, off }
    }

    /// 0 is reserved for "no message".
    pub const fn pack(self) -> u64 {
        ((self.seg as u64 + 1) << 48) | (self.off & SEGREF_OFF_MASK)
    }

    pub const fn unpack(word: u64) -> Option<Self> {
        if word == 0 {
            return None;
        }
        Some(Self {
            seg: ((word >> 48) - 1) as u16,
            off: word & SEGREF_OFF_MASK,
        })
    }
}

pub const fn pack_size(value_len: u32, msg_size: u32) -> u64 {
    value_len as u64 | ((msg_size as u64) << 32)
}

pub const fn unpack_size(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trip() {
        let meta = CellMeta {
            flags: CellFlags::SEGMENT | CellFlags::KEY_IN_MSG | CellFlags::EXPIRES,
            key_len: 300,
            db: 7,
            type_byte: 0xab,
        };
        assert_eq!(CellMeta::decode(meta.encode()), meta);
        assert!(meta.has_value());
        assert!(meta.has_msg());
        assert!(!CellMeta::default().has_value());
        let key_only = CellMeta {
            flags: CellFlags::KEY_IN_MSG,
            ..meta
        };
        assert!(!key_only.has_value());
        assert!(key_only.has_msg());
    }

    #[test]
    fn state_decoding() {
        assert_eq!(CellState::decode(0, 9, 9), CellState::Empty);
        assert_eq!(
            CellState::decode(1, 22, 11),
            CellState::Dropped {
                saved: KeyIdentity {
                    hash: 11,
                    hash2: 22
                }
            }
        );
        assert_eq!(
            CellState::decode(ZOMBIE64 | 33, 0, 0),
            CellState::Locked { tail: 33 }
        );
        assert_eq!(
            CellState::decode(0x1234, 0, 0),
            CellState::Occupied { hash: 0x1234 }
        );
        assert!(CellState::Empty.is_free());
        assert!(!CellState::Occupied { hash: 5 }.is_free());
    }

    #[test]
    fn segref_zero_is_none() {
        assert_eq!(SegRef::unpack(0), None);
        let r = SegRef::new(0, 0);
        assert_ne!(r.pack(), 0);
        assert_eq!(SegRef::unpack(r.pack()), Some(r));
        let r = SegRef::new(255, (1 << 40) + 8);
        assert_eq!(SegRef::unpack(r.pack()), Some(r));
    }
}
