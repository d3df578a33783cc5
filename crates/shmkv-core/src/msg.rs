//! Segment message layout.
//!
//! ```text
//! word 0  SIZE     total bytes u32 | flags u16 | key_len u16
//! word 1  HASH     owning key identity
//! word 2  HASH2
//! word 3  SERIAL   cell serial when the message was sealed
//! word 4  PREV     older message of a list chain (0 = none)
//! word 5  PAYLOAD  payload bytes u32 | record count u32
//! word 6  SEAL     xxh3 of words 0..6, 0 while unsealed
//! word 7+ key (if stored here, padded to 8), then payload
//! ```
//!
//! A message is *live* while some cell references it and *zombie* once
//! freed. Zombies keep their size so the collector can step over them.

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use shmkv_region::ShmRegion;
use xxhash_rust::xxh3::xxh3_64;

use crate::cell::SegRef;
use crate::hash::KeyIdentity;

pub mod mw {
    pub const SIZE: usize = 0;
    pub const HASH: usize = 1;
    pub const HASH2: usize = 2;
    pub const SERIAL: usize = 3;
    pub const PREV: usize = 4;
    pub const PAYLOAD: usize = 5;
    pub const SEAL: usize = 6;
}

pub const MSG_HEADER_WORDS: usize = 7;
pub const MSG_HEADER_BYTES: usize = MSG_HEADER_WORDS * 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MsgFlags: u16 {
        const LIVE = 0x01;
        const ZOMBIE = 0x02;
        /// Payload is a sequence of length-prefixed records.
        const LIST = 0x04;
        /// The key is stored after the header.
        const KEY = 0x08;
        /// Space filler written by the collector around immovable messages.
        const FILLER = 0x10;
    }
}

pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Total message bytes for a stored key length and payload capacity.
pub const fn msg_size(key_in_msg: usize, payload_cap: usize) -> usize {
    MSG_HEADER_BYTES + align8(key_in_msg) + align8(payload_cap)
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub size: u32,
    pub flags: MsgFlags,
    pub key_len: u16,
    pub id: KeyIdentity,
    pub serial: u64,
    pub prev: Option<SegRef>,
    pub payload_len: u32,
    pub count: u32,
    pub seal: u64,
}

impl MsgHeader {
    /// Header for a freshly allocated, not yet sealed message.
    pub const fn new(size: usize, flags: MsgFlags, key_len: u16, id: KeyIdentity) -> Self {
        Self {
            size: size as u32,
            flags,
            key_len,
            id,
            serial: 0,
            prev: None,
            payload_len: 0,
            count: 0,
            seal: 0,
        }
    }

    fn size_word(&self) -> u64 {
        u64::from(self.size) | (u64::from(self.flags.bits()) << 32) | (u64::from(self.key_len) << 48)
    }

    fn words(&self) -> [u64; MSG_HEADER_WORDS - 1] {
        [
            self.size_word(),
            self.id.hash,
            self.id.hash2,
            self.serial,
            self.prev.map_or(0, SegRef::pack),
            u64::from(self.payload_len) | (u64::from(self.count) << 32),
        ]
    }

    pub fn load(region: &ShmRegion, base: usize) -> Self {
        let r = |i: usize| region.word(base + i).load(Ordering::Acquire);
        let size = r(mw::SIZE);
        let payload = r(mw::PAYLOAD);
        Self {
            size: size as u32,
            flags: MsgFlags::from_bits_truncate((size >> 32) as u16),
            key_len: (size >> 48) as u16,
            id: KeyIdentity {
                hash: r(mw::HASH),
                hash2: r(mw::HASH2),
            },
            serial: r(mw::SERIAL),
            prev: SegRef::unpack(r(mw::PREV)),
            payload_len: payload as u32,
            count: (payload >> 32) as u32,
            seal: r(mw::SEAL),
        }
    }

    /// Checksum over the header words; never zero.
    pub fn compute_seal(&self) -> u64 {
        let mut bytes = [0_u8; (MSG_HEADER_WORDS - 1) * 8];
        for (i, w) in self.words().into_iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        xxh3_64(&bytes) | 1
    }

    pub fn is_sealed(&self) -> bool {
        self.seal != 0 && self.seal == self.compute_seal()
    }

    pub const fn is_zombie(&self) -> bool {
        self.flags.contains(MsgFlags::ZOMBIE)
    }

    /// Byte offset of the payload from the message start.
    pub const fn payload_offset(&self) -> usize {
        if self.flags.contains(MsgFlags::KEY) {
            MSG_HEADER_BYTES + align8(self.key_len as usize)
        } else {
            MSG_HEADER_BYTES
        }
    }

    pub const fn capacity(&self) -> usize {
        (self.size as usize).saturating_sub(self.payload_offset())
    }

    /// Write the header words, leaving it unsealed.
    pub fn store_unsealed(&self, region: &ShmRegion, base: usize) {
        region.word(base + mw::SEAL).store(0, Ordering::Relaxed);
        for (i, w) in self.words().into_iter().enumerate() {
            region.word(base + i).store(w, Ordering::Relaxed);
        }
    }

    /// Write the header words and seal them.
    pub fn store_sealed(&mut self, region: &ShmRegion, base: usize) {
        self.store_unsealed(region, base);
        self.seal = self.compute_seal();
        region
            .word(base + mw::SEAL)
            .store(self.seal, Ordering::Release);
    }
}

/// Mark the message at `base` as freed, keeping its size.
pub fn zombify(region: &ShmRegion, base: usize, size: usize) {
    region.word(base + mw::SEAL).store(0, Ordering::Relaxed);
    let word = size as u64 | (u64::from(MsgFlags::ZOMBIE.bits()) << 32);
    region.word(base + mw::SIZE).store(word, Ordering::Release);
}

/// Write a zombie filler covering `size` bytes at `base`.
///
/// Fillers may be a single word, so only the size word is written.
pub fn write_filler(region: &ShmRegion, base: usize, size: usize) {
    let word = size as u64 | (u64::from((MsgFlags::ZOMBIE | MsgFlags::FILLER).bits()) << 32);
    region.word(base + mw::SIZE).store(word, Ordering::Release);
}
