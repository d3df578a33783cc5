//! Region layout: fixed areas, the header word map, and map geometry.
//!
//! ```text
//! +---------+-----------+--------------+------------+-----------+------------+---------------+
//! | header  | db seeds  | segment desc | stat links | contexts  | hash cells | segment data  |
//! | 64 w    | 256 x 2 w | 256 x 8 w    | 512 x 24 w | 128 x 136 | ht x cell  | n x seg_size  |
//! +---------+-----------+--------------+------------+-----------+------------+---------------+
//! ```
//!
//! Everything is addressed in 64-bit words from the start of the region.
//! The geometry words are written once at creation and covered by an
//! xxh3 checksum; the signature is stored last so an attacher never sees a
//! half-built map.

use std::sync::atomic::Ordering;

use serde::Serialize;
use shmkv_error::{KvError, Result};
use shmkv_region::{BackendKind, ShmRegion};
use xxhash_rust::xxh3::xxh3_64;

use crate::cell::CELL_HEADER_BYTES;
use crate::config::MapConfig;
use crate::context::CTX_WORDS;
use crate::msg::MSG_HEADER_BYTES;
use crate::segment::SEG_DESC_WORDS;
use crate::stats::STAT_LINK_WORDS;

/// `"SHMKVMAP"` little-endian.
pub const SIGNATURE: u64 = u64::from_le_bytes(*b"SHMKVMAP");
pub const LAYOUT_VERSION: u32 = 1;

pub const MAX_CTX: usize = 128;
pub const MAX_DB: usize = 256;
pub const MAX_STAT_LINKS: usize = 512;
pub const MAX_SEGMENTS: usize = 256;
pub const MAX_ARITY: usize = 4;
pub const MAX_BUCKETS: usize = 64;
pub const MAX_MSG_CHAIN: usize = 64;
pub const MIN_HT_SIZE: u64 = 16;

pub const HEADER_WORDS: usize = 64;
pub const DB_WORDS: usize = 2;

/// Word indices inside the region header.
pub mod hdr {
    pub const SIGNATURE: usize = 0;
    /// layout version in the low 32 bits, backend kind in bits 32..40
    pub const VERSION: usize = 1;
    pub const MAP_SIZE: usize = 2;
    pub const MAX_VALUE: usize = 3;
    pub const CELL_SIZE: usize = 4;
    pub const RATIO_PPM: usize = 5;
    /// buckets in the low 32 bits, arity in the high 32 bits
    pub const CUCKOO: usize = 6;
    pub const HT_SIZE: usize = 7;
    pub const MAX_CHAINS: usize = 8;
    pub const SEG_COUNT: usize = 9;
    pub const SEG_SIZE: usize = 10;
    pub const DB_OFF: usize = 11;
    pub const SEG_DESC_OFF: usize = 12;
    pub const STAT_OFF: usize = 13;
    pub const CTX_OFF: usize = 14;
    pub const HT_OFF: usize = 15;
    pub const SEG_DATA_OFF: usize = 16;
    pub const CREATE_NS: usize = 17;
    pub const CHECKSUM: usize = 18;

    pub const MOVE_BEGIN: usize = 24;
    pub const MOVE_END: usize = 25;
    /// bit 0 guards `RETIRED`
    pub const STAT_LOCK: usize = 26;
    pub const CTX_USED: usize = 28;
    pub const CTX_DEAD: usize = 30;
    pub const DB_OPENED: usize = 32;
    pub const RETIRED: usize = 40;
}

/// Sizes and offsets of every area in a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MapGeometry {
    pub map_size: u64,
    pub max_value_size: u32,
    /// bytes per hash cell
    pub cell_size: u32,
    /// hash/value ratio in parts per million
    pub ratio_ppm: u32,
    pub cuckoo_buckets: u32,
    pub cuckoo_arity: u32,
    /// number of hash cells
    pub ht_size: u64,
    pub max_chains: u32,
    pub seg_count: u32,
    /// bytes per segment
    pub seg_size: u64,
    pub db_off: usize,
    pub seg_desc_off: usize,
    pub stat_off: usize,
    pub ctx_off: usize,
    pub ht_off: usize,
    pub seg_data_off: usize,
}

const FIXED_WORDS: usize = HEADER_WORDS
    + MAX_DB * DB_WORDS
    + MAX_SEGMENTS * SEG_DESC_WORDS
    + MAX_STAT_LINKS * STAT_LINK_WORDS
    + MAX_CTX * CTX_WORDS;

/// Smallest segment the allocator will carve.
const MIN_SEG_BYTES: u64 = 64 * 1024;
/// Segments aim for this many maximum-size messages.
const SEG_VALUE_FACTOR: u64 = 16;

const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

impl MapGeometry {
    /// Lay out a map for `config`, which must already be validated.
    pub fn compute(config: &MapConfig) -> Result<Self> {
        let map_words = (config.map_size / 8) as usize;
        let cell_words = (config.hash_entry_size / 8) as usize;
        let need = (FIXED_WORDS + MIN_HT_SIZE as usize * cell_words) as u64 * 8;
        if (map_words as u64) * 8 < need {
            return Err(KvError::RegionTooSmall {
                need,
                have: config.map_size,
            });
        }
        let usable = (map_words - FIXED_WORDS) as u64;

        let ht_size = if config.ht_cells > 0 {
            config.ht_cells
        } else if config.hash_value_ratio >= 1.0 {
            usable / cell_words as u64
        } else {
            ((usable as f64 * config.hash_value_ratio) as u64) / cell_words as u64
        };
        let ht_words = ht_size * cell_words as u64;
        if ht_size < MIN_HT_SIZE || ht_words > usable {
            return Err(KvError::RegionTooSmall {
                need: (FIXED_WORDS as u64 + MIN_HT_SIZE.max(ht_size) * cell_words as u64) * 8,
                have: config.map_size,
            });
        }
        let slots = u64::from(config.cuckoo_arity) * u64::from(config.cuckoo_buckets);
        if config.cuckoo_arity > 1 && slots * 2 > ht_size {
            return Err(KvError::config(format!(
                "{ht_size} cells cannot hold {} disjoint buckets of {}",
                config.cuckoo_arity, config.cuckoo_buckets
            )));
        }

        let seg_area = (usable - ht_words) * 8;
        let max_msg = align8(u64::from(config.max_value_size) + MSG_HEADER_BYTES as u64 + 256);
        let (seg_count, seg_size) = if seg_area < max_msg * 8 {
            (0, 0)
        } else {
            let target = (max_msg * SEG_VALUE_FACTOR).max(MIN_SEG_BYTES);
            let count = (seg_area / target).clamp(1, MAX_SEGMENTS as u64);
            (count as u32, (seg_area / count) & !7)
        };

        let max_chains = if config.cuckoo_arity > 1 {
            config.max_chains
        } else {
            config.max_chains.min(u32::try_from(ht_size).unwrap_or(u32::MAX))
        };

        let db_off = HEADER_WORDS;
        let seg_desc_off = db_off + MAX_DB * DB_WORDS;
        let stat_off = seg_desc_off + MAX_SEGMENTS * SEG_DESC_WORDS;
        let ctx_off = stat_off + MAX_STAT_LINKS * STAT_LINK_WORDS;
        let ht_off = ctx_off + MAX_CTX * CTX_WORDS;
        let seg_data_off = ht_off + ht_words as usize;

        Ok(Self {
            map_size: (map_words as u64) * 8,
            max_value_size: config.max_value_size,
            cell_size: config.hash_entry_size,
            ratio_ppm: (config.hash_value_ratio.clamp(0.0, 1.0) * 1_000_000.0) as u32,
            cuckoo_buckets: config.cuckoo_buckets,
            cuckoo_arity: config.cuckoo_arity,
            ht_size,
            max_chains,
            seg_count,
            seg_size,
            db_off,
            seg_desc_off,
            stat_off,
            ctx_off,
            ht_off,
            seg_data_off,
        })
    }

    #[inline]
    pub const fn cell_words(&self) -> usize {
        (self.cell_size / 8) as usize
    }

    /// Bytes of inline storage after the cell header (key then value).
    #[inline]
    pub const fn inline_capacity(&self) -> usize {
        self.cell_size as usize - CELL_HEADER_BYTES
    }

    #[inline]
    pub const fn is_cuckoo(&self) -> bool {
        self.cuckoo_arity > 1
    }

    /// First word of hash cell `pos`.
    #[inline]
    pub const fn cell_base(&self, pos: usize) -> usize {
        self.ht_off + pos * self.cell_words()
    }

    /// First word of segment `seg`'s data area.
    #[inline]
    pub const fn seg_base(&self, seg: usize) -> usize {
        self.seg_data_off + seg * (self.seg_size / 8) as usize
    }

    #[inline]
    pub const fn seg_desc(&self, seg: usize) -> usize {
        self.seg_desc_off + seg * SEG_DESC_WORDS
    }

    #[inline]
    pub const fn ctx_base(&self, ctx: usize) -> usize {
        self.ctx_off + ctx * CTX_WORDS
    }

    #[inline]
    pub const fn stat_base(&self, link: usize) -> usize {
        self.stat_off + link * STAT_LINK_WORDS
    }

    #[inline]
    pub const fn db_base(&self, db: usize) -> usize {
        self.db_off + db * DB_WORDS
    }

    /// Bytes the layout actually uses.
    pub const fn used_bytes(&self) -> u64 {
        (self.seg_data_off as u64) * 8 + self.seg_count as u64 * self.seg_size
    }

    /// Write the geometry into a fresh region. The signature is left for
    /// [`publish_signature`] once the rest of the map is initialized.
    pub(crate) fn write_header(&self, region: &ShmRegion, backend: BackendKind, create_ns: u64) {
        let w = |idx: usize, v: u64| region.word(idx).store(v, Ordering::Relaxed);
        w(
            hdr::VERSION,
            u64::from(LAYOUT_VERSION) | (u64::from(backend as u8) << 32),
        );
        w(hdr::MAP_SIZE, self.map_size);
        w(hdr::MAX_VALUE, u64::from(self.max_value_size));
        w(hdr::CELL_SIZE, u64::from(self.cell_size));
        w(hdr::RATIO_PPM, u64::from(self.ratio_ppm));
        w(
            hdr::CUCKOO,
            u64::from(self.cuckoo_buckets) | (u64::from(self.cuckoo_arity) << 32),
        );
        w(hdr::HT_SIZE, self.ht_size);
        w(hdr::MAX_CHAINS, u64::from(self.max_chains));
        w(hdr::SEG_COUNT, u64::from(self.seg_count));
        w(hdr::SEG_SIZE, self.seg_size);
        w(hdr::DB_OFF, self.db_off as u64);
        w(hdr::SEG_DESC_OFF, self.seg_desc_off as u64);
        w(hdr::STAT_OFF, self.stat_off as u64);
        w(hdr::CTX_OFF, self.ctx_off as u64);
        w(hdr::HT_OFF, self.ht_off as u64);
        w(hdr::SEG_DATA_OFF, self.seg_data_off as u64);
        w(hdr::CREATE_NS, create_ns);
        w(hdr::CHECKSUM, header_checksum(region));
    }

    /// Validate and decode the header of an existing region.
    pub(crate) fn read_header(region: &ShmRegion) -> Result<(Self, BackendKind)> {
        if region.len_words() < HEADER_WORDS {
            return Err(KvError::RegionTooSmall {
                need: (HEADER_WORDS * 8) as u64,
                have: region.len_bytes() as u64,
            });
        }
        let found = region.word(hdr::SIGNATURE).load(Ordering::Acquire);
        if found != SIGNATURE {
            return Err(KvError::BadSignature { found });
        }
        let r = |idx: usize| region.word(idx).load(Ordering::Relaxed);
        let version = r(hdr::VERSION);
        if version as u32 != LAYOUT_VERSION {
            return Err(KvError::VersionMismatch {
                found: version as u32,
                expected: LAYOUT_VERSION,
            });
        }
        let stored = r(hdr::CHECKSUM);
        let computed = header_checksum(region);
        if stored != computed {
            return Err(KvError::ChecksumMismatch { stored, computed });
        }
        let backend = BackendKind::from_u8((version >> 32) as u8)
            .ok_or_else(|| KvError::unsupported("unknown backend kind in header"))?;
        let cuckoo = r(hdr::CUCKOO);
        let geom = Self {
            map_size: r(hdr::MAP_SIZE),
            max_value_size: r(hdr::MAX_VALUE) as u32,
            cell_size: r(hdr::CELL_SIZE) as u32,
            ratio_ppm: r(hdr::RATIO_PPM) as u32,
            cuckoo_buckets: cuckoo as u32,
            cuckoo_arity: (cuckoo >> 32) as u32,
            ht_size: r(hdr::HT_SIZE),
            max_chains: r(hdr::MAX_CHAINS) as u32,
            seg_count: r(hdr::SEG_COUNT) as u32,
            seg_size: r(hdr::SEG_SIZE),
            db_off: r(hdr::DB_OFF) as usize,
            seg_desc_off: r(hdr::SEG_DESC_OFF) as usize,
            stat_off: r(hdr::STAT_OFF) as usize,
            ctx_off: r(hdr::CTX_OFF) as usize,
            ht_off: r(hdr::HT_OFF) as usize,
            seg_data_off: r(hdr::SEG_DATA_OFF) as usize,
        };
        geom.check_decoded(region.len_bytes() as u64)?;
        Ok((geom, backend))
    }

    /// Re-derive the layout from the decoded parameters and require it to
    /// match the stored one word for word. A header with a valid checksum
    /// can still describe a map this build would never lay out.
    fn check_decoded(&self, region_bytes: u64) -> Result<()> {
        if self.map_size > region_bytes {
            return Err(KvError::RegionTooSmall {
                need: self.map_size,
                have: region_bytes,
            });
        }
        if self.cell_size == 0 || self.ht_size > self.map_size / u64::from(self.cell_size) {
            return Err(KvError::config(format!(
                "header describes {} cells of {} bytes in a {} byte map",
                self.ht_size, self.cell_size, self.map_size
            )));
        }
        let config = MapConfig {
            map_size: self.map_size,
            max_value_size: self.max_value_size,
            hash_entry_size: self.cell_size,
            hash_value_ratio: f64::from(self.ratio_ppm.clamp(1, 1_000_000)) / 1_000_000.0,
            cuckoo_buckets: self.cuckoo_buckets,
            cuckoo_arity: self.cuckoo_arity,
            max_chains: self.max_chains,
            ht_cells: self.ht_size,
            ..MapConfig::default()
        };
        let mut expected = config.geometry()?;
        expected.ratio_ppm = self.ratio_ppm;
        if expected != *self {
            return Err(KvError::config(
                "header geometry does not match the layout its parameters imply",
            ));
        }
        Ok(())
    }
}

/// Make the map visible to attachers.
pub(crate) fn publish_signature(region: &ShmRegion) {
    region
        .word(hdr::SIGNATURE)
        .store(SIGNATURE, Ordering::Release);
}

fn header_checksum(region: &ShmRegion) -> u64 {
    let mut bytes = [0_u8; (hdr::CHECKSUM - hdr::VERSION) * 8];
    for (i, idx) in (hdr::VERSION..hdr::CHECKSUM).enumerate() {
        let v = region.word(idx).load(Ordering::Relaxed);
        bytes[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
    }
    xxh3_64(&bytes)
}
