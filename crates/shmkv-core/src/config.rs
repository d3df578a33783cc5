//! Map creation parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use shmkv_error::{KvError, Result};
use shmkv_region::StorageBackend;

use crate::cell::CELL_HEADER_BYTES;
use crate::layout::{MAX_ARITY, MAX_BUCKETS, MapGeometry};

/// Parameters fixed when a map is created.
///
/// Attachers read the resulting [`MapGeometry`] from the region header;
/// only the creator consults a `MapConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Total region size in bytes.
    pub map_size: u64,
    /// Largest value a single message may hold.
    pub max_value_size: u32,
    /// Bytes per hash cell, a multiple of 8.
    pub hash_entry_size: u32,
    /// Share of the usable region given to hash cells; 1.0 disables segments.
    pub hash_value_ratio: f64,
    /// Contiguous cells examined per cuckoo candidate.
    pub cuckoo_buckets: u32,
    /// Independent candidate positions per key; 1 selects linear probing.
    pub cuckoo_arity: u32,
    /// Linear probe limit.
    pub max_chains: u32,
    /// Exact number of hash cells. 0 derives it from `hash_value_ratio`.
    pub ht_cells: u64,
    pub backend: StorageBackend,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            map_size: 64 << 20,
            max_value_size: 64 << 10,
            hash_entry_size: 128,
            hash_value_ratio: 0.25,
            cuckoo_buckets: 1,
            cuckoo_arity: 1,
            max_chains: 32,
            ht_cells: 0,
            backend: StorageBackend::Heap,
        }
    }
}

impl MapConfig {
    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.map_size == 0 {
            return Err(KvError::config("map_size must be non-zero"));
        }
        if self.hash_entry_size % 8 != 0
            || (self.hash_entry_size as usize) < CELL_HEADER_BYTES + 8
            || self.hash_entry_size > 4096
        {
            return Err(KvError::config(format!(
                "hash_entry_size {} must be a multiple of 8 in {}..=4096",
                self.hash_entry_size,
                CELL_HEADER_BYTES + 8
            )));
        }
        if !self.hash_value_ratio.is_finite()
            || self.hash_value_ratio <= 0.0
            || self.hash_value_ratio > 1.0
        {
            return Err(KvError::config(format!(
                "hash_value_ratio {} must be in (0, 1]",
                self.hash_value_ratio
            )));
        }
        if self.cuckoo_arity == 0 || self.cuckoo_arity as usize > MAX_ARITY {
            return Err(KvError::config(format!(
                "cuckoo_arity {} must be in 1..={MAX_ARITY}",
                self.cuckoo_arity
            )));
        }
        if self.cuckoo_buckets == 0 || self.cuckoo_buckets as usize > MAX_BUCKETS {
            return Err(KvError::config(format!(
                "cuckoo_buckets {} must be in 1..={MAX_BUCKETS}",
                self.cuckoo_buckets
            )));
        }
        if self.max_chains == 0 || self.max_chains > 4096 {
            return Err(KvError::config(format!(
                "max_chains {} must be in 1..=4096",
                self.max_chains
            )));
        }
        if self.max_value_size < 8 || self.max_value_size > 1 << 30 {
            return Err(KvError::config(format!(
                "max_value_size {} must be in 8..=1g",
                self.max_value_size
            )));
        }
        Ok(())
    }

    /// Validate and lay out the map.
    pub fn geometry(&self) -> Result<MapGeometry> {
        self.validate()?;
        MapGeometry::compute(self)
    }

    /// Parse `key=value` pairs separated by commas or whitespace.
    ///
    /// Sizes accept `k`, `m`, `g` and `t` suffixes. Backends are written as
    /// `heap`, `anon`, `anon_huge`, `file:<path>` or `posix:<name>`.
    /// Unset keys keep their defaults.
    pub fn parse_params(params: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for pair in params
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| KvError::config(format!("expected key=value, got `{pair}`")))?;
            match key.trim() {
                "map_size" | "size" => cfg.map_size = parse_size(value)?,
                "max_value_size" => cfg.max_value_size = narrow(key, parse_size(value)?)?,
                "hash_entry_size" => cfg.hash_entry_size = narrow(key, parse_size(value)?)?,
                "hash_value_ratio" | "ratio" => {
                    cfg.hash_value_ratio = value.trim().parse().map_err(|_| {
                        KvError::config(format!("hash_value_ratio `{value}` is not a number"))
                    })?;
                }
                "cuckoo_buckets" | "buckets" => {
                    cfg.cuckoo_buckets = narrow(key, parse_size(value)?)?;
                }
                "cuckoo_arity" | "arity" => cfg.cuckoo_arity = narrow(key, parse_size(value)?)?,
                "max_chains" => cfg.max_chains = narrow(key, parse_size(value)?)?,
                "ht_cells" => cfg.ht_cells = parse_size(value)?,
                "backend" => cfg.backend = parse_backend(value)?,
                other => return Err(KvError::config(format!("unknown parameter `{other}`"))),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn narrow(key: &str, v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| KvError::config(format!("{key} value {v} does not fit in 32 bits")))
}

/// Parse `123`, `4k`, `64m`, `2g`, `1t`.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, shift) = match text.char_indices().last() {
        Some((i, 'k' | 'K')) => (&text[..i], 10),
        Some((i, 'm' | 'M')) => (&text[..i], 20),
        Some((i, 'g' | 'G')) => (&text[..i], 30),
        Some((i, 't' | 'T')) => (&text[..i], 40),
        _ => (text, 0),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| KvError::config(format!("`{text}` is not a size")))?;
    base.checked_mul(1 << shift)
        .ok_or_else(|| KvError::config(format!("size `{text}` overflows")))
}

fn parse_backend(text: &str) -> Result<StorageBackend> {
    let text = text.trim();
    match text {
        "heap" => return Ok(StorageBackend::Heap),
        "anon" => return Ok(StorageBackend::Anonymous { huge_pages: false }),
        "anon_huge" => return Ok(StorageBackend::Anonymous { huge_pages: true }),
        _ => {}
    }
    if let Some(path) = text.strip_prefix("file:").filter(|p| !p.is_empty()) {
        return Ok(StorageBackend::File {
            path: PathBuf::from(path),
        });
    }
    if let Some(name) = text.strip_prefix("posix:").filter(|n| !n.is_empty()) {
        let name = if name.starts_with('/') {
            name.to_owned()
        } else {
            format!("/{name}")
        };
        return Ok(StorageBackend::Posix { name });
    }
    Err(KvError::config(format!("unknown backend `{text}`")))
}
