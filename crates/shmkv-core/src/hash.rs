//! Key hashing and candidate cell placement.

use xxhash_rust::xxh3::xxh3_128_with_seed;

use crate::cell::{DROPPED_HASH, ZOMBIE64};
use crate::layout::{MAX_ARITY, MapGeometry};

/// 128-bit key identity.
///
/// `hash` is what the cell's lock word holds, so it never has the lock bit
/// set and is never one of the reserved values 0 (empty) or 1 (dropped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyIdentity {
    pub hash: u64,
    pub hash2: u64,
}

impl KeyIdentity {
    /// Normalize a raw 128-bit hash into a usable identity.
    pub const fn new(hash: u64, hash2: u64) -> Self {
        let mut h = hash & !ZOMBIE64;
        if h <= DROPPED_HASH {
            h += 2;
        }
        Self { hash: h, hash2 }
    }

    /// Uniform 64-bit value for placing the key. `hash` has its top bit
    /// cleared, so borrow one bit from `hash2` to cover the whole table.
    #[inline]
    pub const fn placement(&self) -> u64 {
        (self.hash << 1) | (self.hash2 >> 63)
    }
}

/// Hash `key` under a database's seed pair.
pub fn hash_key(seed: (u64, u64), key: &[u8]) -> KeyIdentity {
    let h = xxh3_128_with_seed(key, seed.0 ^ seed.1.rotate_left(32));
    KeyIdentity::new(h as u64, (h >> 64) as u64 ^ seed.1)
}

/// Map `h` uniformly onto `0..n` without a division.
#[inline]
pub const fn fastrange(h: u64, n: u64) -> u64 {
    ((h as u128 * n as u128) >> 64) as u64
}

/// Invertible 64-bit finalizer (murmur3 `fmix64`).
#[inline]
pub const fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// The cells a key may occupy in cuckoo mode.
///
/// `arity` bucket starts, each followed by `buckets` contiguous cells
/// (wrapping at the table end). Bucket ranges are kept pairwise disjoint
/// whenever the table is large enough to allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidates {
    starts: [u64; MAX_ARITY],
    arity: usize,
    buckets: u64,
    ht_size: u64,
}

const PLACEMENT_TRIES: u32 = 64;

impl Candidates {
    pub fn compute(id: KeyIdentity, geom: &MapGeometry) -> Self {
        let n = geom.ht_size;
        let arity = (geom.cuckoo_arity as usize).clamp(1, MAX_ARITY);
        let buckets = u64::from(geom.cuckoo_buckets).max(1);
        let mut starts = [0_u64; MAX_ARITY];
        starts[0] = fastrange(id.placement(), n);
        let mut seed = id.hash2;
        for i in 1..arity {
            let mut pick = 0;
            for _ in 0..PLACEMENT_TRIES {
                seed = mix64(seed.wrapping_add(0x9e37_79b9_7f4a_7c15));
                pick = fastrange(seed, n);
                if starts[..i]
                    .iter()
                    .all(|&s| circular_distance(s, pick, n) >= buckets)
                {
                    break;
                }
            }
            starts[i] = pick;
        }
        Self {
            starts,
            arity,
            buckets,
            ht_size: n,
        }
    }

    pub const fn len(&self) -> usize {
        self.arity * self.buckets as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All candidate positions, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.starts[..self.arity].iter().flat_map(move |&s| {
            (0..self.buckets).map(move |k| ((s + k) % self.ht_size) as usize)
        })
    }

    pub fn contains(&self, pos: usize) -> bool {
        self.iter().any(|p| p == pos)
    }
}

const fn circular_distance(a: u64, b: u64, n: u64) -> u64 {
    let d = if a > b { a - b } else { b - a };
    if d > n - d { n - d } else { d }
}

/// Natural position plus linear probe positions.
pub fn linear_probe(id: KeyIdentity, geom: &MapGeometry) -> impl Iterator<Item = usize> {
    let n = geom.ht_size;
    let natural = fastrange(id.placement(), n);
    (0..u64::from(geom.max_chains)).map(move |k| ((natural + k) % n) as usize)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::config::MapConfig;

    fn cuckoo_geom(cells: u64, arity: u32, buckets: u32) -> MapGeometry {
        MapConfig {
            map_size: 4 << 20,
            ht_cells: cells,
            cuckoo_arity: arity,
            cuckoo_buckets: buckets,
            ..MapConfig::default()
        }
        .geometry()
        .unwrap()
    }

    #[test]
    fn identity_avoids_reserved_values() {
        for raw in [0, 1, ZOMBIE64, ZOMBIE64 | 1] {
            let id = KeyIdentity::new(raw, 7);
            assert!(id.hash > DROPPED_HASH);
            assert_eq!(id.hash & ZOMBIE64, 0);
        }
    }

    #[test]
    fn seeds_change_identity() {
        let a = hash_key((1, 2), b"alpha");
        let b = hash_key((3, 4), b"alpha");
        assert_ne!(a, b);
        assert_eq!(a, hash_key((1, 2), b"alpha"));
    }

    #[test]
    fn fastrange_bounds() {
        assert_eq!(fastrange(0, 10), 0);
        assert_eq!(fastrange(u64::MAX, 10), 9);
        assert_eq!(fastrange(u64::MAX / 2, 1000), 499);
    }

    #[test]
    fn candidate_buckets_are_disjoint() {
        let g = cuckoo_geom(1024, 2, 4);
        for i in 0..500_u64 {
            let id = hash_key((i, !i), &i.to_le_bytes());
            let c = Candidates::compute(id, &g);
            let set: HashSet<usize> = c.iter().collect();
            assert_eq!(set.len(), 8, "overlapping buckets for key {i}");
            assert!(c.iter().all(|p| (p as u64) < g.ht_size));
        }
    }

    #[test]
    fn linear_probe_wraps() {
        let g = cuckoo_geom(64, 1, 1);
        let id = KeyIdentity::new(u64::MAX - 5, 0);
        let probes: Vec<usize> = linear_probe(id, &g).collect();
        assert_eq!(probes.len(), 32);
        assert_eq!(probes[0], 63);
        assert_eq!(probes[1], 0);
    }

    proptest! {
        #[test]
        fn candidates_are_deterministic(hash in any::<u64>(), hash2 in any::<u64>()) {
            let g = cuckoo_geom(4096, 4, 8);
            let id = KeyIdentity::new(hash, hash2);
            let a: Vec<usize> = Candidates::compute(id, &g).iter().collect();
            let b: Vec<usize> = Candidates::compute(id, &g).iter().collect();
            prop_assert_eq!(a.len(), 32);
            prop_assert_eq!(a, b);
        }
    }
}
