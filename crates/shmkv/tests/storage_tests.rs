//! Storage-level integration tests: value round trips across inline and
//! segment storage, collector conservation, tombstone accounting, cuckoo
//! filling, file-backed maps, and statistics snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use shmkv::{HashTab, KeyCtx, KvStatus, MapConfig, StorageBackend};

fn map(cfg: MapConfig) -> Arc<HashTab> {
    HashTab::create(&cfg).unwrap()
}

fn small() -> MapConfig {
    MapConfig {
        map_size: 4 << 20,
        max_value_size: 4096,
        ..MapConfig::default()
    }
}

fn put(k: &mut KeyCtx<'_>, key: &[u8], value: &[u8]) {
    k.set_key(key);
    assert!(k.acquire().is_success());
    assert_eq!(k.load(value), KvStatus::Ok);
    assert_eq!(k.release(), KvStatus::Ok);
}

fn get(k: &mut KeyCtx<'_>, key: &[u8]) -> Option<Vec<u8>> {
    k.set_key(key);
    loop {
        match k.find() {
            KvStatus::Ok => return Some(k.value().unwrap()),
            KvStatus::NotFound => return None,
            KvStatus::Mutated => {}
            other => panic!("find returned {other:?}"),
        }
    }
}

fn live_bytes(tab: &HashTab, seg: usize) -> u64 {
    tab.segment_messages(seg)
        .iter()
        .filter(|(_, h)| !h.is_zombie())
        .map(|(_, h)| u64::from(h.size))
        .sum()
}

// ===========================================================================
// Round trips
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn values_round_trip_inline_and_in_segments(
        key in prop::collection::vec(any::<u8>(), 1..48),
        value in prop::collection::vec(any::<u8>(), 1..3000),
    ) {
        let tab = map(small());
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        put(&mut k, &key, &value);
        prop_assert_eq!(get(&mut k, &key), Some(value.clone()));
        prop_assert_eq!(k.value_len(), Ok(value.len()));

        let mut prefix = vec![0_u8; value.len() / 2];
        let partial = k.value_into(&mut prefix);
        if prefix.len() < value.len() {
            prop_assert_eq!(partial, Err(KvStatus::PartOnly));
            prop_assert_eq!(&prefix[..], &value[..prefix.len()]);
        }
    }

    #[test]
    fn collection_conserves_bytes_and_values(
        ops in prop::collection::vec((0_u8..24, prop::option::of(60_usize..900)), 1..120),
    ) {
        let tab = map(MapConfig {
            map_size: 2 << 20,
            max_value_size: 1024,
            ..MapConfig::default()
        });
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        let mut model: HashMap<u8, Vec<u8>> = HashMap::new();
        for (n, (key, len)) in ops.into_iter().enumerate() {
            k.set_key(&[b'g', key]);
            prop_assert!(k.acquire().is_success());
            match len {
                Some(len) => {
                    let value = vec![n as u8; len];
                    prop_assert_eq!(k.load(&value), KvStatus::Ok);
                    model.insert(key, value);
                }
                None => {
                    prop_assert_eq!(k.tombstone(), KvStatus::Ok);
                    model.remove(&key);
                }
            }
            k.release();
        }

        for seg in 0..tab.geom().seg_count as usize {
            tab.gc_segment(&thr, seg);
        }
        let seg_size = tab.geom().seg_size;
        for seg in tab.stats().segments {
            let idx = usize::from(seg.seg);
            prop_assert_eq!(seg.avail + live_bytes(&tab, idx), seg_size);
            prop_assert!(seg.ring <= seg_size);
        }
        for key in 0..24_u8 {
            prop_assert_eq!(get(&mut k, &[b'g', key]), model.get(&key).cloned());
        }
    }
}

// ===========================================================================
// Tombstones and accounting
// ===========================================================================

#[test]
fn repeated_tombstone_counts_once() {
    let tab = map(small());
    let thr = tab.attach_ctx(1).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    put(&mut k, b"doomed", &[1; 700]);

    k.set_key(b"doomed");
    assert_eq!(k.acquire(), KvStatus::Ok);
    assert_eq!(k.tombstone(), KvStatus::Ok);
    assert_eq!(k.tombstone(), KvStatus::Ok);
    assert_eq!(k.release(), KvStatus::Ok);

    let stats = thr.db_stats(0).unwrap();
    assert_eq!(stats.add, 1);
    assert_eq!(stats.drop, 1);
    assert_eq!(tab.totals().elements(), 0);
    assert_eq!(get(&mut k, b"doomed"), None);

    // the dropped key can come back
    put(&mut k, b"doomed", b"again");
    assert_eq!(get(&mut k, b"doomed"), Some(b"again".to_vec()));
    assert_eq!(tab.totals().elements(), 1);
}

// ===========================================================================
// Cuckoo
// ===========================================================================

#[test]
fn cuckoo_table_holds_a_high_load() {
    let tab = map(MapConfig {
        map_size: 4 << 20,
        cuckoo_arity: 2,
        cuckoo_buckets: 4,
        ht_cells: 2560,
        ..small()
    });
    let thr = tab.attach_ctx(1).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    for i in 0..2000_u64 {
        k.set_key(&i.to_le_bytes());
        assert_eq!(k.acquire(), KvStatus::IsNew, "key {i}");
        assert_eq!(k.load(&(i * 3).to_le_bytes()), KvStatus::Ok);
        k.release();
    }
    for i in 0..2000_u64 {
        assert_eq!(
            get(&mut k, &i.to_le_bytes()),
            Some((i * 3).to_le_bytes().to_vec()),
            "key {i}"
        );
    }
    let totals = tab.totals();
    assert_eq!(totals.elements(), 2000);
    assert!(totals.cuckmov > 0);
    assert!(totals.cuckmax >= 1);
    let (begin, end) = tab.move_counters();
    assert_eq!(begin, end);
}

// ===========================================================================
// Backends
// ===========================================================================

#[test]
fn file_backed_map_is_shared_between_handles() {
    let dir = tempfile::tempdir().unwrap();
    let backend = StorageBackend::File {
        path: dir.path().join("kv.map"),
    };
    let tab = map(MapConfig {
        backend: backend.clone(),
        ..small()
    });
    {
        let thr = tab.attach_ctx(1).unwrap();
        let mut k = KeyCtx::new(&thr, 2).unwrap();
        put(&mut k, b"small", b"inline");
        put(&mut k, b"large", &[9; 2000]);
    }
    tab.flush().unwrap();

    let other = HashTab::attach(&backend).unwrap();
    assert_eq!(other.geom().ht_size, tab.geom().ht_size);
    assert_eq!(other.geom().seg_count, tab.geom().seg_count);
    let thr = other.attach_ctx(2).unwrap();
    let mut k = KeyCtx::new(&thr, 2).unwrap();
    assert_eq!(get(&mut k, b"small"), Some(b"inline".to_vec()));
    assert_eq!(get(&mut k, b"large"), Some(vec![9; 2000]));

    // writes through the second handle are visible through the first
    put(&mut k, b"small", b"changed");
    let thr1 = tab.attach_ctx(3).unwrap();
    let mut k1 = KeyCtx::new(&thr1, 2).unwrap();
    assert_eq!(get(&mut k1, b"small"), Some(b"changed".to_vec()));
}

#[test]
fn attach_rejects_a_file_that_is_not_a_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk");
    std::fs::write(&path, vec![0xff_u8; 1 << 16]).unwrap();
    assert!(HashTab::attach(&StorageBackend::File { path }).is_err());
}

// ===========================================================================
// Statistics
// ===========================================================================

#[test]
fn stats_snapshot_serializes() {
    let tab = map(small());
    let thr = tab.attach_ctx(1).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    for i in 0..10_u8 {
        put(&mut k, &[i], &[i; 300]);
    }
    get(&mut k, b"missing");

    let json = serde_json::to_value(tab.stats()).unwrap();
    assert_eq!(json["elements"], 10);
    assert_eq!(json["totals"]["add"], 10);
    assert_eq!(json["totals"]["miss"], 1);
    assert_eq!(json["ht_size"], tab.geom().ht_size);
    assert_eq!(json["dbs_opened"], serde_json::json!([0]));
    let segments = json["segments"].as_array().unwrap();
    assert_eq!(segments.len(), tab.geom().seg_count as usize);
}
