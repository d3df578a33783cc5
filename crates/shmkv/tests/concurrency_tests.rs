//! Multi-threaded behavior of the map: cell locks exclude each other,
//! optimistic readers never observe a torn value or miss a key that is
//! being relocated, the collector runs alongside writers, racing claims of
//! one key publish a single cell, and a context that dies holding a cell is
//! recovered.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use shmkv::{CellState, CtxState, HashTab, KeyCtx, KvStatus, MapConfig};

fn map(params: &str) -> Arc<HashTab> {
    HashTab::create(&MapConfig::parse_params(params).unwrap()).unwrap()
}

fn acquire_blocking(k: &mut KeyCtx<'_>) -> KvStatus {
    loop {
        let status = k.acquire();
        if status != KvStatus::Busy {
            return status;
        }
        thread::yield_now();
    }
}

/// Optimistic lookup, retrying while the cell is changing.
fn find_settled(k: &mut KeyCtx<'_>) -> Option<Vec<u8>> {
    loop {
        match k.find() {
            KvStatus::Ok => return Some(k.value().unwrap()),
            KvStatus::NotFound => return None,
            KvStatus::Mutated | KvStatus::Busy => thread::yield_now(),
            other => panic!("find returned {other:?}"),
        }
    }
}

// ===========================================================================
// Mutual exclusion
// ===========================================================================

#[test]
fn counter_increments_are_not_lost() {
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 2_000;

    let tab = map("map_size=4m");
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tab = Arc::clone(&tab);
            thread::spawn(move || {
                let thr = tab.attach_ctx(t).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                for _ in 0..ROUNDS {
                    k.set_key(b"counter");
                    assert!(acquire_blocking(&mut k).is_success());
                    let n = k
                        .value()
                        .map_or(0, |v| u64::from_le_bytes(v.try_into().unwrap()));
                    assert_eq!(k.load(&(n + 1).to_le_bytes()), KvStatus::Ok);
                    assert_eq!(k.release(), KvStatus::Ok);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let thr = tab.attach_ctx(99).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    k.set_key(b"counter");
    assert_eq!(k.find(), KvStatus::Ok);
    let n = u64::from_le_bytes(k.value().unwrap().try_into().unwrap());
    assert_eq!(n, THREADS * ROUNDS);
}

#[test]
fn disjoint_keys_from_many_threads() {
    const THREADS: u64 = 6;
    const KEYS: u64 = 200;

    let tab = map("map_size=8m");
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tab = Arc::clone(&tab);
            thread::spawn(move || {
                let thr = tab.attach_ctx(t).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                for i in 0..KEYS {
                    let key = format!("t{t}-k{i}");
                    k.set_key(key.as_bytes());
                    assert_eq!(acquire_blocking(&mut k), KvStatus::IsNew);
                    let value = vec![t as u8; 100 + i as usize];
                    assert_eq!(k.load(&value), KvStatus::Ok);
                    k.release();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let thr = tab.attach_ctx(99).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    for t in 0..THREADS {
        for i in 0..KEYS {
            k.set_key(format!("t{t}-k{i}").as_bytes());
            assert_eq!(k.find(), KvStatus::Ok);
            assert_eq!(k.value().unwrap(), vec![t as u8; 100 + i as usize]);
        }
    }
    assert_eq!(tab.totals().elements(), THREADS * KEYS);
}

#[test]
fn racing_claims_of_one_key_publish_one_cell() {
    const KEYS: usize = 4;
    const ROUNDS: usize = 3_000;

    for params in ["map_size=2m,ht_cells=64", "map_size=2m,ht_cells=64,arity=2,buckets=2"] {
        let tab = map(params);
        let stop = Arc::new(AtomicBool::new(false));
        let keys: Vec<Vec<u8>> = (0..KEYS).map(|i| format!("dup{i}").into_bytes()).collect();

        // Keeps turning the keys back into tombstones so claims keep racing
        // over recycled and dropped cells.
        let dropper = {
            let tab = Arc::clone(&tab);
            let stop = Arc::clone(&stop);
            let keys = keys.clone();
            thread::spawn(move || {
                let thr = tab.attach_ctx(50).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                let mut round = 0;
                while !stop.load(Ordering::Relaxed) {
                    k.set_key(&keys[round % KEYS]);
                    if acquire_blocking(&mut k) == KvStatus::Ok {
                        assert_eq!(k.tombstone(), KvStatus::Ok);
                    }
                    k.release();
                    round += 1;
                }
            })
        };

        let writers: Vec<_> = (0..4_u64)
            .map(|t| {
                let tab = Arc::clone(&tab);
                let keys = keys.clone();
                thread::spawn(move || {
                    let thr = tab.attach_ctx(t).unwrap();
                    let mut k = KeyCtx::new(&thr, 0).unwrap();
                    for round in 0..ROUNDS {
                        k.set_key(&keys[(round + t as usize) % KEYS]);
                        assert!(acquire_blocking(&mut k).is_success());
                        assert_eq!(k.load(&[t as u8; 16]), KvStatus::Ok);
                        assert_eq!(k.release(), KvStatus::Ok);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        dropper.join().unwrap();

        let thr = tab.attach_ctx(99).unwrap();
        let mut seen: HashMap<Vec<u8>, usize> = HashMap::new();
        tab.scan(&thr, 0, |k| *seen.entry(k.key().to_vec()).or_default() += 1)
            .unwrap();
        assert!(seen.len() <= KEYS, "{params}");
        for (key, n) in &seen {
            let key = String::from_utf8_lossy(key);
            assert_eq!(*n, 1, "{params}: {key} published {n} times");
        }
        assert_eq!(tab.totals().elements(), seen.len() as u64, "{params}");
    }
}

// ===========================================================================
// Optimistic reads
// ===========================================================================

#[test]
fn readers_never_see_torn_values() {
    // One inline-sized and one segment-sized pattern per fill byte.
    const SHAPES: [(usize, u8); 4] = [(40, 0xaa), (40, 0x55), (900, 0xc3), (900, 0x3c)];

    let tab = map("map_size=4m,max_value_size=4k");
    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));

    {
        let thr = tab.attach_ctx(0).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        k.set_key(b"shared");
        acquire_blocking(&mut k);
        k.load(&[SHAPES[0].1; SHAPES[0].0]);
        k.release();
    }

    let writer = {
        let tab = Arc::clone(&tab);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let thr = tab.attach_ctx(1).unwrap();
            let mut k = KeyCtx::new(&thr, 0).unwrap();
            let mut round = 0_usize;
            while !stop.load(Ordering::Relaxed) {
                let (len, byte) = SHAPES[round % SHAPES.len()];
                k.set_key(b"shared");
                assert!(acquire_blocking(&mut k).is_success());
                assert_eq!(k.load(&vec![byte; len]), KvStatus::Ok);
                k.release();
                round += 1;
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|r| {
            let tab = Arc::clone(&tab);
            let reads = Arc::clone(&reads);
            thread::spawn(move || {
                let thr = tab.attach_ctx(10 + r).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                k.set_key(b"shared");
                let mut ok = 0;
                while ok < 5_000 {
                    match k.find() {
                        KvStatus::Ok => {
                            let v = k.value().unwrap();
                            let first = v[0];
                            assert!(
                                SHAPES.contains(&(v.len(), first)),
                                "unexpected shape ({}, {first:#x})",
                                v.len()
                            );
                            assert!(v.iter().all(|&b| b == first), "torn value");
                            ok += 1;
                        }
                        KvStatus::Mutated | KvStatus::Busy => thread::yield_now(),
                        other => panic!("find returned {other:?}"),
                    }
                }
                reads.fetch_add(ok, Ordering::Relaxed);
            })
        })
        .collect();

    for r in readers {
        r.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
    assert_eq!(reads.load(Ordering::Relaxed), 15_000);
}

#[test]
fn readers_never_miss_keys_moved_by_cuckoo_relocation() {
    const RESIDENTS: u64 = 400;
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 300;

    let tab = map("map_size=4m,arity=2,buckets=2,ht_cells=2560");
    {
        let thr = tab.attach_ctx(0).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        for i in 0..RESIDENTS {
            k.set_key(format!("resident-{i}").as_bytes());
            assert_eq!(acquire_blocking(&mut k), KvStatus::IsNew);
            assert_eq!(k.load(&i.to_le_bytes()), KvStatus::Ok);
            k.release();
        }
    }
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3_u64)
        .map(|r| {
            let tab = Arc::clone(&tab);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let thr = tab.attach_ctx(20 + r).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                let mut lookups = 0_u64;
                loop {
                    let i = (lookups * 7 + r) % RESIDENTS;
                    k.set_key(format!("resident-{i}").as_bytes());
                    let value = find_settled(&mut k);
                    assert_eq!(value, Some(i.to_le_bytes().to_vec()), "resident {i}");
                    lookups += 1;
                    if stop.load(Ordering::Relaxed) {
                        return lookups;
                    }
                }
            })
        })
        .collect();

    let writers: Vec<_> = (1..=WRITERS)
        .map(|t| {
            let tab = Arc::clone(&tab);
            thread::spawn(move || {
                let thr = tab.attach_ctx(t).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                for i in 0..PER_WRITER {
                    k.set_key(format!("w{t}-{i}").as_bytes());
                    assert_eq!(acquire_blocking(&mut k), KvStatus::IsNew, "w{t}-{i}");
                    assert_eq!(k.load(&(t * 10_000 + i).to_le_bytes()), KvStatus::Ok);
                    k.release();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        assert!(r.join().unwrap() > 0);
    }

    let totals = tab.totals();
    assert!(totals.cuckmov > 0, "no relocation happened");
    assert_eq!(totals.elements(), RESIDENTS + WRITERS * PER_WRITER);
    let (begin, end) = tab.move_counters();
    assert_eq!(begin, end);

    let thr = tab.attach_ctx(99).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    for t in 1..=WRITERS {
        for i in 0..PER_WRITER {
            k.set_key(format!("w{t}-{i}").as_bytes());
            assert_eq!(find_settled(&mut k), Some((t * 10_000 + i).to_le_bytes().to_vec()));
        }
    }
}

// ===========================================================================
// Collection
// ===========================================================================

#[test]
fn collector_runs_alongside_writers_and_readers() {
    const WRITERS: u64 = 2;
    const KEYS: u64 = 16;
    const ROUNDS: u64 = 600;

    fn value(round: u64) -> Vec<u8> {
        vec![round as u8; 200 + (round as usize * 37) % 700]
    }

    let tab = map("map_size=8m,max_value_size=1k");
    {
        let thr = tab.attach_ctx(0).unwrap();
        let mut k = KeyCtx::new(&thr, 0).unwrap();
        for t in 0..WRITERS {
            for i in 0..KEYS {
                k.set_key(format!("gc{t}-{i}").as_bytes());
                acquire_blocking(&mut k);
                assert_eq!(k.load(&value(0)), KvStatus::Ok);
                k.release();
            }
        }
    }
    let stop = Arc::new(AtomicBool::new(false));

    let collector = {
        let tab = Arc::clone(&tab);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let thr = tab.attach_ctx(30).unwrap();
            let mut passes = 0_u64;
            loop {
                for seg in 0..tab.geom().seg_count as usize {
                    tab.gc_segment(&thr, seg);
                }
                passes += 1;
                if stop.load(Ordering::Relaxed) {
                    return passes;
                }
            }
        })
    };

    let readers: Vec<_> = (0..2_u64)
        .map(|r| {
            let tab = Arc::clone(&tab);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let thr = tab.attach_ctx(40 + r).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                let mut n = 0_u64;
                while !stop.load(Ordering::Relaxed) {
                    k.set_key(format!("gc{}-{}", n % WRITERS, n % KEYS).as_bytes());
                    let v = find_settled(&mut k).expect("key vanished");
                    let fill = v[0];
                    assert!(v.iter().all(|&b| b == fill), "torn value");
                    assert!(v.len() >= 200);
                    n += 1;
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let tab = Arc::clone(&tab);
            thread::spawn(move || {
                let thr = tab.attach_ctx(1 + t).unwrap();
                let mut k = KeyCtx::new(&thr, 0).unwrap();
                let mut last = vec![0_u64; KEYS as usize];
                for round in 1..=ROUNDS {
                    let i = round % KEYS;
                    k.set_key(format!("gc{t}-{i}").as_bytes());
                    loop {
                        assert_eq!(acquire_blocking(&mut k), KvStatus::Ok);
                        match k.load(&value(round)) {
                            KvStatus::Ok => break,
                            KvStatus::AllocFailed => {
                                k.release();
                                thread::yield_now();
                            }
                            other => panic!("load returned {other:?}"),
                        }
                    }
                    k.release();
                    last[i as usize] = round;
                }
                last
            })
        })
        .collect();
    let last: Vec<Vec<u64>> = writers.into_iter().map(|w| w.join().unwrap()).collect();
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
    assert!(collector.join().unwrap() > 0);

    let thr = tab.attach_ctx(99).unwrap();
    for seg in 0..tab.geom().seg_count as usize {
        tab.gc_segment(&thr, seg);
    }
    let seg_size = tab.geom().seg_size;
    for seg in tab.stats().segments {
        let live: u64 = tab
            .segment_messages(usize::from(seg.seg))
            .iter()
            .filter(|(_, h)| !h.is_zombie())
            .map(|(_, h)| u64::from(h.size))
            .sum();
        assert_eq!(seg.avail + live, seg_size, "segment {}", seg.seg);
    }
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    for (t, rounds) in last.iter().enumerate() {
        for (i, &round) in rounds.iter().enumerate() {
            k.set_key(format!("gc{t}-{i}").as_bytes());
            assert_eq!(find_settled(&mut k), Some(value(round)), "gc{t}-{i}");
        }
    }
}

// ===========================================================================
// Recovery
// ===========================================================================

#[test]
fn thread_dying_with_a_held_cell_is_recovered() {
    let tab = map("map_size=2m");
    let (dead_id, pos) = {
        let tab = Arc::clone(&tab);
        thread::spawn(move || {
            let thr = tab.attach_ctx(42).unwrap();
            let id = thr.id();
            let mut k = KeyCtx::new(&thr, 0).unwrap();
            k.set_key(b"abandoned");
            assert_eq!(k.acquire(), KvStatus::IsNew);
            k.load(&[7; 500]);
            let pos = k.pos().unwrap();
            mem::forget(k);
            mem::forget(thr);
            (id, pos)
        })
        .join()
        .unwrap()
    };
    assert!(matches!(tab.cell_state(pos), CellState::Locked { .. }));

    tab.mark_dead(dead_id).unwrap();
    assert_eq!(tab.stats().contexts_dead, 1);
    let report = tab.recover_context(dead_id).unwrap();
    assert!(report.complete());
    assert_eq!(report.locks_recovered, 1);
    assert_eq!(tab.context_info(dead_id).state, CtxState::Free);
    assert!(tab.cell_state(pos).is_free());

    let thr = tab.attach_ctx(43).unwrap();
    let mut k = KeyCtx::new(&thr, 0).unwrap();
    k.set_key(b"abandoned");
    assert_eq!(k.find(), KvStatus::NotFound);
    assert_eq!(k.acquire(), KvStatus::IsNew);
    assert_eq!(k.load(b"fresh"), KvStatus::Ok);
    k.release();
    assert_eq!(k.find(), KvStatus::Ok);
    assert_eq!(k.value().unwrap(), b"fresh");

    // The value the dead context allocated is an orphan until a pass
    // reclaims it.
    for seg in 0..tab.geom().seg_count as usize {
        tab.gc_segment(&thr, seg);
    }
    let live: u64 = (0..tab.geom().seg_count as usize)
        .flat_map(|seg| tab.segment_messages(seg))
        .filter(|(_, h)| !h.is_zombie())
        .map(|(_, h)| u64::from(h.size))
        .sum();
    assert_eq!(live, 0);
}
