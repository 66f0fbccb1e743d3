//! Property tests over the level hierarchy: random multi-version
//! workloads are pushed through L0 conversion and level compactions,
//! then the structural and MVCC invariants are checked against a model.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use kombu_lsm::{CompactionPriority, Engine, Hooks, Options, SHARD_MAX_LEVEL};
use kombu_table::{Entry, Key, ValueStruct};
use proptest::prelude::*;

fn open_engine(dir: &Path) -> Engine {
    let opts = Options {
        dir: dir.to_path_buf(),
        do_not_compact: true,
        ..Default::default()
    };
    Engine::open(opts, Hooks::default()).unwrap()
}

fn entry(key: &str, ver: u64) -> Entry {
    Entry::new(
        Key::new(Bytes::copy_from_slice(key.as_bytes()), ver),
        ValueStruct::new(format!("value-{key}-{ver}"), ver),
    )
}

/// Workload: (key index, version) pairs with globally unique versions,
/// scattered over three L0 batches.
fn arb_workload() -> impl Strategy<Value = Vec<(u8, u64, u8)>> {
    prop::collection::vec((0u8..8, 0u8..3), 1..60).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (key, batch))| (key, (i as u64 + 1) * 3, batch))
            .collect()
    })
}

fn key_name(idx: u8) -> String {
    format!("key-{:02}", idx)
}

/// Candidate tables a point lookup for `key` may touch.
fn probe_count(engine: &Engine, shard_id: u64, cf: usize, key: &[u8]) -> usize {
    let shard = engine.get_shard(shard_id).unwrap();
    let mut count = shard.load_l0s().tables.len();
    for level in 1..=SHARD_MAX_LEVEL {
        let handler = shard.cf(cf).level(level);
        count += handler
            .tables
            .iter()
            .filter(|t| {
                t.smallest().user_key.as_ref() <= key && key <= t.biggest().user_key.as_ref()
            })
            .count();
    }
    count
}

fn assert_levels_sorted_and_disjoint(engine: &Engine, shard_id: u64, cf: usize) {
    let shard = engine.get_shard(shard_id).unwrap();
    for level in 1..=SHARD_MAX_LEVEL {
        let handler = shard.cf(cf).level(level);
        for pair in handler.tables.windows(2) {
            assert!(
                pair[0].biggest().user_key < pair[1].smallest().user_key,
                "level {} user-key ranges overlap or are unsorted",
                level
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_compaction_preserves_mvcc_invariants(
        workload in arb_workload(),
        safe_ts in 0u64..200,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());
        let shard = engine.install_shard(1, 1);
        engine.update_managed_safe_ts(safe_ts);
        engine.update_tracked_safe_ts(safe_ts);

        // Model: key -> sorted versions.
        let mut model: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut batches: Vec<Vec<Entry>> = vec![Vec::new(), Vec::new(), Vec::new()];
        for (key_idx, version, batch) in &workload {
            let name = key_name(*key_idx);
            model.entry(name.clone()).or_default().push(*version);
            batches[*batch as usize].push(entry(&name, *version));
        }
        for versions in model.values_mut() {
            versions.sort_unstable();
        }
        for (i, mut batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            batch.sort_by(|a, b| a.key.cmp(&b.key));
            engine
                .ingest_l0(1, vec![batch, Vec::new(), Vec::new()], i as u64 + 1)
                .unwrap();
        }

        let probe_before: Vec<usize> = model
            .keys()
            .map(|k| probe_count(&engine, 1, 0, k.as_bytes()))
            .collect();

        // L0 -> L1, then walk the job down the levels.
        if !shard.load_l0s().tables.is_empty() {
            engine
                .compact_shard(CompactionPriority {
                    cf: -1,
                    level: 0,
                    score: 2.0,
                    shard: shard.clone(),
                })
                .unwrap();
        }
        for level in 1..SHARD_MAX_LEVEL {
            if shard.cf(0).level(level).tables.is_empty() {
                continue;
            }
            engine
                .compact_shard(CompactionPriority {
                    cf: 0,
                    level,
                    score: 2.0,
                    shard: shard.clone(),
                })
                .unwrap();
        }

        // Structural invariants.
        prop_assert!(shard.load_l0s().tables.is_empty());
        assert_levels_sorted_and_disjoint(&engine, 1, 0);

        // Read amplification never grows at any key.
        for (k, before) in model.keys().zip(probe_before) {
            prop_assert!(probe_count(&engine, 1, 0, k.as_bytes()) <= before.max(1));
        }

        for (k, versions) in &model {
            // MVCC preservation: every version above safe_ts survives.
            for &v in versions.iter().filter(|&&v| v > safe_ts) {
                let got = engine.get_raw(1, 0, k.as_bytes(), v).unwrap();
                prop_assert_eq!(got.map(|e| e.key.version), Some(v));
            }
            // GC soundness: of the versions at or below safe_ts, exactly
            // the newest survives.
            let below: Vec<u64> = versions.iter().copied().filter(|&v| v <= safe_ts).collect();
            if let Some(&newest_below) = below.last() {
                let got = engine.get_raw(1, 0, k.as_bytes(), newest_below).unwrap();
                prop_assert_eq!(got.map(|e| e.key.version), Some(newest_below));
                for &older in below.iter().rev().skip(1) {
                    let got = engine.get_raw(1, 0, k.as_bytes(), older).unwrap();
                    prop_assert_eq!(got, None);
                }
            }
        }
        engine.close();
    }
}

/// The background driver compacts an over-full L0 pool on its own.
#[test]
fn background_loop_drains_l0() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let opts = Options {
        dir: dir.path().to_path_buf(),
        num_level_zero_tables: 1,
        level_one_size: 512,
        num_compactors: 2,
        ..Default::default()
    };
    let engine = Engine::open(opts, Hooks::default()).unwrap();
    let shard = engine.install_shard(1, 1);
    engine.update_managed_safe_ts(100);
    engine.update_tracked_safe_ts(100);

    for i in 0..4u64 {
        let batch: Vec<Entry> = (0..8)
            .map(|j| entry(&format!("key-{:02}", j), i * 10 + j + 1))
            .collect();
        engine
            .ingest_l0(1, vec![batch, Vec::new(), Vec::new()], i + 1)
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while !shard.load_l0s().tables.is_empty() {
        assert!(Instant::now() < deadline, "background compaction never ran");
        std::thread::sleep(Duration::from_millis(20));
    }
    // The newest version of each key is still readable.
    for j in 0..8u64 {
        let key = format!("key-{:02}", j);
        let got = engine.get(1, 0, key.as_bytes(), 0).unwrap().unwrap();
        assert_eq!(got.key.version, 30 + j + 1);
    }
    engine.close();
}
