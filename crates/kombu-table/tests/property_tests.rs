use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use kombu_table::{new_filename, Key, KvIterator, MergeIterator, Table, TableBuilder, ValueStruct};
use proptest::prelude::*;
use tempfile::TempDir;

fn arb_user_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..24)
}

fn arb_records() -> impl Strategy<Value = Vec<(Vec<u8>, u64, Vec<u8>)>> {
    prop::collection::vec((arb_user_key(), 1u64..1000, prop::collection::vec(any::<u8>(), 0..64)), 1..60)
}

fn build_table(dir: &Path, id: u64, records: &[(Vec<u8>, u64, Vec<u8>)]) -> Table {
    let path = new_filename(id, dir);
    let mut builder = TableBuilder::new(&path, None).unwrap();
    for (k, ver, v) in records {
        builder
            .add(
                &Key::new(Bytes::from(k.clone()), *ver),
                &ValueStruct::new(Bytes::from(v.clone()), *ver),
            )
            .unwrap();
    }
    builder.finish().unwrap();
    Table::open(&path).unwrap()
}

/// Deduplicates and sorts raw records into table order.
fn normalize(mut records: Vec<(Vec<u8>, u64, Vec<u8>)>) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
    records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
    records.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
    records
}

proptest! {
    #[test]
    fn prop_build_read_roundtrip(records in arb_records()) {
        let records = normalize(records);
        let dir = TempDir::new().unwrap();
        let table = build_table(dir.path(), 1, &records);

        prop_assert_eq!(table.len(), records.len());

        let mut it = table.iter(false);
        for (k, ver, v) in &records {
            prop_assert!(it.valid());
            prop_assert_eq!(it.key().user_key.as_ref(), &k[..]);
            prop_assert_eq!(it.key().version, *ver);
            prop_assert_eq!(it.value().value.as_ref(), &v[..]);
            it.next();
        }
        prop_assert!(!it.valid());
    }

    #[test]
    fn prop_get_returns_newest_at_or_below_read_version(records in arb_records(), read_ver in 1u64..1000) {
        let records = normalize(records);
        let dir = TempDir::new().unwrap();
        let table = build_table(dir.path(), 1, &records);

        // Model: newest version <= read_ver per user key.
        let mut model: BTreeMap<&[u8], u64> = BTreeMap::new();
        for (k, ver, _) in &records {
            if *ver <= read_ver {
                let e = model.entry(k.as_slice()).or_insert(*ver);
                if *ver > *e {
                    *e = *ver;
                }
            }
        }

        for (k, _, _) in &records {
            let got = table.get(k, read_ver);
            match model.get(k.as_slice()) {
                Some(expect_ver) => {
                    let entry = got.unwrap();
                    prop_assert_eq!(entry.key.version, *expect_ver);
                }
                None => prop_assert!(got.is_none()),
            }
        }
    }

    #[test]
    fn prop_merge_matches_model(a in arb_records(), b in arb_records()) {
        let a = normalize(a);
        let b = normalize(b);
        let dir = TempDir::new().unwrap();
        let ta = build_table(dir.path(), 1, &a);
        let tb = build_table(dir.path(), 2, &b);

        // Model: source `a` shadows `b` on full-key collisions.
        let mut model: BTreeMap<(Vec<u8>, std::cmp::Reverse<u64>), Vec<u8>> = BTreeMap::new();
        for (k, ver, v) in b.iter().chain(a.iter()) {
            model.insert((k.clone(), std::cmp::Reverse(*ver)), v.clone());
        }

        let mut it = MergeIterator::new(
            vec![Box::new(ta.iter(false)), Box::new(tb.iter(false))],
            false,
        );
        for ((k, std::cmp::Reverse(ver)), v) in &model {
            prop_assert!(it.valid());
            prop_assert_eq!(it.key().user_key.as_ref(), &k[..]);
            prop_assert_eq!(it.key().version, *ver);
            prop_assert_eq!(it.value().value.as_ref(), &v[..]);
            it.next();
        }
        prop_assert!(!it.valid());
    }
}
