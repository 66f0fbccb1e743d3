//! Manifest log.
//!
//! Append-only log of serialized change sets, one JSON record per line.
//! The applier durably writes the manifest record *before* swapping any
//! level snapshot, so a table file can never become externally
//! observable without its manifest entry.
//!
//! The log also carries the duplicate-application check: a change set
//! whose `(shard, seq)` was already recorded yields [`Error::DupChange`],
//! which callers treat as an idempotent no-op.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::changeset::ChangeSet;
use crate::error::{Error, Result};

pub const MANIFEST_FILENAME: &str = "MANIFEST";

pub struct Manifest {
    inner: Mutex<ManifestInner>,
}

struct ManifestInner {
    writer: BufWriter<File>,
    /// Applied change-set sequences per shard. Concurrent writers
    /// (flush vs compaction) may land out of order, so this is a set,
    /// not a high-water mark.
    applied: HashMap<u64, HashSet<u64>>,
    /// Largest file id referenced by any record, for seeding the id
    /// allocator after a restart.
    last_id: u64,
}

impl Manifest {
    /// Opens the manifest under `dir`, replaying any existing log to
    /// rebuild the duplicate-detection state.
    pub fn open(dir: &Path) -> Result<Manifest> {
        let path = dir.join(MANIFEST_FILENAME);
        let mut applied: HashMap<u64, HashSet<u64>> = HashMap::new();
        let mut last_id = 0u64;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let cs: ChangeSet = serde_json::from_str(&line)
                    .map_err(|e| Error::Manifest(format!("corrupt manifest record: {e}")))?;
                applied.entry(cs.shard_id).or_default().insert(cs.seq);
                last_id = last_id.max(max_file_id(&cs));
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Manifest {
            inner: Mutex::new(ManifestInner {
                writer: BufWriter::new(file),
                applied,
                last_id,
            }),
        })
    }

    /// Appends `cs`, fsyncing before returning. Returns
    /// [`Error::DupChange`] when the record was already applied.
    pub fn write_change_set(&self, cs: &ChangeSet) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .applied
            .get(&cs.shard_id)
            .is_some_and(|seqs| seqs.contains(&cs.seq))
        {
            return Err(Error::DupChange);
        }
        let line = serde_json::to_string(cs)
            .map_err(|e| Error::Manifest(format!("encode change set: {e}")))?;
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.write_all(b"\n")?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.applied.entry(cs.shard_id).or_default().insert(cs.seq);
        let id = max_file_id(cs);
        if id > inner.last_id {
            inner.last_id = id;
        }
        Ok(())
    }

    /// Highest applied change-set sequence for `shard_id`.
    pub fn applied_seq(&self, shard_id: u64) -> u64 {
        self.inner
            .lock()
            .applied
            .get(&shard_id)
            .and_then(|seqs| seqs.iter().max().copied())
            .unwrap_or(0)
    }

    pub fn last_id(&self) -> u64 {
        self.inner.lock().last_id
    }
}

fn max_file_id(cs: &ChangeSet) -> u64 {
    let mut id = 0u64;
    if let Some(flush) = &cs.flush {
        if let Some(l0) = &flush.l0_create {
            id = id.max(l0.id);
        }
    }
    if let Some(comp) = &cs.compaction {
        for create in &comp.table_creates {
            id = id.max(create.id);
        }
    }
    if let Some(split) = &cs.split_files {
        for l0 in &split.l0_creates {
            id = id.max(l0.id);
        }
        for create in &split.table_creates {
            id = id.max(create.id);
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{Compaction, TableCreate};
    use crate::shard::SplitState;
    use bytes::Bytes;

    fn change_set(shard_id: u64, seq: u64, create_id: u64) -> ChangeSet {
        ChangeSet {
            shard_id,
            shard_ver: 1,
            seq,
            state: SplitState::Initial,
            flush: None,
            compaction: Some(Compaction {
                cf: 0,
                level: 1,
                top_deletes: vec![],
                bottom_deletes: vec![],
                table_creates: vec![TableCreate {
                    id: create_id,
                    cf: 0,
                    level: 2,
                    smallest: Bytes::from_static(b"a"),
                    biggest: Bytes::from_static(b"z"),
                }],
            }),
            split_files: None,
            shard_delete: false,
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::open(dir.path()).unwrap();
        manifest.write_change_set(&change_set(1, 1, 10)).unwrap();
        assert!(matches!(
            manifest.write_change_set(&change_set(1, 1, 10)),
            Err(Error::DupChange)
        ));
        // Other shards have independent sequences.
        manifest.write_change_set(&change_set(2, 1, 11)).unwrap();
        manifest.write_change_set(&change_set(1, 2, 12)).unwrap();
    }

    #[test]
    fn test_replay_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manifest = Manifest::open(dir.path()).unwrap();
            manifest.write_change_set(&change_set(1, 1, 42)).unwrap();
            manifest.write_change_set(&change_set(1, 2, 7)).unwrap();
        }
        let manifest = Manifest::open(dir.path()).unwrap();
        assert_eq!(manifest.applied_seq(1), 2);
        assert_eq!(manifest.last_id(), 42);
        assert!(matches!(
            manifest.write_change_set(&change_set(1, 2, 7)),
            Err(Error::DupChange)
        ));
        manifest.write_change_set(&change_set(1, 3, 43)).unwrap();
    }
}
