//! kombu-lsm: sharded, multi-column-family LSM engine core.
//!
//! The engine owns a map of shards. Each shard carries one L0 pool
//! shared across column families and, per CF, a fixed hierarchy of
//! sorted levels. Background compaction continually reshapes the sorted
//! runs to bound read amplification and discard obsolete MVCC versions
//! under the snapshot-isolation watermark (`safe_ts`).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Engine                                                     │
//! │  shard map ── Shard ── L0 pool (newest first, overlapping)  │
//! │                  │                                          │
//! │                  └── per CF: L1..L4 (sorted, disjoint)      │
//! │                                                             │
//! │  planner ─► job builder ─► executor ─► change-set applier   │
//! │  (scores)   (fill_tables)  (merge+GC)  (manifest, CAS swap) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes enter through [`Engine::ingest_l0`] (the mem-table path lives
//! upstream); reads take snapshot pointers and never block on
//! compaction. All background work stops cleanly on [`Engine::close`].

pub mod changeset;
pub mod closer;
pub mod compaction;
pub mod config;
pub mod epoch;
pub mod error;
pub mod l0;
pub mod levels;
pub mod manifest;
pub mod shard;

pub use changeset::{ChangeSet, Compaction, Flush, L0Create, SplitFiles, TableCreate};
pub use closer::Closer;
pub use compaction::{CompactDef, CompactionPriority, CompactionStats, DiscardStats};
pub use config::{
    BlobStore, CfConfig, CompactionFilter, CompactionFilterFactory, Decision, Hooks, IdAllocator,
    LocalIdAllocator, MetaChangeListener, Options, TableBuilderOptions,
};
pub use error::{Error, Result};
pub use shard::{Shard, SplitState, SHARD_MAX_LEVEL};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use kombu_table::{Entry, RateLimiter};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::config::blob_key;
use crate::epoch::ResourceManager;
use crate::l0::L0Table;
use crate::manifest::Manifest;

/// Handle to an open engine. Clones share the same underlying instance;
/// background workers hold clones for their lifetime.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) opts: Options,
    pub(crate) num_cfs: usize,
    pub(crate) shards: RwLock<HashMap<u64, Arc<Shard>>>,
    pub(crate) manifest: Manifest,
    pub(crate) resource_mgr: Arc<ResourceManager>,
    pub(crate) id_alloc: Arc<dyn IdAllocator>,
    pub(crate) compaction_filter_factory: Option<CompactionFilterFactory>,
    pub(crate) meta_change_listener: Option<Arc<dyn MetaChangeListener>>,
    pub(crate) blob_store: Option<Arc<dyn BlobStore>>,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
    pub(crate) managed_safe_ts: AtomicU64,
    pub(crate) tracked_safe_ts: AtomicU64,
    pub(crate) closer: Closer,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Opens an engine in `opts.dir` and, unless `do_not_compact` is
    /// set, starts the background compaction driver.
    pub fn open(opts: Options, hooks: Hooks) -> Result<Engine> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)?;
        let manifest = Manifest::open(&opts.dir)?;

        let id_alloc = hooks
            .id_allocator
            .unwrap_or_else(|| Arc::new(LocalIdAllocator::new(manifest.last_id())));
        let limiter = match opts.table_builder_options.bytes_per_second {
            bps if bps > 0 => Some(Arc::new(RateLimiter::new(bps))),
            _ => None,
        };

        let engine = Engine {
            inner: Arc::new(EngineInner {
                num_cfs: opts.cfs.len(),
                manifest,
                resource_mgr: ResourceManager::new(),
                id_alloc,
                compaction_filter_factory: hooks.compaction_filter_factory,
                meta_change_listener: hooks.meta_change_listener,
                blob_store: hooks.blob_store,
                limiter,
                managed_safe_ts: AtomicU64::new(0),
                tracked_safe_ts: AtomicU64::new(0),
                closer: Closer::new(),
                handles: Mutex::new(Vec::new()),
                shards: RwLock::new(HashMap::new()),
                opts,
            }),
        };

        if !engine.inner.opts.do_not_compact {
            let worker = engine.clone();
            let handle = std::thread::Builder::new()
                .name("kombu-compaction".to_string())
                .spawn(move || worker.run_compaction_loop())?;
            engine.inner.handles.lock().push(handle);
        }
        info!(dir = %engine.inner.opts.dir.display(), "engine opened");
        Ok(engine)
    }

    /// Signals shutdown and joins the background workers. In-flight
    /// jobs finish; aborting one mid-merge costs more than completion.
    pub fn close(&self) {
        self.inner.closer.close();
        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        info!("engine closed");
    }

    pub fn num_cfs(&self) -> usize {
        self.inner.num_cfs
    }

    pub fn opts(&self) -> &Options {
        &self.inner.opts
    }

    /// Registers a new shard. The caller (cluster layer) owns id and
    /// version assignment.
    pub fn install_shard(&self, id: u64, ver: u64) -> Arc<Shard> {
        let shard = Arc::new(Shard::new(id, ver, self.inner.num_cfs));
        self.inner.shards.write().insert(id, shard.clone());
        shard
    }

    pub fn get_shard(&self, id: u64) -> Option<Arc<Shard>> {
        self.inner.shards.read().get(&id).cloned()
    }

    /// Drops a shard; its files are reclaimed after current readers
    /// drain when `remove_files` is set.
    pub fn remove_shard(&self, id: u64, remove_files: bool) -> Result<()> {
        let shard = self
            .inner
            .shards
            .write()
            .remove(&id)
            .ok_or(Error::ShardNotFound(id))?;
        let mut cs = ChangeSet::new(&shard);
        cs.shard_delete = true;
        self.inner.manifest.write_change_set(&cs)?;
        if remove_files {
            let guard = self.inner.resource_mgr.acquire();
            let mut resources: Vec<Box<dyn epoch::Reclaimable>> = Vec::new();
            for l0 in &shard.load_l0s().tables {
                resources.push(Box::new(l0.clone()));
            }
            for cf in 0..self.inner.num_cfs {
                for level in 1..=SHARD_MAX_LEVEL {
                    for table in &shard.cf(cf).level(level).tables {
                        resources.push(Box::new(table.clone()));
                    }
                }
            }
            guard.delete(resources);
        }
        info!(shard = id, "shard removed");
        Ok(())
    }

    /// Total estimated on-disk size across shards.
    pub fn size(&self) -> i64 {
        self.inner
            .shards
            .read()
            .values()
            .map(|s| s.estimated_size())
            .sum()
    }

    /// Ingests one flushed mem-table image as an L0 table: writes the
    /// file, then routes the flush change set through the listener or
    /// the local applier. `cf_entries[cf]` must be sorted.
    pub fn ingest_l0(
        &self,
        shard_id: u64,
        cf_entries: Vec<Vec<Entry>>,
        commit_ts: u64,
    ) -> Result<()> {
        let shard = self
            .get_shard(shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        if cf_entries.iter().all(|entries| entries.is_empty()) {
            return Ok(());
        }
        if cf_entries.len() != self.inner.num_cfs {
            return Err(Error::Config(format!(
                "expected {} CFs, got {}",
                self.inner.num_cfs,
                cf_entries.len()
            )));
        }
        let id = self.inner.id_alloc.alloc_id();
        let path = kombu_table::new_filename(id, &self.inner.opts.dir);
        L0Table::build(&path, commit_ts, &cf_entries)?;
        let table = L0Table::open(&path)?;
        let (smallest, biggest) = table
            .bounds()
            .ok_or_else(|| Error::Config("L0 table with no records".to_string()))?;
        if let Some(store) = &self.inner.blob_store {
            store.put(&blob_key(id), &std::fs::read(&path)?)?;
        }

        let mut cs = ChangeSet::new(&shard);
        cs.flush = Some(Flush {
            l0_create: Some(L0Create {
                id,
                smallest,
                biggest,
            }),
        });
        if let Some(listener) = &self.inner.meta_change_listener {
            listener.on_change(cs);
            return Ok(());
        }
        self.apply_flush(&shard, &cs)
    }

    /// Per-key read at `version` (0 means latest). Walks the L0 pool
    /// newest first, then one candidate table per sorted level; the
    /// first version at or below `version` wins. Tombstones read as
    /// absent.
    pub fn get(
        &self,
        shard_id: u64,
        cf: usize,
        user_key: &[u8],
        version: u64,
    ) -> Result<Option<Entry>> {
        let shard = self
            .get_shard(shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        let version = if version == 0 { u64::MAX } else { version };
        let _guard = self.inner.resource_mgr.acquire();

        let l0s = shard.load_l0s();
        for l0 in &l0s.tables {
            if let Some(entry) = l0.get(cf, user_key, version) {
                return Ok(visible(entry));
            }
        }
        let scf = shard.cf(cf);
        for level in 1..=SHARD_MAX_LEVEL {
            let handler = scf.level(level);
            if handler.tables.is_empty() {
                continue;
            }
            if let Some(entry) = handler.get(user_key, version) {
                return Ok(visible(entry));
            }
        }
        Ok(None)
    }

    /// Like [`Engine::get`] but keeps tombstones visible; used by tests
    /// and by layers that need to distinguish deleted from absent.
    pub fn get_raw(
        &self,
        shard_id: u64,
        cf: usize,
        user_key: &[u8],
        version: u64,
    ) -> Result<Option<Entry>> {
        let shard = self
            .get_shard(shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        let version = if version == 0 { u64::MAX } else { version };
        let l0s = shard.load_l0s();
        for l0 in &l0s.tables {
            if let Some(entry) = l0.get(cf, user_key, version) {
                return Ok(Some(entry));
            }
        }
        let scf = shard.cf(cf);
        for level in 1..=SHARD_MAX_LEVEL {
            let handler = scf.level(level);
            if let Some(entry) = handler.get(user_key, version) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Returns user keys suggesting roughly equal-size split points;
    /// consumed by the cluster layer.
    pub fn get_split_suggestion(&self, shard_id: u64, split_size: i64) -> Result<Vec<Bytes>> {
        let shard = self
            .get_shard(shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        let mut keys = Vec::new();
        if split_size <= 0 {
            return Ok(keys);
        }
        // The deepest populated level approximates the key distribution.
        for cf in 0..self.inner.num_cfs {
            for level in (1..=SHARD_MAX_LEVEL).rev() {
                let handler = shard.cf(cf).level(level);
                if handler.tables.is_empty() {
                    continue;
                }
                let mut acc = 0i64;
                for table in &handler.tables {
                    acc += table.size();
                    if acc >= split_size {
                        keys.push(table.biggest().user_key.clone());
                        acc = 0;
                    }
                }
                return Ok(keys);
            }
        }
        Ok(keys)
    }
}

fn visible(entry: Entry) -> Option<Entry> {
    if entry.value.is_deleted() {
        None
    } else {
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kombu_table::{Key, ValueStruct};

    fn test_options(dir: &std::path::Path) -> Options {
        Options {
            dir: dir.to_path_buf(),
            do_not_compact: true,
            ..Default::default()
        }
    }

    fn entry(key: &str, ver: u64, val: &str) -> Entry {
        Entry::new(
            Key::new(Bytes::copy_from_slice(key.as_bytes()), ver),
            ValueStruct::new(val.to_string(), ver),
        )
    }

    #[test]
    fn test_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path()), Hooks::default()).unwrap();
        engine.close();
    }

    #[test]
    fn test_ingest_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path()), Hooks::default()).unwrap();
        engine.install_shard(1, 1);

        engine
            .ingest_l0(1, vec![vec![entry("k1", 10, "v1")], vec![], vec![]], 10)
            .unwrap();
        engine
            .ingest_l0(1, vec![vec![entry("k1", 20, "v2")], vec![], vec![]], 20)
            .unwrap();

        // Latest wins; versioned reads see history.
        let latest = engine.get(1, 0, b"k1", 0).unwrap().unwrap();
        assert_eq!(latest.value.value.as_ref(), b"v2");
        let old = engine.get(1, 0, b"k1", 15).unwrap().unwrap();
        assert_eq!(old.value.value.as_ref(), b"v1");
        assert!(engine.get(1, 0, b"missing", 0).unwrap().is_none());
        assert!(engine.get(1, 1, b"k1", 0).unwrap().is_none());
    }

    #[test]
    fn test_get_reads_tombstone_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path()), Hooks::default()).unwrap();
        engine.install_shard(1, 1);

        engine
            .ingest_l0(1, vec![vec![entry("k", 10, "v")], vec![], vec![]], 10)
            .unwrap();
        let del = Entry::new(Key::new(&b"k"[..], 20), ValueStruct::tombstone(20));
        engine.ingest_l0(1, vec![vec![del], vec![], vec![]], 20).unwrap();

        assert!(engine.get(1, 0, b"k", 0).unwrap().is_none());
        assert!(engine.get_raw(1, 0, b"k", 0).unwrap().unwrap().value.is_deleted());
        // Below the tombstone the old version is still visible.
        assert!(engine.get(1, 0, b"k", 15).unwrap().is_some());
    }

    #[test]
    fn test_ingest_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path()), Hooks::default()).unwrap();
        engine.install_shard(1, 1);
        engine.ingest_l0(1, vec![vec![], vec![], vec![]], 5).unwrap();
        assert!(engine.get_shard(1).unwrap().load_l0s().tables.is_empty());
    }

    #[test]
    fn test_remove_shard() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path()), Hooks::default()).unwrap();
        engine.install_shard(1, 1);
        engine
            .ingest_l0(1, vec![vec![entry("k", 1, "v")], vec![], vec![]], 1)
            .unwrap();
        engine.remove_shard(1, true).unwrap();
        assert!(engine.get_shard(1).is_none());
        assert!(matches!(
            engine.get(1, 0, b"k", 0),
            Err(Error::ShardNotFound(1))
        ));
    }

    #[test]
    fn test_safe_ts_watermarks_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path()), Hooks::default()).unwrap();
        engine.update_managed_safe_ts(10);
        engine.update_managed_safe_ts(5);
        // cfs[0] is managed, cfs[1] is not.
        assert_eq!(engine.get_cf_safe_ts(0), 10);
        engine.update_tracked_safe_ts(7);
        assert_eq!(engine.get_cf_safe_ts(1), 7);
    }
}
