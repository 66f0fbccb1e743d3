//! Change sets and their application.
//!
//! A [`ChangeSet`] is the atomic delta produced by a flush, a
//! compaction, or a split-files operation. Application is idempotent:
//! the manifest log rejects a change set whose sequence was already
//! recorded, and replaying one is a no-op.
//!
//! When a meta-change listener is configured the engine does not
//! install results locally; it emits the change set and waits for the
//! external sequencer to feed it back through
//! [`Engine::apply_change_set`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::blob_key;
use crate::epoch::{Guard, Reclaimable};
use crate::error::{Error, Result};
use crate::l0::{L0Table, L0Tables};
use crate::levels::{assert_tables_order, sort_tables, LevelHandler};
use crate::shard::{Shard, SplitState, SHARD_MAX_LEVEL};
use crate::Engine;
use kombu_table::{new_filename, Table};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub shard_id: u64,
    pub shard_ver: u64,
    /// Per-shard monotonically increasing sequence; the manifest uses it
    /// to detect duplicate application.
    pub seq: u64,
    pub state: SplitState,
    pub flush: Option<Flush>,
    pub compaction: Option<Compaction>,
    pub split_files: Option<SplitFiles>,
    pub shard_delete: bool,
}

impl ChangeSet {
    pub(crate) fn new(shard: &Shard) -> Self {
        Self {
            shard_id: shard.id,
            shard_ver: shard.ver,
            seq: shard.next_change_seq(),
            state: shard.split_state(),
            flush: None,
            compaction: None,
            split_files: None,
            shard_delete: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flush {
    pub l0_create: Option<L0Create>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L0Create {
    pub id: u64,
    pub smallest: Bytes,
    pub biggest: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compaction {
    /// Column family, or -1 for the multi-CF L0 -> L1 conversion.
    pub cf: i32,
    pub level: u32,
    pub top_deletes: Vec<u64>,
    pub bottom_deletes: Vec<u64>,
    pub table_creates: Vec<TableCreate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCreate {
    pub id: u64,
    pub cf: i32,
    pub level: u32,
    pub smallest: Bytes,
    pub biggest: Bytes,
}

impl TableCreate {
    pub(crate) fn from_table(table: &Table, cf: i32, level: u32) -> Self {
        Self {
            id: table.id(),
            cf,
            level,
            smallest: table.smallest().user_key.clone(),
            biggest: table.biggest().user_key.clone(),
        }
    }

    pub(crate) fn from_build_result(
        result: &kombu_table::BuildResult,
        cf: i32,
        level: u32,
    ) -> Self {
        Self {
            id: result.id,
            cf,
            level,
            smallest: result.smallest.user_key.clone(),
            biggest: result.biggest.user_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitFiles {
    pub l0_creates: Vec<L0Create>,
    pub table_creates: Vec<TableCreate>,
    pub table_deletes: Vec<u64>,
}

/// Resources retired by one change-set application, keyed by file id so
/// a move-down can pull its re-created tables back out.
pub(crate) struct Deletions {
    resources: HashMap<u64, Box<dyn Reclaimable>>,
}

impl Deletions {
    pub(crate) fn new() -> Self {
        Self {
            resources: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, id: u64, resource: Box<dyn Reclaimable>) {
        self.resources.insert(id, resource);
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.resources.remove(&id);
    }

    pub(crate) fn collect(self) -> Vec<Box<dyn Reclaimable>> {
        self.resources.into_values().collect()
    }
}

impl Engine {
    /// Applies a long-running shard file change: mem-table flush,
    /// compaction, or split-files. Duplicate change sets are no-ops.
    pub fn apply_change_set(&self, cs: ChangeSet) -> Result<()> {
        let guard = self.inner.resource_mgr.acquire();
        let shard = self
            .get_shard(cs.shard_id)
            .ok_or(Error::ShardNotFound(cs.shard_id))?;
        if shard.ver != cs.shard_ver {
            return Err(Error::ShardNotMatch {
                shard: cs.shard_id,
                expected: shard.ver,
                actual: cs.shard_ver,
            });
        }
        shard.observe_change_seq(cs.seq);
        if cs.flush.is_some() {
            return self.apply_flush(&shard, &cs);
        }
        if cs.compaction.is_some() {
            return self.apply_compaction(&shard, &cs, &guard);
        }
        if cs.split_files.is_some() {
            return self.apply_split_files(&shard, &cs, &guard);
        }
        Ok(())
    }

    pub(crate) fn apply_flush(&self, shard: &Arc<Shard>, cs: &ChangeSet) -> Result<()> {
        let flush = cs.flush.as_ref().ok_or_else(|| {
            Error::Manifest("flush change set without flush payload".to_string())
        })?;
        if let Some(l0) = &flush.l0_create {
            self.fetch_missing_files(&[l0.id])?;
        }
        match self.inner.manifest.write_change_set(cs) {
            Err(Error::DupChange) => return Ok(()),
            other => other?,
        }
        if let Some(l0) = &flush.l0_create {
            let path = new_filename(l0.id, &self.inner.opts.dir);
            let table = Arc::new(L0Table::open(&path)?);
            shard.atomic_add_l0(table);
        }
        shard.set_split_state(cs.state);
        Ok(())
    }

    pub(crate) fn apply_compaction(
        &self,
        shard: &Arc<Shard>,
        cs: &ChangeSet,
        guard: &Guard,
    ) -> Result<()> {
        let result = self.apply_compaction_inner(shard, cs, guard);
        // The job holding the shard ends here regardless of outcome,
        // including replays handed back by a meta-change listener.
        shard.mark_compacting(false);
        result
    }

    fn apply_compaction_inner(
        &self,
        shard: &Arc<Shard>,
        cs: &ChangeSet,
        guard: &Guard,
    ) -> Result<()> {
        let comp = cs.compaction.as_ref().ok_or_else(|| {
            Error::Manifest("compaction change set without payload".to_string())
        })?;
        let create_ids: Vec<u64> = comp.table_creates.iter().map(|t| t.id).collect();
        self.fetch_missing_files(&create_ids)?;
        match self.inner.manifest.write_change_set(cs) {
            Err(Error::DupChange) => return Ok(()),
            other => other?,
        }

        let mut del = Deletions::new();
        if comp.level == 0 {
            for cf in 0..self.inner.num_cfs {
                self.update_level_handler(
                    shard,
                    cf,
                    1,
                    &comp.table_creates,
                    &comp.bottom_deletes,
                    &mut del,
                )?;
            }
            let l0s = shard.load_l0s();
            let keep = l0s.tables.len().saturating_sub(comp.top_deletes.len());
            for l0 in &l0s.tables[keep..] {
                del.add(l0.id(), Box::new(l0.clone()));
            }
            let removed = shard.atomic_remove_l0(comp.top_deletes.len());
            shard.add_estimated_size(-removed);
        } else {
            self.update_level_handler(
                shard,
                comp.cf as usize,
                comp.level as usize,
                &[],
                &comp.top_deletes,
                &mut del,
            )?;
            // A move-down re-creates the top tables one level deeper; do
            // not reclaim their storage.
            for create in &comp.table_creates {
                del.remove(create.id);
            }
            self.update_level_handler(
                shard,
                comp.cf as usize,
                comp.level as usize + 1,
                &comp.table_creates,
                &comp.bottom_deletes,
                &mut del,
            )?;
        }
        guard.delete(del.collect());
        Ok(())
    }

    /// Rebuilds one level snapshot from `old - del_ids + creates` and
    /// publishes it.
    pub(crate) fn update_level_handler(
        &self,
        shard: &Arc<Shard>,
        cf: usize,
        level: usize,
        creates: &[TableCreate],
        del_ids: &[u64],
        del: &mut Deletions,
    ) -> Result<()> {
        let old = shard.cf(cf).level(level);
        let mut tables = Vec::with_capacity(old.tables.len() + creates.len());
        for create in creates {
            if create.cf as usize != cf {
                continue;
            }
            let path = new_filename(create.id, &self.inner.opts.dir);
            tables.push(Table::open(&path)?);
        }
        for old_tbl in &old.tables {
            if del_ids.contains(&old_tbl.id()) {
                del.add(old_tbl.id(), Box::new(old_tbl.clone()));
            } else {
                assert!(
                    !tables.iter().any(|t| t.id() == old_tbl.id()),
                    "duplicate table id {} at level {}",
                    old_tbl.id(),
                    level
                );
                tables.push(old_tbl.clone());
            }
        }
        sort_tables(&mut tables);
        assert_tables_order(level, &tables, None);
        let new_handler = LevelHandler::with_tables(level, tables);
        let size_change = new_handler.total_size - old.total_size;
        if !shard.cf(cf).cas_level(&old, new_handler) {
            return Err(Error::Compaction(format!(
                "level {} changed during install, job aborted",
                level
            )));
        }
        shard.add_estimated_size(size_change);
        Ok(())
    }

    pub(crate) fn apply_split_files(
        &self,
        shard: &Arc<Shard>,
        cs: &ChangeSet,
        guard: &Guard,
    ) -> Result<()> {
        if shard.split_state() != SplitState::PreSplitFlushDone {
            tracing::error!(
                shard = shard.id,
                state = ?shard.split_state(),
                "wrong split state for split files"
            );
            return Err(Error::WrongSplitState);
        }
        let split = cs.split_files.as_ref().ok_or_else(|| {
            Error::Manifest("split-files change set without payload".to_string())
        })?;
        let mut ids: Vec<u64> = split.l0_creates.iter().map(|l| l.id).collect();
        ids.extend(split.table_creates.iter().map(|t| t.id));
        self.fetch_missing_files(&ids)?;
        match self.inner.manifest.write_change_set(cs) {
            Err(Error::DupChange) => return Ok(()),
            other => other?,
        }

        let mut del = Deletions::new();

        // Replace the L0 pool.
        let old_l0s = shard.load_l0s();
        let mut new_l0s: Vec<Arc<L0Table>> = Vec::with_capacity(split.l0_creates.len());
        for l0 in &split.l0_creates {
            let path = new_filename(l0.id, &self.inner.opts.dir);
            new_l0s.push(Arc::new(L0Table::open(&path)?));
        }
        for old_l0 in &old_l0s.tables {
            if split.table_deletes.contains(&old_l0.id()) {
                del.add(old_l0.id(), Box::new(old_l0.clone()));
            } else {
                new_l0s.push(old_l0.clone());
            }
        }
        new_l0s.sort_by(|a, b| b.commit_ts().cmp(&a.commit_ts()));
        if !shard.cas_l0s(&old_l0s, Arc::new(L0Tables::new(new_l0s))) {
            return Err(Error::Compaction(
                "L0 pool changed during split-files install".to_string(),
            ));
        }

        // Replace the touched level handlers.
        for cf in 0..self.inner.num_cfs {
            for level in 1..=SHARD_MAX_LEVEL {
                let creates: Vec<TableCreate> = split
                    .table_creates
                    .iter()
                    .filter(|t| t.cf as usize == cf && t.level as usize == level)
                    .cloned()
                    .collect();
                if creates.is_empty() {
                    continue;
                }
                self.update_level_handler(shard, cf, level, &creates, &split.table_deletes, &mut del)?;
            }
        }
        shard.set_split_state(cs.state);
        guard.delete(del.collect());
        info!(shard = shard.id, ver = shard.ver, "applied split files");
        Ok(())
    }

    /// Pulls table files referenced by a change set from the blob store
    /// when they are absent locally. No-op without a configured store.
    fn fetch_missing_files(&self, ids: &[u64]) -> Result<()> {
        let Some(store) = &self.inner.blob_store else {
            return Ok(());
        };
        let mut tasks: Vec<crate::config::BlobTask> = Vec::new();
        for &id in ids {
            let path = new_filename(id, &self.inner.opts.dir);
            if path.exists() {
                continue;
            }
            let store = store.clone();
            tasks.push(Box::new(move || {
                let data = store.get(&blob_key(id))?;
                std::fs::write(&path, data)?;
                Ok(())
            }));
        }
        if tasks.is_empty() {
            return Ok(());
        }
        store.batch_schedule(tasks)
    }
}
