//! Compaction: planning, job building, execution.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Planner (run_compaction_loop, 100ms tick)                  │
//! │  - scores every shard: L0 pool first, then (cf, level)      │
//! │  - eligible iff score > 1, not passive/compacting/splitting │
//! │  - dispatches up to num_compactors jobs on worker threads   │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ compact_shard(priority)
//!                ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Job builder (CompactDef::fill_tables)                      │
//! │  - seeds with the max top/bottom size-ratio table           │
//! │  - expands left/right while no bottom table is skipped over │
//! │  - classifies untouched bottom tables >= 1 MiB as skipped   │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ compact_build_tables
//!                ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Executor (compact_tables)                                  │
//! │  - merge-iterates top ++ bottom in (key asc, version desc)  │
//! │  - MVCC GC below safe_ts, tombstone retention, user filter  │
//! │  - rotates output files only at user-key boundaries         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Results are installed by the change-set applier; see `changeset.rs`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick};
use tracing::{debug, error, info, warn};

use crate::changeset::{ChangeSet, Compaction, TableCreate};
use crate::config::{blob_key, BlobStore, CompactionFilter, Decision, IdAllocator, TableBuilderOptions};
use crate::epoch::Guard;
use crate::error::{Error, Result};
use crate::levels::{sum_table_size, tables_in_range, LevelHandler};
use crate::shard::{Shard, SHARD_MAX_LEVEL};
use crate::Engine;
use kombu_table::{
    is_deleted, new_filename, BuildResult, ConcatIterator, Key, KvIterator, MergeIterator,
    RateLimiter, Table, TableBuilder, ValueStruct,
};

/// Bottom tables smaller than this are always rewritten; skipping tiny
/// files would let a level accumulate an unbounded number of them.
pub const MIN_SKIPPED_TABLE_SIZE: i64 = 1024 * 1024;

/// After this long, a shard still flagged `compacting` while a
/// meta-change listener is configured is assumed to have lost its
/// callback; the planner reclaims the flag.
pub(crate) const LISTENER_COMPACTING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub left: Key,
    pub right: Key,
    pub inf: bool,
}

impl KeyRange {
    pub fn overlaps_with(&self, other: &KeyRange) -> bool {
        if self.inf || other.inf {
            return true;
        }
        self.left <= other.right && other.left <= self.right
    }
}

/// Bounding box of a non-empty table set.
pub fn get_key_range(tables: &[Table]) -> KeyRange {
    debug_assert!(!tables.is_empty());
    let mut smallest = tables[0].smallest();
    let mut biggest = tables[0].biggest();
    for table in &tables[1..] {
        if table.smallest() < smallest {
            smallest = table.smallest();
        }
        if table.biggest() > biggest {
            biggest = table.biggest();
        }
    }
    KeyRange {
        left: smallest.clone(),
        right: biggest.clone(),
        inf: false,
    }
}

/// One shard's claim on the prioritized work list.
pub struct CompactionPriority {
    /// Column family, or -1 for the multi-CF L0 -> L1 conversion.
    pub cf: i32,
    pub level: usize,
    pub score: f64,
    pub shard: Arc<Shard>,
}

/// A fully planned compaction job.
pub struct CompactDef {
    pub cf: i32,
    pub level: usize,

    pub top: Vec<Table>,
    pub bot: Vec<Table>,
    /// Bottom tables inside the job window that no top table touches;
    /// reinserted unchanged at level+1 after the job.
    pub skipped: Vec<Table>,

    pub safe_ts: u64,
    pub filter: Option<Box<dyn CompactionFilter>>,
    pub has_overlap: bool,

    pub opt: TableBuilderOptions,
    pub dir: PathBuf,
    pub id_alloc: Option<Arc<dyn IdAllocator>>,
    pub limiter: Option<Arc<RateLimiter>>,

    pub(crate) this_range: KeyRange,
    pub(crate) next_range: KeyRange,

    top_size: i64,
    top_left_idx: usize,
    top_right_idx: usize,
    bot_size: i64,
    bot_left_idx: usize,
    bot_right_idx: usize,
}

impl CompactDef {
    pub fn new(cf: i32, level: usize, dir: PathBuf, opt: TableBuilderOptions) -> Self {
        Self {
            cf,
            level,
            top: Vec::new(),
            bot: Vec::new(),
            skipped: Vec::new(),
            safe_ts: 0,
            filter: None,
            has_overlap: false,
            opt,
            dir,
            id_alloc: None,
            limiter: None,
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            top_size: 0,
            top_left_idx: 0,
            top_right_idx: 0,
            bot_size: 0,
            bot_left_idx: 0,
            bot_right_idx: 0,
        }
    }

    pub(crate) fn smallest(&self) -> &Key {
        if !self.bot.is_empty() && self.next_range.left < self.this_range.left {
            &self.next_range.left
        } else {
            &self.this_range.left
        }
    }

    pub(crate) fn biggest(&self) -> &Key {
        if !self.bot.is_empty() && self.next_range.right > self.this_range.right {
            &self.next_range.right
        } else {
            &self.this_range.right
        }
    }

    /// Picks the job's top and bottom tables from snapshots of the two
    /// levels. Returns false when the current level holds no tables.
    pub fn fill_tables(&mut self, this_level: &LevelHandler, next_level: &LevelHandler) -> bool {
        if this_level.tables.is_empty() {
            return false;
        }
        let this = &this_level.tables;
        let next = &next_level.tables;

        // First pick the table with the max top-size/bottom-size ratio.
        let mut candidate_ratio = 0f64;
        for (i, t) in this.iter().enumerate() {
            let (lo, hi) = user_key_range(t.smallest(), t.biggest());
            let (left, right) = tables_in_range(next, &lo, &hi);
            let bot_size = sum_table_size(&next[left..right]);
            let ratio = calc_ratio(t.size(), bot_size);
            if ratio > candidate_ratio {
                candidate_ratio = ratio;
                self.top_left_idx = i;
                self.top_right_idx = i + 1;
                self.top = this[i..i + 1].to_vec();
                self.top_size = t.size();
                self.bot_left_idx = left;
                self.bot_right_idx = right;
                self.bot_size = bot_size;
            }
        }
        if self.top.is_empty() {
            return false;
        }
        let mut bots: Vec<Table> = next[self.bot_left_idx..self.bot_right_idx].to_vec();

        // Expand to the left. Termination is purely structural: stop as
        // soon as taking one more top table would skip across a bottom
        // table, which would break contiguity of the window.
        let mut i = self.top_left_idx;
        while i > 0 {
            i -= 1;
            let t = &this[i];
            let (lo, hi) = user_key_range(t.smallest(), t.biggest());
            let (left, right) = tables_in_range(next, &lo, &hi);
            if right < self.bot_left_idx {
                // A bottom table would be skipped; compact it in another run.
                break;
            }
            self.top.insert(0, t.clone());
            self.top_left_idx -= 1;
            let widened: Vec<Table> = next[left..self.bot_left_idx].to_vec();
            self.bot_size += sum_table_size(&widened);
            bots.splice(0..0, widened);
            self.bot_left_idx = left;
            self.top_size += t.size();
        }

        // Expand to the right, symmetrically.
        let mut i = self.top_right_idx;
        while i < this.len() {
            let t = &this[i];
            let (lo, hi) = user_key_range(t.smallest(), t.biggest());
            let (left, right) = tables_in_range(next, &lo, &hi);
            if left > self.bot_right_idx {
                break;
            }
            self.top.push(t.clone());
            self.top_right_idx += 1;
            let widened: Vec<Table> = next[self.bot_right_idx..right].to_vec();
            self.bot_size += sum_table_size(&widened);
            bots.extend(widened);
            self.bot_right_idx = right;
            self.top_size += t.size();
            i += 1;
        }

        self.this_range = KeyRange {
            left: self.top[0].smallest().clone(),
            right: self.top[self.top.len() - 1].biggest().clone(),
            inf: false,
        };
        self.next_range = if !bots.is_empty() {
            KeyRange {
                left: bots[0].smallest().clone(),
                right: bots[bots.len() - 1].biggest().clone(),
                inf: false,
            }
        } else {
            self.this_range.clone()
        };

        self.fill_bottom_tables(&bots);
        for t in &self.skipped {
            self.bot_size -= t.size();
        }
        true
    }

    fn fill_bottom_tables(&mut self, overlapping: &[Table]) {
        for t in overlapping {
            // If no top table actually contains keys in this bottom
            // table's range, it can ride through the compaction untouched.
            let touched = self
                .top
                .iter()
                .any(|top| top.has_overlap(t.smallest(), t.biggest(), true));
            if touched {
                self.bot.push(t.clone());
            } else if t.size() >= MIN_SKIPPED_TABLE_SIZE {
                self.skipped.push(t.clone());
            } else {
                self.bot.push(t.clone());
            }
        }
    }

    /// A logical move: the top tables are re-tagged to level+1 without
    /// rewriting any bytes.
    pub fn move_down(&self) -> bool {
        self.level > 0 && self.bot.is_empty() && self.skipped.is_empty()
    }

    pub(crate) fn build_iterator(&self) -> MergeIterator {
        // Key ranges within each side are disjoint (level >= 1), so a
        // concat iterator per side suffices; top wins ties.
        let iters: Vec<Box<dyn KvIterator>> = vec![
            Box::new(ConcatIterator::new(self.top.clone(), false)),
            Box::new(ConcatIterator::new(self.bot.clone(), false)),
        ];
        MergeIterator::new(iters, false)
    }
}

impl fmt::Display for CompactDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} top:[{}:{}]({}), bot:[{}:{}]({}), skip:{}, write_amp:{:.2}",
            self.level,
            self.top_left_idx,
            self.top_right_idx,
            self.top_size,
            self.bot_left_idx,
            self.bot_right_idx,
            self.bot_size,
            self.skipped.len(),
            (self.top_size + self.bot_size) as f64 / self.top_size.max(1) as f64,
        )
    }
}

/// Widens table bounds to cover every version of the boundary user
/// keys. Range windows must be computed against these, or a table
/// holding only older versions of a boundary key escapes the window and
/// user-key disjointness breaks at install.
fn user_key_range(smallest: &Key, biggest: &Key) -> (Key, Key) {
    (
        Key::new(smallest.user_key.clone(), u64::MAX),
        Key::new(biggest.user_key.clone(), 0),
    )
}

fn calc_ratio(top_size: i64, bot_size: i64) -> f64 {
    if bot_size == 0 {
        return top_size as f64;
    }
    top_size as f64 / bot_size as f64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub keys_read: u64,
    pub bytes_read: u64,
    pub keys_written: u64,
    pub bytes_written: u64,
}

/// Bytes and keys dropped by MVCC GC and filters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardStats {
    pub num_skips: u64,
    pub skipped_bytes: u64,
}

impl DiscardStats {
    fn collect(&mut self, vs: &ValueStruct) {
        self.skipped_bytes += (vs.value.len() + vs.user_meta.len()) as u64;
        self.num_skips += 1;
    }
}

impl fmt::Display for DiscardStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "numSkips:{}, skippedBytes:{}",
            self.num_skips, self.skipped_bytes
        )
    }
}

/// Rotation only happens on a user-key boundary and only once the file
/// is over budget, so all versions of one user key land in one table.
pub(crate) fn should_finish_file(last_key: &Key, current_size: i64, max_size: i64) -> bool {
    !last_key.is_empty() && current_size > max_size
}

/// Drops skipped tables whose range is entirely behind `key`. Returns
/// the remaining slice and whether any were crossed.
pub(crate) fn over_skip_tables<'a>(key: &Key, skipped: &'a [Table]) -> (&'a [Table], bool) {
    let mut i = 0;
    while i < skipped.len() && key > skipped[i].biggest() {
        i += 1;
    }
    (&skipped[i..], i > 0)
}

/// Merge-compacts the job's inputs into new level+1 tables.
pub fn compact_tables(
    cd: &CompactDef,
    stats: &mut CompactionStats,
    discard_stats: &mut DiscardStats,
    blob_store: Option<&Arc<dyn BlobStore>>,
) -> Result<Vec<BuildResult>> {
    let id_alloc = cd
        .id_alloc
        .as_ref()
        .ok_or_else(|| Error::Compaction("job missing id allocator".to_string()))?;
    let mut results = Vec::new();
    let mut it = cd.build_iterator();
    let mut skipped: &[Table] = &cd.skipped;

    let mut builder: Option<TableBuilder> = None;
    let mut last_key = Key::default();
    let mut skip_key = Key::default();
    while it.valid() {
        let filename = new_filename(id_alloc.alloc_id(), &cd.dir);
        let b = match builder.take() {
            Some(mut b) => {
                b.reset(&filename)?;
                b
            }
            None => TableBuilder::new(&filename, cd.limiter.clone())?,
        };
        let b = builder.insert(b);
        last_key.reset();
        while it.valid() {
            stats.keys_read += 1;
            let key = it.key().clone();
            let vs = it.value().clone();
            let kv_size = vs.encoded_size() + key.user_key.len();
            stats.bytes_read += kv_size as u64;

            // See if we need to skip this key.
            if !skip_key.is_empty() {
                if key.same_user_key(&skip_key) {
                    discard_stats.collect(&vs);
                    it.next();
                    continue;
                }
                skip_key.reset();
            }
            if !key.same_user_key(&last_key) {
                // Only rotate between user keys, never between versions
                // of one key.
                if !skipped.is_empty() {
                    let (rest, over) = over_skip_tables(&key, skipped);
                    skipped = rest;
                    if over && !b.is_empty() {
                        // The skipped table must land between two output
                        // files in sorted order.
                        break;
                    }
                }
                if should_finish_file(
                    &last_key,
                    b.estimate_size() + kv_size as i64,
                    cd.opt.max_table_size,
                ) {
                    break;
                }
                last_key = key.clone();
            }

            // Only consider versions at or below safe_ts; everything
            // newer may still be needed by an active snapshot.
            if key.version <= cd.safe_ts {
                // This is the newest readable version of the key; all
                // older versions are shadowed and can go.
                skip_key = key.clone();

                if is_deleted(vs.meta) {
                    // Without deeper overlap nothing can resurrect the
                    // key, so the tombstone itself is useless.
                    if !cd.has_overlap {
                        discard_stats.collect(&vs);
                        it.next();
                        continue;
                    }
                } else if let Some(filter) = &cd.filter {
                    match filter.filter(cd.cf.max(0) as usize, &key.user_key, &vs.value, &vs.user_meta) {
                        Decision::MarkTombstone => {
                            discard_stats.collect(&vs);
                            if cd.has_overlap {
                                b.add(&key, &ValueStruct::tombstone(key.version))?;
                            }
                            it.next();
                            continue;
                        }
                        Decision::Drop => {
                            discard_stats.collect(&vs);
                            it.next();
                            continue;
                        }
                        Decision::Keep => {}
                    }
                }
            }

            b.add(&key, &vs)?;
            stats.keys_written += 1;
            stats.bytes_written += kv_size as u64;
            it.next();
        }
        if b.is_empty() {
            continue;
        }
        let result = b.finish()?;
        if let Some(store) = blob_store {
            put_build_result(store, &result)?;
        }
        results.push(result);
    }
    Ok(results)
}

fn put_build_result(store: &Arc<dyn BlobStore>, result: &BuildResult) -> Result<()> {
    let data = std::fs::read(&result.path)?;
    store.put(&blob_key(result.id), &data)
}

/// Per-CF output builder for the multi-CF L0 -> L1 conversion.
struct L0BuildHelper<'a> {
    iter: MergeIterator,
    safe_ts: u64,
    filter: Option<Box<dyn CompactionFilter>>,
    cf: usize,
    builder: &'a mut Option<TableBuilder>,
    dir: PathBuf,
    opt: TableBuilderOptions,
    id_alloc: Arc<dyn IdAllocator>,
    limiter: Option<Arc<RateLimiter>>,
}

impl L0BuildHelper<'_> {
    /// Builds one output table; `None` once the input is drained.
    fn build_one(&mut self) -> Result<Option<BuildResult>> {
        if !self.iter.valid() {
            return Ok(None);
        }
        let filename = new_filename(self.id_alloc.alloc_id(), &self.dir);
        let b = match self.builder.take() {
            Some(mut b) => {
                b.reset(&filename)?;
                b
            }
            None => TableBuilder::new(&filename, self.limiter.clone())?,
        };
        let b = self.builder.insert(b);
        let mut last_key = Key::default();
        let mut skip_key = Key::default();
        let it = &mut self.iter;
        while it.valid() {
            let key = it.key().clone();
            let vs = it.value().clone();
            if !skip_key.is_empty() {
                if key.same_user_key(&skip_key) {
                    it.next();
                    continue;
                }
                skip_key.reset();
            }
            if !key.same_user_key(&last_key) {
                // We only break on table size.
                if b.estimate_size() > self.opt.max_table_size {
                    break;
                }
                last_key = key.clone();
            }
            if key.version <= self.safe_ts {
                skip_key = key.clone();
                if !is_deleted(vs.meta) {
                    if let Some(filter) = &self.filter {
                        match filter.filter(self.cf, &key.user_key, &vs.value, &vs.user_meta) {
                            Decision::MarkTombstone => {
                                // Older versions may exist below L1, so
                                // leave a tombstone in their place.
                                b.add(&key, &ValueStruct::tombstone(key.version))?;
                                it.next();
                                continue;
                            }
                            Decision::Drop => {
                                it.next();
                                continue;
                            }
                            Decision::Keep => {}
                        }
                    }
                }
            }
            b.add(&key, &vs)?;
            it.next();
        }
        if b.is_empty() {
            return Ok(None);
        }
        Ok(Some(b.finish()?))
    }
}

impl Engine {
    /// Monotonically raises the managed safe-ts watermark.
    pub fn update_managed_safe_ts(&self, ts: u64) {
        use std::sync::atomic::Ordering;
        loop {
            let old = self.inner.managed_safe_ts.load(Ordering::SeqCst);
            if old >= ts {
                return;
            }
            if self
                .inner
                .managed_safe_ts
                .compare_exchange(old, ts, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Monotonically raises the snapshot tracker's safe-ts watermark.
    pub fn update_tracked_safe_ts(&self, ts: u64) {
        use std::sync::atomic::Ordering;
        loop {
            let old = self.inner.tracked_safe_ts.load(Ordering::SeqCst);
            if old >= ts {
                return;
            }
            if self
                .inner
                .tracked_safe_ts
                .compare_exchange(old, ts, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn get_cf_safe_ts(&self, cf: usize) -> u64 {
        use std::sync::atomic::Ordering;
        if self.inner.opts.cfs[cf].managed {
            self.inner.managed_safe_ts.load(Ordering::SeqCst)
        } else {
            self.inner.tracked_safe_ts.load(Ordering::SeqCst)
        }
    }

    /// Scores one shard: the L0 pool takes priority, then the fullest
    /// sorted level across all CFs.
    pub fn compaction_priority(&self, shard: &Arc<Shard>) -> CompactionPriority {
        let opts = &self.inner.opts;
        let mut max_pri = CompactionPriority {
            cf: 0,
            level: 0,
            score: 0.0,
            shard: shard.clone(),
        };
        let l0s = shard.load_l0s();
        if l0s.tables.len() > opts.num_level_zero_tables {
            let size_score = l0s.total_size() as f64 * 10.0 / opts.level_one_size as f64;
            let num_tbls_score = l0s.tables.len() as f64 / opts.num_level_zero_tables as f64;
            max_pri.score = size_score * 0.6 + num_tbls_score * 0.4;
            max_pri.cf = -1;
            return max_pri;
        }
        for cf in 0..self.inner.num_cfs {
            // The deepest level has nowhere to merge into.
            for level in 1..SHARD_MAX_LEVEL {
                let handler = shard.cf(cf).level(level);
                let score = handler.total_size as f64
                    / (opts.level_one_size as f64 * 10f64.powi(level as i32 - 1));
                if score > max_pri.score {
                    max_pri.score = score;
                    max_pri.cf = cf as i32;
                    max_pri.level = level;
                }
            }
        }
        max_pri
    }

    /// Scores every eligible shard, highest first. Ties keep shard-id
    /// order, which is stable across calls.
    pub fn compaction_priorities(&self) -> Vec<CompactionPriority> {
        let mut shards: Vec<Arc<Shard>> =
            self.inner.shards.read().values().cloned().collect();
        shards.sort_by_key(|s| s.id);
        let mut results = Vec::new();
        for shard in shards {
            if shard.is_compacting() && self.inner.meta_change_listener.is_some() {
                // A listener that never calls back would wedge the shard.
                if let Some(elapsed) = shard.compacting_for() {
                    if elapsed > LISTENER_COMPACTING_TIMEOUT {
                        warn!(
                            shard = shard.id,
                            ?elapsed,
                            "meta change listener never called back, clearing compacting flag"
                        );
                        shard.mark_compacting(false);
                    }
                }
            }
            if shard.is_passive() || shard.is_compacting() || shard.is_splitting() {
                continue;
            }
            let pri = self.compaction_priority(&shard);
            if pri.score > 1.0 {
                results.push(pri);
            }
        }
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results
    }

    /// Background driver: re-scores shards every 100ms and fans jobs out
    /// to worker threads, bounded by `num_compactors` per cycle.
    pub(crate) fn run_compaction_loop(&self) {
        let ticker = tick(Duration::from_millis(100));
        loop {
            let priorities = self.compaction_priorities();
            let mut workers = Vec::new();
            for pri in priorities
                .into_iter()
                .take(self.inner.opts.num_compactors)
            {
                if !pri.shard.mark_compacting(true) {
                    continue;
                }
                let engine = self.clone();
                workers.push(std::thread::spawn(move || {
                    let shard = pri.shard.clone();
                    match engine.compact_shard(pri) {
                        // The listener owns completion; the flag clears
                        // when the change set is replayed.
                        Ok(true) => {}
                        Ok(false) => {
                            shard.mark_compacting(false);
                        }
                        Err(err) => {
                            error!(shard = shard.id, ?err, "compact shard failed");
                            shard.mark_compacting(false);
                        }
                    }
                }));
            }
            for worker in workers {
                let _ = worker.join();
            }
            select! {
                recv(self.inner.closer.has_been_closed()) -> _ => return,
                recv(ticker) -> _ => {}
            }
        }
    }

    /// Runs one planned job to completion. Returns true when a
    /// meta-change listener took ownership of the install (and of
    /// clearing the shard's `compacting` flag).
    pub fn compact_shard(&self, pri: CompactionPriority) -> Result<bool> {
        let guard = self.inner.resource_mgr.acquire();
        let shard = pri.shard;
        let cd = {
            let _lock = shard.lock.lock();
            if shard.is_splitting() {
                debug!(shard = shard.id, "avoid compaction for splitting shard");
                return Ok(false);
            }
            match self.get_shard(shard.id) {
                Some(latest) if latest.ver == shard.ver => {}
                _ => {
                    info!(shard = shard.id, "avoid compaction for shard version change");
                    return Ok(false);
                }
            }
            if shard.is_passive() {
                warn!(shard = shard.id, "avoid passive shard compaction");
                return Ok(false);
            }
            if pri.cf == -1 {
                info!(shard = shard.id, score = pri.score, "compact shard multi cf");
                let deferred = self.compact_shard_l0(&shard, &guard)?;
                info!(shard = shard.id, "compact shard multi cf done");
                return Ok(deferred);
            }
            info!(
                shard = shard.id,
                cf = pri.cf,
                level = pri.level,
                score = pri.score,
                "start compaction"
            );
            let scf = shard.cf(pri.cf as usize);
            let this_level = scf.level(pri.level);
            if this_level.tables.is_empty() {
                // The shard must have been truncated.
                info!(shard = shard.id, "stop compaction due to shard truncated");
                return Ok(false);
            }
            let next_level = scf.level(pri.level + 1);
            let mut cd = CompactDef::new(
                pri.cf,
                pri.level,
                self.inner.opts.dir.clone(),
                self.inner.opts.table_builder_options,
            );
            if !cd.fill_tables(&this_level, &next_level) {
                return Ok(false);
            }
            self.set_has_overlapping(&shard, &mut cd);
            cd
        };
        info!(shard = shard.id, def = %cd, "running compaction");
        let level = cd.level;
        let deferred = self.run_compact_def(&shard, cd.cf as usize, cd, &guard)?;
        info!(shard = shard.id, level, "compaction done");
        Ok(deferred)
    }

    /// True when any table two or more levels below the job overlaps its
    /// output range; governs tombstone retention.
    pub(crate) fn set_has_overlapping(&self, shard: &Arc<Shard>, cd: &mut CompactDef) {
        let scf = shard.cf(cd.cf as usize);
        let (lo, hi) = user_key_range(cd.smallest(), cd.biggest());
        for level in cd.level + 2..=SHARD_MAX_LEVEL {
            let handler = scf.level(level);
            let (left, right) = tables_in_range(&handler.tables, &lo, &hi);
            if right > left {
                cd.has_overlap = true;
                return;
            }
        }
        cd.has_overlap = false;
    }

    /// Executes a job (or its move-down shortcut) and hands the change
    /// set to the listener or the local applier.
    fn run_compact_def(
        &self,
        shard: &Arc<Shard>,
        cf: usize,
        mut cd: CompactDef,
        guard: &Guard,
    ) -> Result<bool> {
        let mut comp = Compaction {
            cf: cf as i32,
            level: cd.level as u32,
            top_deletes: Vec::new(),
            bottom_deletes: Vec::new(),
            table_creates: Vec::new(),
        };
        if cd.move_down() {
            // Re-tag the inputs one level deeper without reading a byte.
            for t in &cd.top {
                comp.top_deletes.push(t.id());
                comp.table_creates
                    .push(TableCreate::from_table(t, cf as i32, cd.level as u32 + 1));
            }
        } else {
            comp.table_creates = self.compact_build_tables(cf, &mut cd)?;
            for t in &cd.top {
                comp.top_deletes.push(t.id());
            }
            for t in &cd.bot {
                comp.bottom_deletes.push(t.id());
            }
        }

        let _lock = shard.lock.lock();
        match self.get_shard(shard.id) {
            Some(latest) if latest.ver == shard.ver => {}
            _ => {
                info!(shard = shard.id, "drop compaction result for shard version change");
                return Ok(false);
            }
        }
        let mut cs = ChangeSet::new(shard);
        cs.compaction = Some(comp);
        if let Some(listener) = &self.inner.meta_change_listener {
            listener.on_change(cs);
            return Ok(true);
        }
        self.apply_compaction(shard, &cs, guard)?;
        Ok(false)
    }

    fn compact_build_tables(&self, cf: usize, cd: &mut CompactDef) -> Result<Vec<TableCreate>> {
        self.prepare_compaction_def(cf, cd);
        let mut stats = CompactionStats::default();
        let mut discard_stats = DiscardStats::default();
        let results = compact_tables(
            cd,
            &mut stats,
            &mut discard_stats,
            self.inner.blob_store.as_ref(),
        )?;
        info!(
            cf,
            level = cd.level,
            keys_read = stats.keys_read,
            keys_written = stats.keys_written,
            bytes_written = stats.bytes_written,
            discarded = %discard_stats,
            "compaction tables built"
        );
        Ok(results
            .iter()
            .map(|r| TableCreate::from_build_result(r, cf as i32, cd.level as u32 + 1))
            .collect())
    }

    fn prepare_compaction_def(&self, cf: usize, cd: &mut CompactDef) {
        // Versions at or below this watermark are invisible to every
        // running snapshot, so all but the newest can be discarded.
        cd.safe_ts = self.get_cf_safe_ts(cf);
        if let Some(factory) = &self.inner.compaction_filter_factory {
            cd.filter = Some(factory(
                cd.level + 1,
                &cd.smallest().user_key,
                &cd.biggest().user_key,
            ));
        }
        cd.id_alloc = Some(self.inner.id_alloc.clone());
        cd.limiter = self.inner.limiter.clone();
    }

    /// L0 -> L1: merges the whole L0 pool with L1, one output stream per
    /// CF, installed as a single atomic change set.
    pub(crate) fn compact_shard_l0(&self, shard: &Arc<Shard>, guard: &Guard) -> Result<bool> {
        let l0s = shard.load_l0s();
        let mut comp = Compaction {
            cf: -1,
            level: 0,
            top_deletes: Vec::new(),
            bottom_deletes: Vec::new(),
            table_creates: Vec::new(),
        };
        let mut builder: Option<TableBuilder> = None;
        for cf in 0..self.inner.num_cfs {
            let old_handler = shard.cf(cf).level(1);
            let mut iters: Vec<Box<dyn KvIterator>> = Vec::new();
            // L0 pool is newest first, so source order doubles as merge
            // priority.
            for l0 in &l0s.tables {
                if let Some(it) = l0.iter(cf, false) {
                    iters.push(Box::new(it));
                }
            }
            if !old_handler.tables.is_empty() {
                iters.push(Box::new(ConcatIterator::new(
                    old_handler.tables.clone(),
                    false,
                )));
            }
            let mut helper = L0BuildHelper {
                iter: MergeIterator::new(iters, false),
                safe_ts: self.get_cf_safe_ts(cf),
                filter: self
                    .inner
                    .compaction_filter_factory
                    .as_ref()
                    .map(|factory| factory(1, &[], &[])),
                cf,
                builder: &mut builder,
                dir: self.inner.opts.dir.clone(),
                opt: self.inner.opts.table_builder_options,
                id_alloc: self.inner.id_alloc.clone(),
                limiter: self.inner.limiter.clone(),
            };
            let mut results = Vec::new();
            while let Some(result) = helper.build_one()? {
                if let Some(store) = self.inner.blob_store.as_ref() {
                    put_build_result(store, &result)?;
                }
                results.push(result);
            }
            for result in &results {
                comp.table_creates
                    .push(TableCreate::from_build_result(result, cf as i32, 1));
            }
            for old_tbl in &old_handler.tables {
                comp.bottom_deletes.push(old_tbl.id());
            }
        }
        for l0 in &l0s.tables {
            comp.top_deletes.push(l0.id());
        }
        let mut cs = ChangeSet::new(shard);
        cs.compaction = Some(comp);
        info!(
            shard = shard.id,
            ver = shard.ver,
            top_deletes = ?cs.compaction.as_ref().map(|c| &c.top_deletes),
            "compact L0"
        );
        if let Some(listener) = &self.inner.meta_change_listener {
            listener.on_change(cs);
            return Ok(true);
        }
        self.apply_compaction(shard, &cs, guard)?;
        Ok(false)
    }
}
