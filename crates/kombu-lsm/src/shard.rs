//! Shards: horizontal partitions owning one L0 pool and per-CF levels.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::l0::L0Tables;
use crate::levels::{LevelHandler, LevelSlot};

/// Number of sorted levels per column family.
pub const SHARD_MAX_LEVEL: usize = 4;

/// Split lifecycle of a shard. A shard in any splitting state must not
/// be compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SplitState {
    Initial = 0,
    PreSplit = 1,
    PreSplitFlushDone = 2,
    SplitFileDone = 3,
}

impl SplitState {
    pub(crate) fn from_u8(v: u8) -> SplitState {
        match v {
            1 => SplitState::PreSplit,
            2 => SplitState::PreSplitFlushDone,
            3 => SplitState::SplitFileDone,
            _ => SplitState::Initial,
        }
    }
}

/// One column family's level hierarchy inside a shard.
pub struct ShardCf {
    levels: Vec<LevelSlot>,
}

impl ShardCf {
    fn new() -> Self {
        let levels = (1..=SHARD_MAX_LEVEL)
            .map(|level| LevelSlot::new(LevelHandler::new(level)))
            .collect();
        Self { levels }
    }

    /// Snapshot of `level` (1-based).
    pub fn level(&self, level: usize) -> Arc<LevelHandler> {
        self.levels[level - 1].load()
    }

    /// Publishes a new snapshot for `level` iff it still holds `old`.
    pub fn cas_level(&self, old: &Arc<LevelHandler>, new: LevelHandler) -> bool {
        self.levels[new.level - 1].cas(old, Arc::new(new))
    }
}

pub struct Shard {
    pub id: u64,
    pub ver: u64,
    num_cfs: usize,

    l0s: RwLock<Arc<L0Tables>>,
    cfs: Vec<ShardCf>,

    /// Serializes lifecycle operations (compaction install, splitting,
    /// truncation) against each other. Not held across the merge body.
    pub(crate) lock: Mutex<()>,

    compacting: AtomicBool,
    /// When the shard was marked compacting; lets the planner reclaim
    /// the flag if a meta-change listener never calls back.
    compacting_since: Mutex<Option<Instant>>,
    passive: AtomicBool,
    split_state: AtomicU8,
    estimated_size: AtomicI64,
    change_seq: AtomicU64,
}

impl Shard {
    pub fn new(id: u64, ver: u64, num_cfs: usize) -> Self {
        Self {
            id,
            ver,
            num_cfs,
            l0s: RwLock::new(Arc::new(L0Tables::new(Vec::new()))),
            cfs: (0..num_cfs).map(|_| ShardCf::new()).collect(),
            lock: Mutex::new(()),
            compacting: AtomicBool::new(false),
            compacting_since: Mutex::new(None),
            passive: AtomicBool::new(false),
            split_state: AtomicU8::new(SplitState::Initial as u8),
            estimated_size: AtomicI64::new(0),
            change_seq: AtomicU64::new(0),
        }
    }

    pub fn num_cfs(&self) -> usize {
        self.num_cfs
    }

    pub fn cf(&self, cf: usize) -> &ShardCf {
        &self.cfs[cf]
    }

    pub fn load_l0s(&self) -> Arc<L0Tables> {
        self.l0s.read().clone()
    }

    /// Publishes a new L0 pool iff the current one is still `old`.
    pub fn cas_l0s(&self, old: &Arc<L0Tables>, new: Arc<L0Tables>) -> bool {
        let mut guard = self.l0s.write();
        if Arc::ptr_eq(&guard, old) {
            *guard = new;
            true
        } else {
            false
        }
    }

    /// Prepends a freshly flushed L0 table (newest first).
    pub fn atomic_add_l0(&self, table: Arc<crate::l0::L0Table>) {
        loop {
            let old = self.load_l0s();
            let mut tables = Vec::with_capacity(old.tables.len() + 1);
            tables.push(table.clone());
            tables.extend(old.tables.iter().cloned());
            if self.cas_l0s(&old, Arc::new(L0Tables::new(tables))) {
                self.add_estimated_size(table.size());
                return;
            }
        }
    }

    /// Removes the `n` oldest L0 tables (the tail of the pool); returns
    /// the total size removed.
    pub fn atomic_remove_l0(&self, n: usize) -> i64 {
        loop {
            let old = self.load_l0s();
            let keep = old.tables.len().saturating_sub(n);
            let removed: i64 = old.tables[keep..].iter().map(|t| t.size()).sum();
            let tables = old.tables[..keep].to_vec();
            if self.cas_l0s(&old, Arc::new(L0Tables::new(tables))) {
                return removed;
            }
        }
    }

    /// Atomically claims the shard for compaction. Returns false when a
    /// job is already in flight.
    pub fn mark_compacting(&self, compacting: bool) -> bool {
        if compacting {
            if self
                .compacting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }
            *self.compacting_since.lock() = Some(Instant::now());
        } else {
            self.compacting.store(false, Ordering::SeqCst);
            *self.compacting_since.lock() = None;
        }
        true
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    pub fn compacting_for(&self) -> Option<std::time::Duration> {
        self.compacting_since.lock().map(|t| t.elapsed())
    }

    pub fn set_passive(&self, passive: bool) {
        self.passive.store(passive, Ordering::SeqCst);
    }

    pub fn is_passive(&self) -> bool {
        self.passive.load(Ordering::SeqCst)
    }

    pub fn split_state(&self) -> SplitState {
        SplitState::from_u8(self.split_state.load(Ordering::SeqCst))
    }

    pub fn set_split_state(&self, state: SplitState) {
        self.split_state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_splitting(&self) -> bool {
        self.split_state() != SplitState::Initial
    }

    pub fn estimated_size(&self) -> i64 {
        self.estimated_size.load(Ordering::SeqCst)
    }

    pub fn add_estimated_size(&self, delta: i64) {
        self.estimated_size.fetch_add(delta, Ordering::SeqCst);
    }

    /// Next change-set sequence number for this shard.
    pub(crate) fn next_change_seq(&self) -> u64 {
        self.change_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fast-forwards the change sequence past an externally replayed one.
    pub(crate) fn observe_change_seq(&self, seq: u64) {
        let mut cur = self.change_seq.load(Ordering::SeqCst);
        while cur < seq {
            match self.change_seq.compare_exchange(
                cur,
                seq,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::L0Table;
    use bytes::Bytes;
    use kombu_table::{Entry, Key, ValueStruct};

    fn l0_table(dir: &std::path::Path, id: u64, commit_ts: u64) -> Arc<L0Table> {
        let path = kombu_table::new_filename(id, dir);
        let entries = vec![Entry::new(
            Key::new(Bytes::from(format!("k{id}")), commit_ts),
            ValueStruct::new("v", commit_ts),
        )];
        L0Table::build(&path, commit_ts, &[entries]).unwrap();
        Arc::new(L0Table::open(&path).unwrap())
    }

    #[test]
    fn test_l0_pool_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::new(1, 1, 1);
        shard.atomic_add_l0(l0_table(dir.path(), 1, 10));
        shard.atomic_add_l0(l0_table(dir.path(), 2, 20));

        let l0s = shard.load_l0s();
        assert_eq!(l0s.tables[0].commit_ts(), 20);
        assert_eq!(l0s.tables[1].commit_ts(), 10);
    }

    #[test]
    fn test_remove_l0_takes_tail() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::new(1, 1, 1);
        shard.atomic_add_l0(l0_table(dir.path(), 1, 10));
        shard.atomic_add_l0(l0_table(dir.path(), 2, 20));
        shard.atomic_add_l0(l0_table(dir.path(), 3, 30));

        let removed = shard.atomic_remove_l0(2);
        assert!(removed > 0);
        let l0s = shard.load_l0s();
        assert_eq!(l0s.tables.len(), 1);
        assert_eq!(l0s.tables[0].commit_ts(), 30);
    }

    #[test]
    fn test_mark_compacting_exclusive() {
        let shard = Shard::new(1, 1, 1);
        assert!(shard.mark_compacting(true));
        assert!(!shard.mark_compacting(true));
        shard.mark_compacting(false);
        assert!(shard.mark_compacting(true));
    }

    #[test]
    fn test_split_state_transitions() {
        let shard = Shard::new(1, 1, 1);
        assert!(!shard.is_splitting());
        shard.set_split_state(SplitState::PreSplit);
        assert!(shard.is_splitting());
        shard.set_split_state(SplitState::Initial);
        assert!(!shard.is_splitting());
    }

    #[test]
    fn test_change_seq_monotonic() {
        let shard = Shard::new(1, 1, 1);
        assert_eq!(shard.next_change_seq(), 1);
        assert_eq!(shard.next_change_seq(), 2);
        shard.observe_change_seq(10);
        assert_eq!(shard.next_change_seq(), 11);
        shard.observe_change_seq(5);
        assert_eq!(shard.next_change_seq(), 12);
    }
}
