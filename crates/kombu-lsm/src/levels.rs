//! Per-level table sets and their atomic publication.
//!
//! A [`LevelHandler`] is an immutable snapshot of one `(shard, cf,
//! level)`: an ordered table vector plus the total size. Readers grab
//! the current snapshot once and use it for a whole operation; writers
//! build a fresh snapshot and publish it through [`LevelSlot::cas`],
//! which only succeeds if nobody replaced the snapshot in between.
//!
//! Invariants:
//! - at level >= 1 tables are disjoint in user-key range and sorted by
//!   `smallest()`;
//! - level 0 lives in the shard's shared pool, not here.

use std::fmt::Write as _;
use std::sync::Arc;

use kombu_table::{Entry, Key, Table};
use parking_lot::RwLock;

/// Immutable snapshot of one level.
pub struct LevelHandler {
    pub level: usize,
    pub tables: Vec<Table>,
    pub total_size: i64,
}

impl LevelHandler {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            tables: Vec::new(),
            total_size: 0,
        }
    }

    /// Builds a snapshot from `tables`, which must already satisfy the
    /// level ordering invariant.
    pub fn with_tables(level: usize, tables: Vec<Table>) -> Self {
        let total_size = sum_table_size(&tables);
        Self {
            level,
            tables,
            total_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Point lookup: at most one table can hold `user_key` at this
    /// level, found by binary search on the bounding keys.
    pub fn get(&self, user_key: &[u8], version: u64) -> Option<Entry> {
        let idx = self
            .tables
            .partition_point(|t| t.biggest().user_key.as_ref() < user_key);
        let table = self.tables.get(idx)?;
        if table.smallest().user_key.as_ref() > user_key {
            return None;
        }
        table.get(user_key, version)
    }
}

/// Binary-searches a sorted level for the window of tables touching
/// `[lo, hi]`. Returns `[left, right)`.
pub fn tables_in_range(tables: &[Table], lo: &Key, hi: &Key) -> (usize, usize) {
    let left = tables.partition_point(|t| t.biggest() < lo);
    let right = tables.partition_point(|t| t.smallest() <= hi);
    (left, right)
}

pub fn sum_table_size(tables: &[Table]) -> i64 {
    tables.iter().map(|t| t.size()).sum()
}

pub fn sort_tables(tables: &mut [Table]) {
    tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));
}

/// Verifies the strict ordering invariant of a sorted level and panics
/// with a table listing on violation. Corruption of the level hierarchy
/// is unrecoverable, so this is deliberately fatal.
pub fn assert_tables_order(level: usize, tables: &[Table], ctx: Option<&str>) {
    if level == 0 {
        return;
    }
    for i in 0..tables.len().saturating_sub(1) {
        let cur = &tables[i];
        let next = &tables[i + 1];
        if cur.smallest() > cur.biggest()
            || cur.smallest() >= next.smallest()
            || cur.biggest() >= next.biggest()
        {
            let mut msg = String::new();
            if let Some(ctx) = ctx {
                let _ = writeln!(msg, "{}", ctx);
            }
            let _ = writeln!(msg, "the order of level {} tables is invalid:", level);
            for (idx, tbl) in tables.iter().enumerate() {
                let tag = if idx == i { "->" } else { "  " };
                let _ = writeln!(
                    msg,
                    "{} id:{} smallest:{:?} biggest:{:?}",
                    tag,
                    tbl.id(),
                    tbl.smallest(),
                    tbl.biggest()
                );
            }
            panic!("{}", msg);
        }
    }
}

/// Publication slot for one level's snapshot.
///
/// Readers `load` an `Arc` once; the applier publishes with `cas`,
/// comparing snapshot identity so that a concurrent install aborts the
/// whole job rather than silently clobbering it.
pub struct LevelSlot {
    slot: RwLock<Arc<LevelHandler>>,
}

impl LevelSlot {
    pub fn new(handler: LevelHandler) -> Self {
        Self {
            slot: RwLock::new(Arc::new(handler)),
        }
    }

    pub fn load(&self) -> Arc<LevelHandler> {
        self.slot.read().clone()
    }

    /// Publishes `new` iff the slot still holds `old`.
    pub fn cas(&self, old: &Arc<LevelHandler>, new: Arc<LevelHandler>) -> bool {
        let mut guard = self.slot.write();
        if Arc::ptr_eq(&guard, old) {
            *guard = new;
            true
        } else {
            false
        }
    }
}
