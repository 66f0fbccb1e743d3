//! Iterators over sorted runs.
//!
//! Three compositions cover every read shape the engine needs:
//!
//! - [`TableIterator`]: walk one table.
//! - [`ConcatIterator`]: walk a sorted, range-disjoint sequence of tables
//!   as if it were one run (levels >= 1).
//! - [`MergeIterator`]: k-way merge of arbitrary sources with
//!   priority-based tie-breaking; equal keys from lower-priority sources
//!   are dropped, so the newest source wins.
//!
//! All iterators yield keys in `(user_key asc, version desc)` order, or
//! the reverse when constructed reversed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entry::Entry;
use crate::key::{Key, ValueStruct};
use crate::table::Table;

/// Positioned iterator over versioned records.
pub trait KvIterator: Send {
    fn valid(&self) -> bool;

    /// Current key. Must only be called while `valid()`.
    fn key(&self) -> &Key;

    /// Current value. Must only be called while `valid()`.
    fn value(&self) -> &ValueStruct;

    /// Advances to the next record (in iteration order).
    fn next(&mut self);

    /// Repositions at the first record.
    fn rewind(&mut self);
}

/// Iterator over a single table.
pub struct TableIterator {
    table: Table,
    idx: isize,
    reversed: bool,
}

impl TableIterator {
    pub(crate) fn new(table: Table, reversed: bool) -> Self {
        let mut it = Self {
            table,
            idx: 0,
            reversed,
        };
        it.rewind();
        it
    }

    /// Positions at the first record with key `>= key` (forward order).
    pub fn seek(&mut self, key: &Key) {
        self.idx = self.table.seek_idx(key) as isize;
    }
}

impl KvIterator for TableIterator {
    fn valid(&self) -> bool {
        self.idx >= 0 && (self.idx as usize) < self.table.len()
    }

    fn key(&self) -> &Key {
        &self.table.entry(self.idx as usize).key
    }

    fn value(&self) -> &ValueStruct {
        &self.table.entry(self.idx as usize).value
    }

    fn next(&mut self) {
        if self.reversed {
            self.idx -= 1;
        } else {
            self.idx += 1;
        }
    }

    fn rewind(&mut self) {
        self.idx = if self.reversed {
            self.table.len() as isize - 1
        } else {
            0
        };
    }
}

/// Iterator over in-memory records, used for L0 column-family sections
/// and tests. Records must already be sorted.
pub struct MemIterator {
    entries: std::sync::Arc<Vec<Entry>>,
    idx: isize,
    reversed: bool,
}

impl MemIterator {
    pub fn new(entries: std::sync::Arc<Vec<Entry>>, reversed: bool) -> Self {
        let mut it = Self {
            entries,
            idx: 0,
            reversed,
        };
        it.rewind();
        it
    }
}

impl KvIterator for MemIterator {
    fn valid(&self) -> bool {
        self.idx >= 0 && (self.idx as usize) < self.entries.len()
    }

    fn key(&self) -> &Key {
        &self.entries[self.idx as usize].key
    }

    fn value(&self) -> &ValueStruct {
        &self.entries[self.idx as usize].value
    }

    fn next(&mut self) {
        if self.reversed {
            self.idx -= 1;
        } else {
            self.idx += 1;
        }
    }

    fn rewind(&mut self) {
        self.idx = if self.reversed {
            self.entries.len() as isize - 1
        } else {
            0
        };
    }
}

/// Concatenation of range-disjoint tables sorted by `smallest()`.
///
/// Valid only for levels >= 1; L0 tables overlap and must go through
/// [`MergeIterator`] instead.
pub struct ConcatIterator {
    tables: Vec<Table>,
    cur: Option<TableIterator>,
    cur_idx: isize,
    reversed: bool,
}

impl ConcatIterator {
    pub fn new(tables: Vec<Table>, reversed: bool) -> Self {
        let mut it = Self {
            tables,
            cur: None,
            cur_idx: -1,
            reversed,
        };
        it.rewind();
        it
    }

    fn set_table(&mut self, idx: isize) {
        self.cur_idx = idx;
        if idx < 0 || idx as usize >= self.tables.len() {
            self.cur = None;
        } else {
            self.cur = Some(self.tables[idx as usize].iter(self.reversed));
        }
    }
}

impl KvIterator for ConcatIterator {
    fn valid(&self) -> bool {
        self.cur.as_ref().is_some_and(|c| c.valid())
    }

    fn key(&self) -> &Key {
        self.cur.as_ref().expect("valid iterator").key()
    }

    fn value(&self) -> &ValueStruct {
        self.cur.as_ref().expect("valid iterator").value()
    }

    fn next(&mut self) {
        let Some(cur) = self.cur.as_mut() else {
            return;
        };
        cur.next();
        if cur.valid() {
            return;
        }
        // Exhausted the current table, move to the neighbor.
        let step = if self.reversed { -1 } else { 1 };
        self.set_table(self.cur_idx + step);
    }

    fn rewind(&mut self) {
        if self.tables.is_empty() {
            self.cur = None;
            return;
        }
        let idx = if self.reversed {
            self.tables.len() as isize - 1
        } else {
            0
        };
        self.set_table(idx);
    }
}

struct HeapItem {
    key: Key,
    src: usize,
    reversed: bool,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.src == other.src
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest key (or the
        // biggest, when reversed) surfaces first. Ties surface the lower
        // source index, which is the higher-priority (newer) source.
        let ord = if self.reversed {
            self.key.cmp(&other.key)
        } else {
            other.key.cmp(&self.key)
        };
        ord.then_with(|| other.src.cmp(&self.src))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge across sources; source index doubles as priority, lower
/// index = newer data. Records whose full key collides with a
/// higher-priority source are skipped.
pub struct MergeIterator {
    sources: Vec<Box<dyn KvIterator>>,
    heap: BinaryHeap<HeapItem>,
    cur_key: Key,
    cur_value: ValueStruct,
    valid: bool,
    reversed: bool,
}

impl MergeIterator {
    pub fn new(sources: Vec<Box<dyn KvIterator>>, reversed: bool) -> Self {
        let mut it = Self {
            sources,
            heap: BinaryHeap::new(),
            cur_key: Key::default(),
            cur_value: ValueStruct::default(),
            valid: false,
            reversed,
        };
        it.rewind();
        it
    }

    fn push_source(&mut self, src: usize) {
        if self.sources[src].valid() {
            self.heap.push(HeapItem {
                key: self.sources[src].key().clone(),
                src,
                reversed: self.reversed,
            });
        }
    }

    fn advance(&mut self) {
        loop {
            let Some(top) = self.heap.pop() else {
                self.valid = false;
                return;
            };
            let src = top.src;
            let dup = self.valid && top.key == self.cur_key;
            if !dup {
                self.cur_key = top.key;
                self.cur_value = self.sources[src].value().clone();
                self.valid = true;
            }
            self.sources[src].next();
            self.push_source(src);
            if !dup {
                return;
            }
            // Same full key from an older source: drop and keep draining.
        }
    }
}

impl KvIterator for MergeIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &Key {
        &self.cur_key
    }

    fn value(&self) -> &ValueStruct {
        &self.cur_value
    }

    fn next(&mut self) {
        self.advance();
    }

    fn rewind(&mut self) {
        self.heap.clear();
        self.valid = false;
        for src in 0..self.sources.len() {
            self.sources[src].rewind();
        }
        for src in 0..self.sources.len() {
            self.push_source(src);
        }
        self.advance();
    }
}
