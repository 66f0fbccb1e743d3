//! File-backed immutable table reader.
//!
//! A table is opened once, validated record-by-record (crc32c), and then
//! served entirely from an in-memory record index whose key/value bytes
//! are zero-copy slices of the file buffer. `Table` is a cheap handle:
//! clones share one `Arc`'d core, which is how level snapshots and
//! iterators share the storage until the last holder drops it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::entry::Entry;
use crate::error::{Result, TableError};
use crate::format::{parse_file_id, FOOTER_SIZE, TABLE_MAGIC};
use crate::iterator::TableIterator;
use crate::key::Key;

#[derive(Clone)]
pub struct Table {
    core: Arc<TableCore>,
}

struct TableCore {
    id: u64,
    path: PathBuf,
    size: i64,
    entries: Vec<Entry>,
}

impl Table {
    /// Opens and validates a table file written by `TableBuilder`.
    pub fn open(path: impl AsRef<Path>) -> Result<Table> {
        let path = path.as_ref().to_path_buf();
        let id = parse_file_id(&path)?;
        let raw = fs::read(&path)?;
        let size = raw.len() as i64;
        let data = Bytes::from(raw);
        if data.len() < FOOTER_SIZE {
            return Err(TableError::InvalidFormat("file smaller than footer".to_string()));
        }
        let footer_at = data.len() - FOOTER_SIZE;
        let count = u32::from_le_bytes([
            data[footer_at],
            data[footer_at + 1],
            data[footer_at + 2],
            data[footer_at + 3],
        ]) as usize;
        let magic = u32::from_le_bytes([
            data[footer_at + 4],
            data[footer_at + 5],
            data[footer_at + 6],
            data[footer_at + 7],
        ]);
        if magic != TABLE_MAGIC {
            return Err(TableError::InvalidFormat(format!("bad magic {:#x}", magic)));
        }

        let mut entries: Vec<Entry> = Vec::with_capacity(count);
        let mut offset = 0usize;
        while offset < footer_at {
            let (entry, consumed) = Entry::decode_at(&data, offset)?;
            if let Some(last) = entries.last() {
                if last.key >= entry.key {
                    return Err(TableError::OutOfOrder(
                        entry.key.user_key.clone(),
                        last.key.user_key.clone(),
                    ));
                }
            }
            entries.push(entry);
            offset += consumed;
        }
        if entries.len() != count {
            return Err(TableError::InvalidFormat(format!(
                "footer count {} != decoded {}",
                count,
                entries.len()
            )));
        }
        if entries.is_empty() {
            return Err(TableError::EmptyTable);
        }

        Ok(Table {
            core: Arc::new(TableCore {
                id,
                path,
                size,
                entries,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    /// File size in bytes.
    pub fn size(&self) -> i64 {
        self.core.size
    }

    pub fn len(&self) -> usize {
        self.core.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.entries.is_empty()
    }

    pub fn smallest(&self) -> &Key {
        &self.core.entries[0].key
    }

    pub fn biggest(&self) -> &Key {
        &self.core.entries[self.core.entries.len() - 1].key
    }

    pub(crate) fn entry(&self, idx: usize) -> &Entry {
        &self.core.entries[idx]
    }

    /// Index of the first record whose key is `>= key`.
    pub(crate) fn seek_idx(&self, key: &Key) -> usize {
        self.core.entries.partition_point(|e| e.key < *key)
    }

    /// Newest record for `user_key` with version `<= version`, if this
    /// table holds one.
    pub fn get(&self, user_key: &[u8], version: u64) -> Option<Entry> {
        let target = Key::new(Bytes::copy_from_slice(user_key), version);
        let idx = self.seek_idx(&target);
        let entry = self.core.entries.get(idx)?;
        if entry.key.user_key == user_key {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// True if the table contains at least one record in
    /// `[start.user_key, end.user_key]` (`include_end` selects whether the
    /// right bound is inclusive). This inspects actual records, not just
    /// the table's bounding range.
    pub fn has_overlap(&self, start: &Key, end: &Key, include_end: bool) -> bool {
        let idx = self
            .core
            .entries
            .partition_point(|e| e.key.user_key < start.user_key);
        match self.core.entries.get(idx) {
            Some(entry) => {
                if include_end {
                    entry.key.user_key <= end.user_key
                } else {
                    entry.key.user_key < end.user_key
                }
            }
            None => false,
        }
    }

    pub fn iter(&self, reversed: bool) -> TableIterator {
        TableIterator::new(self.clone(), reversed)
    }

    /// Removes the backing file. Called by the reclaimer after the last
    /// level snapshot and reader have let go of this table.
    pub fn delete_file(&self) -> Result<()> {
        fs::remove_file(&self.core.path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.core.id)
            .field("size", &self.core.size)
            .field("smallest", self.smallest())
            .field("biggest", self.biggest())
            .finish()
    }
}
