//! Sorted-table builder.
//!
//! Writes records in key order to a `<id>.sst` file, tracks the bounding
//! keys, and seals the file with a count + magic footer. A builder is
//! reused across output files via [`TableBuilder::reset`] so one
//! compaction allocates its scratch buffer once.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;

use crate::entry::Entry;
use crate::error::{Result, TableError};
use crate::format::{parse_file_id, TABLE_MAGIC};
use crate::key::{Key, ValueStruct};
use crate::rate::RateLimiter;

/// Outcome of one sealed table file.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub id: u64,
    pub path: PathBuf,
    pub smallest: Key,
    pub biggest: Key,
    pub size: i64,
}

pub struct TableBuilder {
    id: u64,
    path: PathBuf,
    file: Option<File>,
    buf: BytesMut,
    written: usize,
    count: u32,
    smallest: Key,
    biggest: Key,
    limiter: Option<Arc<RateLimiter>>,
}

impl TableBuilder {
    /// Creates a builder writing to `path`. The file id is parsed from the
    /// file name. `limiter`, when present, bounds write bandwidth.
    pub fn new(path: impl AsRef<Path>, limiter: Option<Arc<RateLimiter>>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let id = parse_file_id(&path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            file: Some(file),
            buf: BytesMut::with_capacity(64 * 1024),
            written: 0,
            count: 0,
            smallest: Key::default(),
            biggest: Key::default(),
            limiter,
        })
    }

    /// Points the builder at a fresh output file, dropping all state from
    /// the previous one.
    pub fn reset(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.id = parse_file_id(&path)?;
        self.file = Some(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        );
        self.path = path;
        self.buf.clear();
        self.written = 0;
        self.count = 0;
        self.smallest.reset();
        self.biggest.reset();
        Ok(())
    }

    /// Appends one record. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &Key, value: &ValueStruct) -> Result<()> {
        if self.count > 0 && *key <= self.biggest {
            return Err(TableError::OutOfOrder(
                key.user_key.clone(),
                self.biggest.user_key.clone(),
            ));
        }
        let entry = Entry::new(key.clone(), value.clone());
        let n = entry.encode(&mut self.buf);
        if let Some(limiter) = &self.limiter {
            limiter.acquire(n);
        }
        if self.count == 0 {
            self.smallest = key.clone();
        }
        self.biggest = key.clone();
        self.count += 1;
        self.written += n;
        self.flush_buf(false)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes accumulated so far; the executor compares this against
    /// `max_table_size` to decide file rotation.
    pub fn estimate_size(&self) -> i64 {
        self.written as i64
    }

    /// Seals the current file: footer, flush, fsync. The builder must be
    /// `reset` before further use.
    pub fn finish(&mut self) -> Result<BuildResult> {
        if self.count == 0 {
            return Err(TableError::EmptyTable);
        }
        self.buf.extend_from_slice(&self.count.to_le_bytes());
        self.buf.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
        self.flush_buf(true)?;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| TableError::InvalidFormat("builder already finished".to_string()))?;
        file.flush()?;
        file.sync_all()?;
        Ok(BuildResult {
            id: self.id,
            path: self.path.clone(),
            smallest: self.smallest.clone(),
            biggest: self.biggest.clone(),
            size: (self.written + 8) as i64,
        })
    }

    fn flush_buf(&mut self, force: bool) -> Result<()> {
        // Write through in chunks; the buffer only holds the tail.
        if force || self.buf.len() >= 64 * 1024 {
            if let Some(file) = self.file.as_mut() {
                file.write_all(&self.buf)?;
                self.buf.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::new_filename;
    use crate::table::Table;
    use bytes::Bytes;

    #[test]
    fn test_build_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_filename(7, dir.path());
        let mut builder = TableBuilder::new(&path, None).unwrap();
        for i in 0..100u64 {
            let key = Key::new(Bytes::from(format!("key-{:04}", i)), 1);
            builder.add(&key, &ValueStruct::new(format!("val-{i}"), 1)).unwrap();
        }
        let result = builder.finish().unwrap();
        assert_eq!(result.id, 7);
        assert_eq!(result.smallest.user_key.as_ref(), b"key-0000");
        assert_eq!(result.biggest.user_key.as_ref(), b"key-0099");

        let table = Table::open(&result.path).unwrap();
        assert_eq!(table.len(), 100);
        assert_eq!(table.size(), result.size);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_filename(1, dir.path());
        let mut builder = TableBuilder::new(&path, None).unwrap();
        builder
            .add(&Key::new(&b"b"[..], 5), &ValueStruct::new(&b"v"[..], 5))
            .unwrap();
        let err = builder.add(&Key::new(&b"a"[..], 5), &ValueStruct::new(&b"v"[..], 5));
        assert!(err.is_err());
        // Same user key with an older (larger-sorting) version is fine.
        builder
            .add(&Key::new(&b"b"[..], 3), &ValueStruct::new(&b"v"[..], 3))
            .unwrap();
    }

    #[test]
    fn test_reset_reuses_builder() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = TableBuilder::new(new_filename(1, dir.path()), None).unwrap();
        builder
            .add(&Key::new(&b"a"[..], 1), &ValueStruct::new(&b"v"[..], 1))
            .unwrap();
        builder.finish().unwrap();

        builder.reset(new_filename(2, dir.path())).unwrap();
        assert!(builder.is_empty());
        builder
            .add(&Key::new(&b"z"[..], 1), &ValueStruct::new(&b"v"[..], 1))
            .unwrap();
        let result = builder.finish().unwrap();
        assert_eq!(result.id, 2);

        let table = Table::open(&result.path).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_empty_finish_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = TableBuilder::new(new_filename(3, dir.path()), None).unwrap();
        assert!(matches!(builder.finish(), Err(TableError::EmptyTable)));
    }
}
