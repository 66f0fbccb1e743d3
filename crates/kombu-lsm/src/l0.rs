//! Shard L0 tables.
//!
//! An L0 table is the durable image of one flushed mem table: it spans
//! every column family of its shard and carries the commit timestamp of
//! the flush. The shard keeps its L0 tables in a pool ordered newest
//! first (commit-ts descending); tables in the pool may overlap freely.
//!
//! File layout (`<id>.sst`, same id space as sorted tables):
//! - magic: u32 LE
//! - commit_ts: u64 LE
//! - cf_count: u32 LE
//! - per CF: record count (u32 LE) + that many record frames

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use kombu_table::{parse_file_id, Entry, Key, MemIterator};

use crate::error::{Error, Result};

const L0_MAGIC: u32 = 0x4B4D_424C; // "KMBL"

pub struct L0Table {
    id: u64,
    commit_ts: u64,
    size: i64,
    path: PathBuf,
    cfs: Vec<Arc<Vec<Entry>>>,
}

impl L0Table {
    /// Writes an L0 file from per-CF sorted record vectors.
    pub fn build(path: &Path, commit_ts: u64, cf_entries: &[Vec<Entry>]) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(L0_MAGIC);
        buf.put_u64_le(commit_ts);
        buf.put_u32_le(cf_entries.len() as u32);
        for entries in cf_entries {
            buf.put_u32_le(entries.len() as u32);
            for entry in entries {
                entry.encode(&mut buf);
            }
        }
        let file = path.with_extension("tmp");
        fs::write(&file, &buf)?;
        fs::rename(&file, path)?;
        Ok(())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<L0Table> {
        let path = path.as_ref().to_path_buf();
        let id = parse_file_id(&path)?;
        let raw = fs::read(&path)?;
        let size = raw.len() as i64;
        let data = Bytes::from(raw);
        if data.len() < 16 {
            return Err(Error::Manifest(format!("L0 file {} truncated", id)));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != L0_MAGIC {
            return Err(Error::Manifest(format!("L0 file {} bad magic", id)));
        }
        let commit_ts = u64::from_le_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let cf_count = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;

        let mut offset = 16usize;
        let mut cfs = Vec::with_capacity(cf_count);
        for _ in 0..cf_count {
            if offset + 4 > data.len() {
                return Err(Error::Manifest(format!("L0 file {} truncated", id)));
            }
            let count = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let (entry, consumed) = Entry::decode_at(&data, offset)?;
                entries.push(entry);
                offset += consumed;
            }
            cfs.push(Arc::new(entries));
        }

        Ok(L0Table {
            id,
            commit_ts,
            size,
            path,
            cfs,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn commit_ts(&self) -> u64 {
        self.commit_ts
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_cfs(&self) -> usize {
        self.cfs.len()
    }

    /// Newest record for `user_key` in `cf` with version `<= version`.
    pub fn get(&self, cf: usize, user_key: &[u8], version: u64) -> Option<Entry> {
        let entries = self.cfs.get(cf)?;
        let target = Key::new(Bytes::copy_from_slice(user_key), version);
        let idx = entries.partition_point(|e| e.key < target);
        let entry = entries.get(idx)?;
        if entry.key.user_key == user_key {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Iterator over one CF's records; `None` when the CF holds nothing
    /// in this table.
    pub fn iter(&self, cf: usize, reversed: bool) -> Option<MemIterator> {
        let entries = self.cfs.get(cf)?;
        if entries.is_empty() {
            return None;
        }
        Some(MemIterator::new(entries.clone(), reversed))
    }

    /// Bounding user keys across every CF, for change-set metadata.
    pub fn bounds(&self) -> Option<(Bytes, Bytes)> {
        let mut smallest: Option<Bytes> = None;
        let mut biggest: Option<Bytes> = None;
        for entries in &self.cfs {
            if let Some(first) = entries.first() {
                let last = &entries[entries.len() - 1];
                if smallest
                    .as_ref()
                    .is_none_or(|s| first.key.user_key < *s)
                {
                    smallest = Some(first.key.user_key.clone());
                }
                if biggest.as_ref().is_none_or(|b| last.key.user_key > *b) {
                    biggest = Some(last.key.user_key.clone());
                }
            }
        }
        Some((smallest?, biggest?))
    }

    pub fn delete_file(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// The shard's L0 pool snapshot: tables ordered commit-ts descending
/// (newest first).
pub struct L0Tables {
    pub tables: Vec<Arc<L0Table>>,
}

impl L0Tables {
    pub fn new(tables: Vec<Arc<L0Table>>) -> Self {
        Self { tables }
    }

    pub fn total_size(&self) -> i64 {
        self.tables.iter().map(|t| t.size()).sum()
    }
}
