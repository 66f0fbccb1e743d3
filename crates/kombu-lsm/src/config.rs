//! Engine options and collaborator interfaces.
//!
//! [`Options`] is plain serializable data; the function-valued
//! collaborators (id allocation, compaction filters, meta-change
//! listener, blob store) are passed separately as [`Hooks`] when the
//! engine is opened.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::changeset::ChangeSet;
use crate::error::{Error, Result};

/// Params for opening an engine.
///
/// [`Options::default`] should work for most applications; adjust from
/// there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Directory to store the data in. Created if missing.
    pub dir: PathBuf,

    /// Each mem table is at most this size. Consumed by the write path;
    /// carried here so one options struct configures the whole engine.
    pub max_mem_table_size: i64,

    /// Maximum number of L0 tables before compaction kicks in.
    pub num_level_zero_tables: usize,

    /// At this many L0 tables the write path stalls until L0 is
    /// compacted away.
    pub num_level_zero_tables_stall: usize,

    /// Maximum total size for L1. Each deeper level targets 10x the
    /// previous.
    pub level_one_size: i64,

    /// Number of compaction workers to run concurrently.
    pub num_compactors: usize,

    /// Stops the planner loop entirely (testing).
    pub do_not_compact: bool,

    pub table_builder_options: TableBuilderOptions,

    /// Per column-family configuration; the vector length fixes the
    /// number of CFs.
    pub cfs: Vec<CfConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TableBuilderOptions {
    /// Output table size cap; the executor rotates files past this.
    pub max_table_size: i64,

    /// Compaction write-bandwidth limit; `-1` = unlimited.
    pub bytes_per_second: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CfConfig {
    /// When true the CF uses the externally supplied managed safe-ts;
    /// otherwise the tracker's safe-ts.
    pub managed: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("kombu-data"),
            max_mem_table_size: 16 << 20,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 10,
            level_one_size: 16 << 20,
            num_compactors: 3,
            do_not_compact: false,
            table_builder_options: TableBuilderOptions {
                max_table_size: 8 << 20,
                bytes_per_second: -1,
            },
            cfs: vec![
                CfConfig { managed: true },
                CfConfig { managed: false },
                CfConfig { managed: true },
            ],
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.cfs.is_empty() {
            return Err(Error::Config("at least one CF is required".to_string()));
        }
        if self.level_one_size <= 0 {
            return Err(Error::Config("level_one_size must be positive".to_string()));
        }
        if self.num_level_zero_tables == 0 {
            return Err(Error::Config(
                "num_level_zero_tables must be positive".to_string(),
            ));
        }
        if self.num_compactors == 0 {
            return Err(Error::Config("num_compactors must be positive".to_string()));
        }
        if self.table_builder_options.max_table_size <= 0 {
            return Err(Error::Config("max_table_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Allocates file ids, monotonically unique across all files of the
/// engine.
pub trait IdAllocator: Send + Sync {
    fn alloc_id(&self) -> u64;
}

/// In-process allocator backed by an atomic counter.
pub struct LocalIdAllocator {
    latest: AtomicU64,
}

impl LocalIdAllocator {
    pub fn new(latest: u64) -> Self {
        Self {
            latest: AtomicU64::new(latest),
        }
    }
}

impl IdAllocator for LocalIdAllocator {
    fn alloc_id(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Compaction filter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The entry should be preserved.
    Keep,
    /// Convert the entry to a delete tombstone.
    MarkTombstone,
    /// Drop the entry entirely, without leaving a tombstone.
    Drop,
}

/// User hook to remove certain keys during compaction.
///
/// Invoked at most once per retained version below the GC watermark;
/// must be pure and fast.
pub trait CompactionFilter: Send {
    fn filter(&self, cf: usize, key: &[u8], value: &[u8], user_meta: &[u8]) -> Decision;
}

/// Builds a filter tailored to one compaction job's target level and key
/// range.
pub type CompactionFilterFactory =
    Box<dyn Fn(usize, &[u8], &[u8]) -> Box<dyn CompactionFilter> + Send + Sync>;

/// Observes change sets instead of letting the engine install them
/// locally. When configured, the engine defers installation until the
/// listener replays the change set through `Engine::apply_change_set`.
pub trait MetaChangeListener: Send + Sync {
    fn on_change(&self, cs: ChangeSet);
}

/// One deferred blob transfer.
pub type BlobTask = Box<dyn FnOnce() -> Result<()> + Send>;

/// Optional object-storage client used to replicate table files.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Runs a batch of transfers; the default runs them sequentially.
    fn batch_schedule(&self, tasks: Vec<BlobTask>) -> Result<()> {
        for task in tasks {
            task()?;
        }
        Ok(())
    }
}

/// Object key for a table file.
pub fn blob_key(id: u64) -> String {
    format!("{:08}.sst", id)
}

/// Function-valued collaborators supplied at open time.
#[derive(Default)]
pub struct Hooks {
    pub id_allocator: Option<Arc<dyn IdAllocator>>,
    pub compaction_filter_factory: Option<CompactionFilterFactory>,
    pub meta_change_listener: Option<Arc<dyn MetaChangeListener>>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_level_one_size() {
        let opts = Options {
            level_one_size: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_cfs() {
        let opts = Options {
            cfs: vec![],
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_local_id_allocator_monotonic() {
        let alloc = LocalIdAllocator::new(10);
        let a = alloc.alloc_id();
        let b = alloc.alloc_id();
        assert_eq!(a, 11);
        assert_eq!(b, 12);
    }

    #[test]
    fn test_options_serde_roundtrip() {
        let opts = Options::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_compactors, opts.num_compactors);
        assert_eq!(back.cfs.len(), opts.cfs.len());
    }
}
