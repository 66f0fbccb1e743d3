//! kombu-table: immutable sorted-table storage for the kombu LSM engine.
//!
//! A table is an immutable sorted run of versioned key/value records,
//! addressed by a unique file id and backed by a single `<id>.sst` file.
//! Tables are created once by a [`TableBuilder`], then shared read-only
//! (cheap clones over an `Arc`) by level snapshots, iterators and the
//! compaction executor until the engine retires them.
//!
//! # Ordering
//!
//! Records are ordered by `(user_key ascending, version descending)`:
//! the newest version of a user key always sorts first. Within one table
//! keys are strictly increasing under that order.
//!
//! # What lives here
//!
//! - [`Key`] / [`ValueStruct`]: the versioned record model
//! - [`Entry`] encode/decode: varint-framed records with a crc32c trailer
//! - [`Table`]: file-backed reader exposing the query surface
//!   (`smallest`, `biggest`, `size`, `has_overlap`, iteration)
//! - [`TableBuilder`]: sorted writer producing `<id>.sst` files
//! - [`ConcatIterator`] / [`MergeIterator`]: composition of sorted runs
//! - [`RateLimiter`]: token bucket bounding builder write bandwidth

pub mod builder;
pub mod entry;
pub mod error;
pub mod format;
pub mod iterator;
pub mod key;
pub mod rate;
pub mod table;

pub use builder::{BuildResult, TableBuilder};
pub use entry::Entry;
pub use error::{Result, TableError};
pub use format::{new_filename, parse_file_id};
pub use iterator::{ConcatIterator, KvIterator, MemIterator, MergeIterator, TableIterator};
pub use key::{is_deleted, Key, ValueStruct, BIT_DELETE};
pub use rate::RateLimiter;
pub use table::Table;
