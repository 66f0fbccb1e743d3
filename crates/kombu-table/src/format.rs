//! File naming and footer layout.

use std::path::{Path, PathBuf};

use crate::error::{Result, TableError};

/// Magic trailer identifying a table file.
pub const TABLE_MAGIC: u32 = 0x4B4D_4254; // "KMBT"

/// Footer: record count (u32 LE) + magic (u32 LE).
pub const FOOTER_SIZE: usize = 8;

pub const TABLE_FILE_SUFFIX: &str = ".sst";

/// Returns the table file path for `id` under `dir`: `<id>.sst`,
/// zero-padded so lexicographic listing matches allocation order.
pub fn new_filename(id: u64, dir: &Path) -> PathBuf {
    dir.join(format!("{:08}{}", id, TABLE_FILE_SUFFIX))
}

/// Parses the file id out of a `<id>.sst` path.
pub fn parse_file_id(path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TableError::BadFileName(path.to_path_buf()))?;
    let stem = name
        .strip_suffix(TABLE_FILE_SUFFIX)
        .ok_or_else(|| TableError::BadFileName(path.to_path_buf()))?;
    stem.parse::<u64>()
        .map_err(|_| TableError::BadFileName(path.to_path_buf()))
}
