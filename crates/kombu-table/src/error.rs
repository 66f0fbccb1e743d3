use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid table format: {0}")]
    InvalidFormat(String),

    #[error("crc mismatch: expected {expected:#x}, actual {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("record truncated")]
    Incomplete,

    #[error("not a table file name: {0}")]
    BadFileName(PathBuf),

    #[error("table has no records")]
    EmptyTable,

    #[error("keys added out of order: {0:?} after {1:?}")]
    OutOfOrder(bytes::Bytes, bytes::Bytes),
}

pub type Result<T> = std::result::Result<T, TableError>;
