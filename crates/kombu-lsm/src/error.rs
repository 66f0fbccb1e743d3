use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("table error: {0}")]
    Table(#[from] kombu_table::TableError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shard {0} not found")]
    ShardNotFound(u64),

    #[error("shard not match: shard {shard} expected ver {expected}, got {actual}")]
    ShardNotMatch {
        shard: u64,
        expected: u64,
        actual: u64,
    },

    #[error("shard in wrong split state")]
    WrongSplitState,

    #[error("duplicate change set")]
    DupChange,

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("compaction error: {0}")]
    Compaction(String),
}

pub type Result<T> = std::result::Result<T, Error>;
