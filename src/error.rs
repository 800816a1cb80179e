use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the collection pipeline.
///
/// Only `FatalStartup` and `Configuration` are meant to escape a run; every
/// other variant is logged and absorbed by the component that hit it.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("cannot prepare {path}: {source}")]
    FatalStartup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint {path} was not made durable: {source}")]
    Durability {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt checkpoint line {path}:{line}: {reason}")]
    CorruptCheckpointLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("record write failed: {0}")]
    TransientIo(String),
    #[error("collection queue is closed")]
    QueueClosed,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
