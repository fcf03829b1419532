use std::num::ParseIntError;

use thiserror::Error;

/// Failure inside the record log. Reported to peers as a literal error line,
/// never fatal to the connection that hit it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("record store lock poisoned")]
    Poisoned,

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A line that looked like a request but could not be understood.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid record id {raw:?}: {source}")]
    InvalidRecordId {
        raw: String,
        #[source]
        source: ParseIntError,
    },
}
