//! Typed error hierarchy shared across the readings crates.
//!
//! Every crate boundary in this workspace returns one of these enums rather
//! than a bare `String`: callers match on variants to decide whether a
//! failure is retriable, a discard, or fatal for the current batch.

use thiserror::Error;

/// Which kind of statement the retry executor was stepping when it gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Exec,
    PreparedInsert,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatementKind::Exec => write!(f, "exec"),
            StatementKind::PreparedInsert => write!(f, "prepared-insert"),
        }
    }
}

/// Errors surfaced by the catalogue and storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{kind} retries exhausted after {attempts} attempts")]
    RetryExhausted {
        kind: StatementKind,
        attempts: u32,
    },

    #[error("invalid reading payload: {0}")]
    InvalidPayload(String),

    #[error("invalid query document: {0}")]
    QuerySchema(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the ingest queue, flush scheduler and filter pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid reading payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("pipeline is not running")]
    PipelineStopped,
}
