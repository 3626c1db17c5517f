//! The SQL retry executor (§4.A). Every statement execution in this crate
//! goes through one of the two functions here; nothing else retries.

use error::{StatementKind, StorageError};
use rand::Rng;
use rusqlite::ErrorCode;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Base backoff for the short exec/read retry path.
pub const RETRY_BACKOFF: Duration = Duration::from_micros(100);
pub const MAX_RETRIES: u32 = 40;

/// Base + jitter backoff for the bulk prepared-INSERT path.
pub const PREP_CMD_RETRY_BASE: Duration = Duration::from_millis(5);
pub const PREP_CMD_RETRY_JITTER: Duration = Duration::from_millis(5);
pub const PREP_CMD_MAX_RETRIES: u32 = 20;

fn is_busy_or_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Retries `op` on BUSY/LOCKED with `retries * RETRY_BACKOFF` sleeps, up to
/// `MAX_RETRIES`. Used for short exec/read statements.
pub fn retry_exec<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StorageError> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_or_locked(&err) && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(attempt, kind = %StatementKind::Exec, "statement busy/locked, retrying");
                thread::sleep(RETRY_BACKOFF * attempt);
            }
            Err(err) if is_busy_or_locked(&err) => {
                error!(attempts = attempt, kind = %StatementKind::Exec, "retries exhausted");
                return Err(StorageError::RetryExhausted {
                    kind: StatementKind::Exec,
                    attempts: attempt,
                });
            }
            Err(err) => return Err(StorageError::Sqlite(err)),
        }
    }
}

/// Retries `op` on BUSY/LOCKED with `PREP_CMD_RETRY_BASE + rand(0..PREP_CMD_RETRY_JITTER)`
/// sleeps, up to `PREP_CMD_MAX_RETRIES`. Used for the batched prepared-INSERT
/// path where ingest writers contend with the purge loop.
pub fn retry_prepared_insert<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StorageError> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_or_locked(&err) && attempt < PREP_CMD_MAX_RETRIES => {
                attempt += 1;
                let jitter_micros = rand::thread_rng().gen_range(0..=PREP_CMD_RETRY_JITTER.as_micros() as u64);
                let jitter = Duration::from_micros(jitter_micros);
                warn!(attempt, kind = %StatementKind::PreparedInsert, "insert busy/locked, retrying");
                thread::sleep(PREP_CMD_RETRY_BASE + jitter);
            }
            Err(err) if is_busy_or_locked(&err) => {
                error!(attempts = attempt, kind = %StatementKind::PreparedInsert, "retries exhausted");
                return Err(StorageError::RetryExhausted {
                    kind: StatementKind::PreparedInsert,
                    attempts: attempt,
                });
            }
            Err(err) => return Err(StorageError::Sqlite(err)),
        }
    }
}
