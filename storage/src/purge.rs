//! Adaptive purge (§4.D). Deletes old or already-sent readings in small
//! blocks sized to keep each DELETE under a target wall-clock budget, and
//! backs off entirely while the ingest writer holds the shared connection.

use crate::connection::{table_ref, Database};
use crate::catalog::Catalog;
use error::StorageError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use util::DbId;

pub const BLOCK_INITIAL: i64 = 200;
pub const BLOCK_MIN: i64 = 20;
pub const BLOCK_MAX: i64 = 1500;
pub const TARGET_MICROS: u128 = 70_000;
pub const TOLERANCE_MICROS: u128 = 7_000;
pub const RECALC_BLOCKS: u32 = 30;
pub const SLOW_BLOCK_MICROS: u128 = 150_000;
const WRITE_ACCESS_POLL: Duration = Duration::from_millis(100);

/// Tracks whether the ingest writer currently holds the shared connection,
/// so the purge loop can back off instead of spinning into BUSY retries.
#[derive(Default)]
pub struct WriteAccessGuard(AtomicI64);

impl WriteAccessGuard {
    pub fn new() -> Self {
        WriteAccessGuard(AtomicI64::new(0))
    }

    pub fn enter(&self) -> WriteAccessToken<'_> {
        self.0.fetch_add(1, Ordering::SeqCst);
        WriteAccessToken(self)
    }

    fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

pub struct WriteAccessToken<'a>(&'a WriteAccessGuard);

impl Drop for WriteAccessToken<'_> {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeOutcome {
    pub removed: i64,
    pub unsent_purged: i64,
    pub unsent_retained: i64,
    pub readings_seen: i64,
}

/// What determines which rows are eligible for deletion.
pub enum PurgeCriterion {
    /// Delete rows with `ts` older than this many seconds.
    OlderThanSeconds(i64),
    /// Keep only the newest `keep_rows` rows per table.
    ExcessRows { keep_rows: i64 },
}

pub struct PurgeEngine {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    write_access: Arc<WriteAccessGuard>,
    block_size: AtomicI64,
}

impl PurgeEngine {
    pub fn new(db: Arc<Database>, catalog: Arc<Catalog>, write_access: Arc<WriteAccessGuard>) -> Self {
        PurgeEngine { db, catalog, write_access, block_size: AtomicI64::new(BLOCK_INITIAL) }
    }

    /// Runs one purge pass across every catalogued table under `criterion`,
    /// honoring the `highest_sent_id` watermark so unsent readings are never
    /// removed unless `force_unsent` explicitly allows it.
    pub fn run(&self, criterion: &PurgeCriterion, highest_sent_id: i64, force_unsent: bool) -> Result<PurgeOutcome, StorageError> {
        let db_ids: Vec<DbId> = self.catalog.all_tables().iter().map(|l| l.db_id).collect();
        let conn = self.db.open_independent(&db_ids)?;
        let mut outcome = PurgeOutcome::default();

        for location in self.catalog.all_tables() {
            let table = table_ref(location.db_id, location.table_id);
            let (min_rowid, max_rowid): (Option<i64>, Option<i64>) =
                conn.query_row(&format!("SELECT min(id), max(id) FROM {table}"), [], |r| Ok((r.get(0)?, r.get(1)?)))?;
            let (Some(min_rowid), Some(max_rowid)) = (min_rowid, max_rowid) else {
                continue;
            };
            outcome.readings_seen += max_rowid - min_rowid + 1;

            let boundary_id = match criterion {
                PurgeCriterion::OlderThanSeconds(age) => {
                    self.find_age_boundary(&conn, &table, min_rowid, max_rowid, *age)?
                }
                PurgeCriterion::ExcessRows { keep_rows } => (max_rowid - keep_rows).max(min_rowid - 1),
            };

            let cutoff = if force_unsent { boundary_id } else { boundary_id.min(highest_sent_id) };
            if cutoff < min_rowid {
                continue;
            }

            let unsent_in_range = (boundary_id - cutoff).max(0);
            outcome.unsent_retained += unsent_in_range;
            if force_unsent {
                outcome.unsent_purged += unsent_in_range;
            }

            let removed = self.delete_up_to(&conn, &table, min_rowid, cutoff)?;
            outcome.removed += removed;
        }

        Ok(outcome)
    }

    /// Binary search for the highest `id` whose `user_ts` is still older
    /// than `age_seconds`, since rows are monotonically ordered by insertion
    /// id. Age is measured against the caller-supplied `user_ts`, not the
    /// server ingest `ts`, so retention follows when the reading actually
    /// happened.
    fn find_age_boundary(
        &self,
        conn: &rusqlite::Connection,
        table: &str,
        min_rowid: i64,
        max_rowid: i64,
        age_seconds: i64,
    ) -> Result<i64, StorageError> {
        let mut lo = min_rowid;
        let mut hi = max_rowid;
        let mut boundary = min_rowid - 1;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let age: i64 = conn.query_row(
                &format!("SELECT CAST(strftime('%s', 'now') - strftime('%s', user_ts) AS INTEGER) FROM {table} WHERE id = ?1"),
                [mid],
                |r| r.get(0),
            )?;
            if age >= age_seconds {
                boundary = mid;
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        Ok(boundary)
    }

    /// Deletes `[min_rowid, cutoff]` from `table` in adaptively-sized
    /// blocks, waiting out any ongoing write access and recalculating the
    /// block size every `RECALC_BLOCKS` deletes to hold each delete near
    /// `TARGET_MICROS`.
    fn delete_up_to(&self, conn: &rusqlite::Connection, table: &str, min_rowid: i64, cutoff: i64) -> Result<i64, StorageError> {
        let mut removed = 0i64;
        let mut next = min_rowid;
        let mut blocks_since_recalc = 0u32;
        let mut micros_since_recalc = 0u128;

        while next <= cutoff {
            while self.write_access.is_busy() {
                thread::sleep(WRITE_ACCESS_POLL);
            }

            let block = self.block_size.load(Ordering::SeqCst);
            let upper = (next + block - 1).min(cutoff);

            let start = Instant::now();
            let deleted = conn.execute(&format!("DELETE FROM {table} WHERE id BETWEEN ?1 AND ?2"), [next, upper])?;
            let elapsed = start.elapsed().as_micros();

            removed += deleted as i64;
            next = upper + 1;
            blocks_since_recalc += 1;
            micros_since_recalc += elapsed;

            if elapsed > SLOW_BLOCK_MICROS {
                thread::sleep(Duration::from_micros(100) + Duration::from_micros((elapsed / 10_000) as u64));
            }

            if blocks_since_recalc >= RECALC_BLOCKS {
                self.recalc_block_size(micros_since_recalc / blocks_since_recalc as u128);
                blocks_since_recalc = 0;
                micros_since_recalc = 0;
                thread::sleep(Duration::from_millis(100));
            }
        }

        if removed > 0 {
            debug!(table, removed, "purged rows");
        }
        Ok(removed)
    }

    /// Scales the block size towards `TARGET_MICROS`, clamped to
    /// `[0.5x, 2.0x]` per adjustment and rounded down to a multiple of 5
    /// within `[BLOCK_MIN, BLOCK_MAX]`.
    fn recalc_block_size(&self, avg_micros: u128) {
        if avg_micros == 0 {
            return;
        }
        let deviation = avg_micros.abs_diff(TARGET_MICROS);
        if deviation <= TOLERANCE_MICROS {
            return;
        }

        let current = self.block_size.load(Ordering::SeqCst);
        let raw_scale = TARGET_MICROS as f64 / avg_micros as f64;
        let scale = raw_scale.clamp(0.5, 2.0);
        let scaled = ((current as f64) * scale).round() as i64;
        let rounded = (scaled / 5) * 5;
        let clamped = rounded.clamp(BLOCK_MIN, BLOCK_MAX);

        if clamped != current {
            info!(old = current, new = clamped, avg_micros, "retuned purge block size");
            self.block_size.store(clamped, Ordering::SeqCst);
        }
    }

    pub fn block_size(&self) -> i64 {
        self.block_size.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawReading, StorageEngine};
    use serde_json::json;

    fn seeded() -> (tempfile::TempDir, Arc<Database>, Arc<Catalog>, StorageEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let catalog = Arc::new(Catalog::load(db.clone(), 4).unwrap());
        let engine = StorageEngine::new(db.clone(), catalog.clone());
        (dir, db, catalog, engine)
    }

    #[test]
    fn purges_excess_rows_keeping_newest() {
        let (_dir, db, catalog, engine) = seeded();
        for i in 0..10 {
            engine
                .append_readings(&[RawReading { asset_code: "A".into(), payload: json!({"v": i}), user_ts: None }])
                .unwrap();
        }
        let write_access = Arc::new(WriteAccessGuard::new());
        let purge = PurgeEngine::new(db, catalog, write_access);
        let outcome = purge.run(&PurgeCriterion::ExcessRows { keep_rows: 3 }, i64::MAX, true).unwrap();
        assert_eq!(outcome.removed, 7);
    }

    #[test]
    fn retains_unsent_rows_unless_forced() {
        let (_dir, db, catalog, engine) = seeded();
        let mut last_id = 0;
        for i in 0..5 {
            let outcomes = engine
                .append_readings(&[RawReading { asset_code: "A".into(), payload: json!({"v": i}), user_ts: None }])
                .unwrap();
            if let crate::engine::AppendOutcome::Stored { global_id } = &outcomes[0] {
                last_id = *global_id;
            }
        }
        let write_access = Arc::new(WriteAccessGuard::new());
        let purge = PurgeEngine::new(db, catalog, write_access);
        // Nothing has been marked sent (highest_sent_id stays at 0), so an
        // unforced excess-rows purge must not remove anything.
        let outcome = purge.run(&PurgeCriterion::ExcessRows { keep_rows: 0 }, 0, false).unwrap();
        assert_eq!(outcome.removed, 0);
        assert!(outcome.unsent_retained >= last_id);
    }

    #[test]
    fn purges_by_age_against_user_ts_not_server_ts() {
        let (_dir, db, catalog, engine) = seeded();
        // Server `ts` is always "now" at insert time; only a fix that ages
        // rows off `user_ts` can tell this reading apart from a fresh one.
        engine
            .append_readings(&[RawReading {
                asset_code: "A".into(),
                payload: json!({"v": 1}),
                user_ts: Some("2000-01-01 00:00:00".to_string()),
            }])
            .unwrap();
        engine
            .append_readings(&[RawReading { asset_code: "A".into(), payload: json!({"v": 2}), user_ts: None }])
            .unwrap();

        let write_access = Arc::new(WriteAccessGuard::new());
        let purge = PurgeEngine::new(db, catalog, write_access);
        let outcome = purge.run(&PurgeCriterion::OlderThanSeconds(3600), i64::MAX, true).unwrap();
        assert_eq!(outcome.removed, 1);
    }

    #[test]
    fn block_size_starts_at_initial_value() {
        let (_dir, db, catalog, _engine) = seeded();
        let write_access = Arc::new(WriteAccessGuard::new());
        let purge = PurgeEngine::new(db, catalog, write_access);
        assert_eq!(purge.block_size(), BLOCK_INITIAL);
    }
}
