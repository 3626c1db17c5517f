//! The readings catalogue (§4.B): asset→table name resolution, physical
//! layout, global-id issuance and pre-allocation.

use crate::connection::{table_ref, Database};
use error::StorageError;
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;
use util::{DbId, GlobalId, TableId};

const READINGS_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reading JSON,
    user_ts DATETIME,
    ts DATETIME
);
CREATE INDEX IF NOT EXISTS {table}_user_ts_idx ON {table}(user_ts);
";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssetLocation {
    pub table_id: TableId,
    pub db_id: DbId,
}

pub struct Catalog {
    db: Arc<Database>,
    assets: RwLock<HashMap<String, AssetLocation>>,
    max_table_id: AtomicI64,
    active_db_id: AtomicI64,
    /// Tables that physically exist (pre-allocated or left over from a
    /// previous run) but have no catalogue row yet, per db file.
    free_tables: std::sync::Mutex<HashMap<DbId, Vec<TableId>>>,
    readings_to_allocate: usize,
    global_id: GlobalId,
}

impl Catalog {
    /// Startup load (§4.B): reads the catalogue table, computes `max_db_id`,
    /// boots the global id (adopting the stored value or recomputing
    /// `max(id)+1` across every readings table), and tops up the active
    /// database's pre-allocated table pool.
    pub fn load(db: Arc<Database>, readings_to_allocate: usize) -> Result<Self, StorageError> {
        let rows: Vec<(TableId, DbId, String)> = db.with(|c| {
            let mut stmt = c.prepare("SELECT table_id, db_id, asset_code FROM asset_reading_catalogue")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut assets = HashMap::new();
        let mut max_db_id: DbId = 1;
        let mut max_table_id: TableId = 0;
        let mut bound: HashMap<DbId, HashSet<TableId>> = HashMap::new();
        for (table_id, db_id, asset_code) in rows {
            assets.insert(asset_code, AssetLocation { table_id, db_id });
            max_db_id = max_db_id.max(db_id);
            max_table_id = max_table_id.max(table_id);
            bound.entry(db_id).or_default().insert(table_id);
        }

        for db_id in 2..=max_db_id {
            db.ensure_attached(db_id)?;
        }

        let global_id = Self::boot_global_id(&db, max_db_id)?;

        let catalog = Catalog {
            db,
            assets: RwLock::new(assets),
            max_table_id: AtomicI64::new(max_table_id),
            active_db_id: AtomicI64::new(max_db_id),
            free_tables: std::sync::Mutex::new(HashMap::new()),
            readings_to_allocate,
            global_id,
        };

        let existing_free = catalog.scan_physical_tables(max_db_id, bound.get(&max_db_id))?;
        catalog.free_tables.lock().unwrap().insert(max_db_id, existing_free);
        catalog.top_up_free_tables(max_db_id)?;

        Ok(catalog)
    }

    /// Global-ID boot (§4.B / §3): adopt the stored value if it is `>= 1`,
    /// else recompute `max(id)+1` across every readings table. Either way the
    /// stored value is immediately forced to `-1` so a crash forces
    /// recomputation at the next boot; a graceful shutdown writes the real
    /// value back (`persist_on_shutdown`).
    fn boot_global_id(db: &Database, max_db_id: DbId) -> Result<GlobalId, StorageError> {
        let stored: Option<i64> = db.with(|c| {
            c.query_row("SELECT global_id FROM configuration_readings LIMIT 1", [], |r| r.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
        })?;

        let next = if let Some(stored) = stored {
            if stored >= 1 {
                stored
            } else {
                Self::recompute_next_id(db, max_db_id)?
            }
        } else {
            Self::recompute_next_id(db, max_db_id)?
        };

        db.with(|c| {
            c.execute("DELETE FROM configuration_readings", [])?;
            c.execute("INSERT INTO configuration_readings(global_id) VALUES (-1)", [])
        })?;

        info!(next, "booted global reading id");
        Ok(GlobalId::new(next))
    }

    fn recompute_next_id(db: &Database, max_db_id: DbId) -> Result<i64, StorageError> {
        let table_ids: Vec<(TableId, DbId)> = db.with(|c| {
            let mut stmt = c.prepare("SELECT table_id, db_id FROM asset_reading_catalogue")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect();
            rows
        })?;

        if table_ids.is_empty() {
            let _ = max_db_id;
            return Ok(1);
        }

        let selects: Vec<String> = table_ids
            .iter()
            .map(|(table_id, db_id)| format!("SELECT max(id) AS m FROM {}", table_ref(*db_id, *table_id)))
            .collect();
        let sql = format!("SELECT max(m) FROM ({})", selects.join(" UNION ALL "));
        let max_id: Option<i64> = db.with(|c| c.query_row(&sql, [], |r| r.get(0)))?;
        Ok(max_id.unwrap_or(0) + 1)
    }

    /// Writes the real next-id back on a clean shutdown, so the next boot
    /// adopts `last issued + 1` instead of recomputing via `max(id)`.
    pub fn persist_on_shutdown(&self) -> Result<(), StorageError> {
        let next = self.global_id.peek();
        self.db
            .with(|c| c.execute("UPDATE configuration_readings SET global_id = ?1", params![next]))?;
        Ok(())
    }

    pub fn next_global_id(&self) -> i64 {
        self.global_id.next()
    }

    /// `getReadingReference`: fast lock-free-read path, falling back to the
    /// allocating slow path under the catalogue mutex on first sight of an
    /// asset.
    pub fn get_table(&self, asset_code: &str) -> Result<AssetLocation, StorageError> {
        if let Some(loc) = self.assets.read().unwrap().get(asset_code).copied() {
            return Ok(loc);
        }

        let mut assets = self.assets.write().unwrap();
        if let Some(loc) = assets.get(asset_code).copied() {
            return Ok(loc);
        }

        let loc = self.allocate_table(asset_code)?;
        assets.insert(asset_code.to_string(), loc);
        Ok(loc)
    }

    fn allocate_table(&self, asset_code: &str) -> Result<AssetLocation, StorageError> {
        let mut db_id = self.active_db_id.load(Ordering::SeqCst);
        let table_id = {
            let mut free = self.free_tables.lock().unwrap();
            match free.get_mut(&db_id).and_then(|v| v.pop()) {
                Some(id) => id,
                None => {
                    drop(free);
                    db_id = self.expand_new_db()?;
                    let mut free = self.free_tables.lock().unwrap();
                    free.get_mut(&db_id)
                        .and_then(|v| v.pop())
                        .expect("new database was just pre-allocated")
                }
            }
        };

        self.db.with(|c| {
            c.execute(
                "INSERT INTO asset_reading_catalogue(table_id, db_id, asset_code) VALUES (?1, ?2, ?3)",
                params![table_id, db_id, asset_code],
            )
        })?;

        Ok(AssetLocation { table_id, db_id })
    }

    /// New-DB expansion: bump `db_id`, attach the new file, and pre-allocate
    /// `readings_to_allocate` tables in it.
    fn expand_new_db(&self) -> Result<DbId, StorageError> {
        let db_id = self.active_db_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.db.ensure_attached(db_id)?;
        self.free_tables.lock().unwrap().insert(db_id, Vec::new());
        self.top_up_free_tables(db_id)?;
        info!(db_id, "expanded to a new readings database file");
        Ok(db_id)
    }

    /// Creates new `readings_<k>` tables until `db_id`'s free pool reaches
    /// `readings_to_allocate`.
    fn top_up_free_tables(&self, db_id: DbId) -> Result<(), StorageError> {
        loop {
            let need = {
                let free = self.free_tables.lock().unwrap();
                let have = free.get(&db_id).map(|v| v.len()).unwrap_or(0);
                self.readings_to_allocate.saturating_sub(have)
            };
            if need == 0 {
                break;
            }
            let table_id = self.max_table_id.fetch_add(1, Ordering::SeqCst) + 1;
            let table = table_ref(db_id, table_id);
            let ddl = READINGS_TABLE_SCHEMA.replace("{table}", &table);
            self.db.with(|c| c.execute_batch(&ddl))?;
            self.free_tables.lock().unwrap().entry(db_id).or_default().push(table_id);
        }
        Ok(())
    }

    /// Finds physically-existing `readings_<k>` tables in `db_id` that have
    /// no catalogue row yet (left over from a previous run's
    /// pre-allocation), so a restart does not keep creating new tables
    /// forever.
    fn scan_physical_tables(&self, db_id: DbId, bound: Option<&HashSet<TableId>>) -> Result<Vec<TableId>, StorageError> {
        let schema = if db_id == 1 { "main".to_string() } else { format!("readings_{db_id}") };
        let sql = format!(
            "SELECT name FROM {schema}.sqlite_master WHERE type='table' AND name LIKE 'readings\\_%' ESCAPE '\\'"
        );
        let names: Vec<String> = self.db.with(|c| {
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map([], |r| r.get(0))?.collect();
            rows
        })?;

        let mut free = Vec::new();
        for name in names {
            if let Some(id_str) = name.strip_prefix("readings_") {
                if let Ok(table_id) = id_str.parse::<TableId>() {
                    let is_bound = bound.map(|b| b.contains(&table_id)).unwrap_or(false);
                    if !is_bound {
                        free.push(table_id);
                    }
                }
            }
        }
        Ok(free)
    }

    pub fn all_tables(&self) -> Vec<AssetLocation> {
        self.assets.read().unwrap().values().copied().collect()
    }

    /// Same as [`Self::all_tables`] but keeps the asset code each location
    /// belongs to, for callers (the query compiler) that need to tag rows by
    /// their source asset after folding tables together.
    pub fn asset_tables(&self) -> Vec<(String, AssetLocation)> {
        self.assets.read().unwrap().iter().map(|(asset, loc)| (asset.clone(), *loc)).collect()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let catalog = Catalog::load(db, 2).unwrap();
        (dir, catalog)
    }

    #[test]
    fn assigns_one_table_per_asset_and_reuses_it() {
        let (_dir, catalog) = new_catalog();
        let a1 = catalog.get_table("A").unwrap();
        let a2 = catalog.get_table("A").unwrap();
        assert_eq!(a1, a2);
        let b1 = catalog.get_table("B").unwrap();
        assert_ne!(a1.table_id, b1.table_id);
        assert_eq!(catalog.asset_count(), 2);
    }

    #[test]
    fn global_id_is_strictly_increasing() {
        let (_dir, catalog) = new_catalog();
        let first = catalog.next_global_id();
        let second = catalog.next_global_id();
        assert!(second > first);
    }

    #[test]
    fn expands_to_new_db_when_pool_exhausted() {
        let (_dir, catalog) = new_catalog();
        // readings_to_allocate=2, so the third asset forces a new db file.
        catalog.get_table("A").unwrap();
        catalog.get_table("B").unwrap();
        let third = catalog.get_table("C").unwrap();
        assert_eq!(third.db_id, 2);
    }
}
