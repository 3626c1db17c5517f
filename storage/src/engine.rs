//! The storage engine (§4.C): batched ingest writes, a binary stream
//! variant that commits every row, and the two read paths (`fetch_readings`
//! for cursor-style replay, `retrieve_readings` for the query DSL).

use crate::catalog::Catalog;
use crate::connection::{table_ref, Database};
use crate::query;
use crate::retry::retry_prepared_insert;
use error::StorageError;
use rusqlite::params;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use util::time::{format_utc, parse_user_ts};

/// One inbound reading as handed to the engine by the ingest pipeline: an
/// asset code, an arbitrary JSON payload, and an optional caller-supplied
/// timestamp string (`"now()"` or a `YYYY-MM-DD HH:MM:SS[.ffffff][±HH:MM]`
/// literal).
#[derive(Debug, Clone)]
pub struct RawReading {
    pub asset_code: String,
    pub payload: Value,
    pub user_ts: Option<String>,
}

/// Outcome of appending a single reading within a batch. A reading can be
/// individually rejected (bad payload, bad timestamp) without failing the
/// rest of the batch; only a storage-layer fault rolls back everything.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Stored { global_id: i64 },
    Rejected { reason: String },
}

pub struct StorageEngine {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
}

impl StorageEngine {
    pub fn new(db: Arc<Database>, catalog: Arc<Catalog>) -> Self {
        StorageEngine { db, catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// `appendReadings`: resolves each reading's table, parses its
    /// timestamp, and writes the whole batch in one transaction against the
    /// shared connection. A malformed individual reading is rejected without
    /// touching the transaction; a database fault rolls the whole batch back
    /// so no partial batch is ever visible.
    pub fn append_readings(&self, batch: &[RawReading]) -> Result<Vec<AppendOutcome>, StorageError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut resolved = Vec::with_capacity(batch.len());

        for reading in batch {
            match self.resolve(reading) {
                Ok(r) => resolved.push(Some(r)),
                Err(reason) => {
                    resolved.push(None);
                    outcomes.push(AppendOutcome::Rejected { reason });
                }
            }
        }

        let accepted: Vec<&ResolvedReading> = resolved.iter().flatten().collect();
        if accepted.is_empty() {
            return Ok(outcomes);
        }

        let stored_ids = self.write_batch(&accepted)?;

        let mut stored_iter = stored_ids.into_iter();
        let mut final_outcomes = Vec::with_capacity(batch.len());
        for slot in resolved {
            match slot {
                Some(_) => final_outcomes.push(AppendOutcome::Stored {
                    global_id: stored_iter.next().expect("one id per accepted reading"),
                }),
                None => final_outcomes.push(outcomes.remove(0)),
            }
        }
        Ok(final_outcomes)
    }

    fn resolve(&self, reading: &RawReading) -> Result<ResolvedReading, String> {
        if reading.asset_code.trim().is_empty() {
            return Err("empty asset code".to_string());
        }
        let user_ts = match &reading.user_ts {
            Some(raw) => parse_user_ts(raw)?,
            None => chrono::Utc::now(),
        };
        let location = self
            .catalog
            .get_table(&reading.asset_code)
            .map_err(|e| format!("catalogue lookup failed: {e}"))?;
        Ok(ResolvedReading {
            table: table_ref(location.db_id, location.table_id),
            payload: reading.payload.clone(),
            user_ts: format_utc(user_ts),
        })
    }

    /// Writes every resolved reading in one transaction, grouping prepared
    /// statements per destination table so a batch touching many assets
    /// still pays for one `prepare` per table rather than per row. Rolls
    /// back and returns `-1`-sentinel global ids on a fatal error so the
    /// caller can tell the batch was fully discarded.
    fn write_batch(&self, readings: &[&ResolvedReading]) -> Result<Vec<i64>, StorageError> {
        let ids: Vec<i64> = readings.iter().map(|_| self.catalog.next_global_id()).collect();
        let now = format_utc(chrono::Utc::now());

        let outcome = retry_prepared_insert(|| {
            self.db.with(|conn| {
                let tx = conn.unchecked_transaction()?;
                {
                    let mut cache: HashMap<&str, rusqlite::CachedStatement> = HashMap::new();
                    for (reading, global_id) in readings.iter().zip(&ids) {
                        let stmt = match cache.get_mut(reading.table.as_str()) {
                            Some(s) => s,
                            None => {
                                let s = tx.prepare_cached(&format!(
                                    "INSERT INTO {} (id, reading, user_ts, ts) VALUES (?1, ?2, ?3, ?4)",
                                    reading.table
                                ))?;
                                cache.entry(reading.table.as_str()).or_insert(s)
                            }
                        };
                        stmt.execute(params![global_id, reading.payload.to_string(), reading.user_ts, now])?;
                    }
                }
                tx.commit()
            })
            .map_err(|e| match e {
                StorageError::Sqlite(inner) => inner,
                other => {
                    warn!(error = %other, "append batch failed");
                    rusqlite::Error::ExecuteReturnedResults
                }
            })
        });

        match outcome {
            Ok(()) => Ok(ids),
            Err(err) => {
                warn!(error = %err, "append batch failed, rolling back");
                Err(err)
            }
        }
    }

    /// The single-reading ingest path underlying `readingStream`. Unlike
    /// `append_readings` each call commits immediately, trading batch
    /// throughput for per-message durability.
    pub fn append_one(&self, reading: &RawReading) -> Result<i64, StorageError> {
        let resolved = self.resolve(reading).map_err(StorageError::InvalidPayload)?;
        let global_id = self.catalog.next_global_id();
        let now = format_utc(chrono::Utc::now());

        retry_prepared_insert(|| {
            self.db
                .with(|conn| {
                    conn.execute(
                        &format!("INSERT INTO {} (id, reading, user_ts, ts) VALUES (?1, ?2, ?3, ?4)", resolved.table),
                        params![global_id, resolved.payload.to_string(), resolved.user_ts, now],
                    )
                })
                .map_err(|_| rusqlite::Error::ExecuteReturnedResults)
        })?;
        Ok(global_id)
    }

    /// `readingStream`: decodes a packed binary stream of back-to-back
    /// frames -- `[u32 frame_len][i64 user_ts_micros][u32 asset_code_len]
    /// [asset_code][payload json]` -- and appends each reading through
    /// `append_one`, so readings already committed stay committed even if a
    /// later frame in the same call turns out malformed.
    pub fn append_stream(&self, buf: &[u8]) -> Result<Vec<i64>, StorageError> {
        let mut ids = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            if buf.len() - offset < 4 {
                return Err(StorageError::InvalidPayload("truncated stream frame length".to_string()));
            }
            let frame_len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if buf.len() - offset < frame_len {
                return Err(StorageError::InvalidPayload("truncated stream frame body".to_string()));
            }
            let frame = &buf[offset..offset + frame_len];
            offset += frame_len;

            let reading = decode_reading_frame(frame)?;
            ids.push(self.append_one(&reading)?);
        }
        Ok(ids)
    }

    /// `fetchReadings`: replays up to `blk_size` readings with `id > from_id`
    /// across every asset table, ordered by id, for a resend/export cursor.
    pub fn fetch_readings(&self, from_id: i64, blk_size: usize) -> Result<Vec<StoredReading>, StorageError> {
        let tables = self.catalog.all_tables();
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let selects: Vec<String> = tables
            .iter()
            .map(|loc| {
                let t = table_ref(loc.db_id, loc.table_id);
                format!("SELECT id, reading, user_ts, ts FROM {t} WHERE id > {from_id}")
            })
            .collect();
        let sql = format!("SELECT id, reading, user_ts, ts FROM ({}) ORDER BY id LIMIT {blk_size}", selects.join(" UNION ALL "));

        self.db.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |r| {
                let reading_text: String = r.get(1)?;
                Ok(StoredReading {
                    id: r.get(0)?,
                    reading: serde_json::from_str(&reading_text).unwrap_or(Value::Null),
                    user_ts: r.get(2)?,
                    ts: r.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// `retrieveReadings`: compiles and runs the JSON query document (empty
    /// string/`null` dumps every table).
    pub fn retrieve_readings(&self, query_json: Option<&str>) -> Result<Vec<Value>, StorageError> {
        let tables: Vec<(String, String)> = self
            .catalog
            .asset_tables()
            .into_iter()
            .map(|(asset, loc)| (asset, table_ref(loc.db_id, loc.table_id)))
            .collect();
        let sql = query::compile(query_json, &tables)?;
        debug!(sql = %sql, "compiled query");

        self.db.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map([], move |r| {
                let mut obj = serde_json::Map::new();
                for (i, name) in columns.iter().enumerate() {
                    let value: Value = match r.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => Value::Null,
                        rusqlite::types::ValueRef::Integer(n) => Value::from(n),
                        rusqlite::types::ValueRef::Real(f) => Value::from(f),
                        rusqlite::types::ValueRef::Text(t) => {
                            let s = String::from_utf8_lossy(t).to_string();
                            serde_json::from_str(&s).unwrap_or(Value::String(s))
                        }
                        rusqlite::types::ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).to_string()),
                    };
                    obj.insert(name.clone(), value);
                }
                Ok(Value::Object(obj))
            })?;
            rows.collect()
        })
    }
}

struct ResolvedReading {
    table: String,
    payload: Value,
    user_ts: String,
}

/// Decodes one `{user_ts, asset_code_len, asset_code, payload}` frame
/// (§4.C `readingStream`): an 8-byte big-endian microsecond timestamp, a
/// 4-byte big-endian asset code length, the asset code itself, and a
/// trailing JSON payload that fills out the rest of the frame.
fn decode_reading_frame(frame: &[u8]) -> Result<RawReading, StorageError> {
    const HEADER_LEN: usize = 8 + 4;
    if frame.len() < HEADER_LEN {
        return Err(StorageError::InvalidPayload("truncated reading frame header".to_string()));
    }
    let user_ts_micros = i64::from_be_bytes(frame[0..8].try_into().unwrap());
    let asset_code_len = u32::from_be_bytes(frame[8..12].try_into().unwrap()) as usize;
    let payload_start = HEADER_LEN + asset_code_len;
    if frame.len() < payload_start {
        return Err(StorageError::InvalidPayload("truncated asset code in reading frame".to_string()));
    }

    let asset_code = String::from_utf8(frame[HEADER_LEN..payload_start].to_vec())
        .map_err(|e| StorageError::InvalidPayload(format!("asset code is not valid utf-8: {e}")))?;
    let payload: Value = serde_json::from_slice(&frame[payload_start..])
        .map_err(|e| StorageError::InvalidPayload(format!("reading payload is not valid json: {e}")))?;
    let user_ts = chrono::DateTime::from_timestamp_micros(user_ts_micros)
        .ok_or_else(|| StorageError::InvalidPayload("user_ts out of range".to_string()))?;

    Ok(RawReading { asset_code, payload, user_ts: Some(format_utc(user_ts)) })
}

#[derive(Debug, Clone)]
pub struct StoredReading {
    pub id: i64,
    pub reading: Value,
    pub user_ts: String,
    pub ts: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use serde_json::json;

    fn new_engine() -> (tempfile::TempDir, StorageEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let catalog = Arc::new(Catalog::load(db.clone(), 4).unwrap());
        (dir, StorageEngine::new(db, catalog))
    }

    #[test]
    fn appends_a_batch_and_issues_increasing_ids() {
        let (_dir, engine) = new_engine();
        let batch = vec![
            RawReading { asset_code: "A".into(), payload: json!({"v": 1}), user_ts: None },
            RawReading { asset_code: "A".into(), payload: json!({"v": 2}), user_ts: None },
            RawReading { asset_code: "B".into(), payload: json!({"v": 3}), user_ts: None },
        ];
        let outcomes = engine.append_readings(&batch).unwrap();
        assert_eq!(outcomes.len(), 3);
        let ids: Vec<i64> = outcomes
            .iter()
            .map(|o| match o {
                AppendOutcome::Stored { global_id } => *global_id,
                AppendOutcome::Rejected { .. } => panic!("unexpected rejection"),
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rejects_reading_with_empty_asset_code() {
        let (_dir, engine) = new_engine();
        let batch = vec![RawReading { asset_code: "".into(), payload: json!({}), user_ts: None }];
        let outcomes = engine.append_readings(&batch).unwrap();
        assert!(matches!(outcomes[0], AppendOutcome::Rejected { .. }));
    }

    #[test]
    fn fetch_readings_replays_in_id_order_across_assets() {
        let (_dir, engine) = new_engine();
        let batch = vec![
            RawReading { asset_code: "A".into(), payload: json!({"v": 1}), user_ts: None },
            RawReading { asset_code: "B".into(), payload: json!({"v": 2}), user_ts: None },
        ];
        engine.append_readings(&batch).unwrap();
        let replayed = engine.fetch_readings(0, 10).unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(replayed[0].id < replayed[1].id);
    }

    fn encode_frame(user_ts_micros: i64, asset_code: &str, payload: &Value) -> Vec<u8> {
        let payload_bytes = payload.to_string().into_bytes();
        let mut body = Vec::new();
        body.extend_from_slice(&user_ts_micros.to_be_bytes());
        body.extend_from_slice(&(asset_code.len() as u32).to_be_bytes());
        body.extend_from_slice(asset_code.as_bytes());
        body.extend_from_slice(&payload_bytes);

        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn append_stream_decodes_packed_binary_frames() {
        let (_dir, engine) = new_engine();
        let mut buf = Vec::new();
        buf.extend(encode_frame(1_700_000_000_000_000, "A", &json!({"v": 1})));
        buf.extend(encode_frame(1_700_000_001_000_000, "B", &json!({"v": 2})));

        let ids = engine.append_stream(&buf).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);

        let rows = engine.fetch_readings(0, 10).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn append_stream_rejects_truncated_frame() {
        let (_dir, engine) = new_engine();
        let mut buf = encode_frame(1_700_000_000_000_000, "A", &json!({"v": 1}));
        buf.truncate(buf.len() - 2);
        assert!(engine.append_stream(&buf).is_err());
    }

    #[test]
    fn retrieve_readings_with_empty_query_dumps_everything() {
        let (_dir, engine) = new_engine();
        engine
            .append_readings(&[RawReading { asset_code: "A".into(), payload: json!({"v": 1}), user_ts: None }])
            .unwrap();
        let rows = engine.retrieve_readings(None).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
