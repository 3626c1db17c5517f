//! JSON query DSL → SQL compiler (§4.C). A query document is one JSON
//! object with optional `aggregate`, `return`, `where`, `timebucket`,
//! `modifier` and `limit` keys. `None`/empty input dumps every readings
//! table.

use error::StorageError;
use serde_json::Value;

/// Julian day number of the Unix epoch, used to express `timebucket`
/// boundaries without relying on `strftime('%s', ...)` losing sub-second
/// precision.
const JULIAN_EPOCH: f64 = 2440587.5;

/// `tables` pairs each readings table with the asset code it belongs to, so
/// a query that fans out across tables can still group or tag rows by asset
/// after they have been folded into a single `UNION ALL`.
pub fn compile(query_json: Option<&str>, tables: &[(String, String)]) -> Result<String, StorageError> {
    let trimmed = query_json.map(str::trim).unwrap_or("");
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(dump_all(tables));
    }

    let doc: Value = serde_json::from_str(trimmed).map_err(|e| StorageError::QuerySchema(e.to_string()))?;
    let obj = doc
        .as_object()
        .ok_or_else(|| StorageError::QuerySchema("query document must be a JSON object".to_string()))?;

    let union = union_all(tables);

    if let Some(agg) = obj.get("aggregate") {
        let tagged_union = union_all_tagged(tables);
        return compile_aggregate(agg, obj, &union, &tagged_union);
    }

    let projection = compile_return(obj.get("return"))?;
    let where_clause = match obj.get("where") {
        Some(w) => format!(" WHERE {}", compile_where(w)?),
        None => String::new(),
    };
    let limit = compile_limit(obj.get("limit"));

    Ok(format!("SELECT {projection} FROM ({union}){where_clause}{limit}"))
}

fn dump_all(tables: &[(String, String)]) -> String {
    if tables.is_empty() {
        return "SELECT id, reading, user_ts, ts FROM (SELECT NULL AS id, NULL AS reading, NULL AS user_ts, NULL AS ts) WHERE 0".to_string();
    }
    union_all(tables)
}

fn union_all(tables: &[(String, String)]) -> String {
    tables
        .iter()
        .map(|(_, t)| format!("SELECT id, reading, user_ts, ts FROM {t}"))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// Same as [`union_all`] but tags every row with its source asset code, for
/// queries that need to group per `(bucket, asset_code)` after the
/// per-table origin would otherwise be lost in the fold.
fn union_all_tagged(tables: &[(String, String)]) -> String {
    tables
        .iter()
        .map(|(asset, t)| format!("SELECT id, reading, user_ts, ts, '{}' AS asset_code FROM {t}", asset.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

fn compile_return(ret: Option<&Value>) -> Result<String, StorageError> {
    let Some(ret) = ret else {
        return Ok("id, reading, user_ts, ts".to_string());
    };
    let items = ret
        .as_array()
        .ok_or_else(|| StorageError::QuerySchema("`return` must be an array".to_string()))?;
    if items.is_empty() {
        return Ok("id, reading, user_ts, ts".to_string());
    }

    let mut columns = Vec::new();
    for item in items {
        let spec = item
            .as_object()
            .ok_or_else(|| StorageError::QuerySchema("each `return` entry must be an object".to_string()))?;
        let column = spec
            .get("column")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::QuerySchema("`return` entry missing `column`".to_string()))?;
        let expr = if column == "reading" {
            match spec.get("json").and_then(Value::as_str) {
                Some(path) => format!("json_extract(reading, '$.{path}')"),
                None => "reading".to_string(),
            }
        } else if column == "user_ts" || column == "ts" {
            let timezone = match spec.get("timezone") {
                Some(Value::String(tz)) if tz == "utc" || tz == "localtime" => Some(tz.as_str()),
                Some(Value::String(tz)) => return Err(StorageError::QuerySchema(format!("unsupported timezone `{tz}`"))),
                _ => None,
            };
            match (spec.get("format").and_then(Value::as_str), timezone) {
                (Some(fmt), Some(tz)) => format!("strftime('{fmt}', {column}, '{tz}')"),
                (Some(fmt), None) => format!("strftime('{fmt}', {column})"),
                (None, Some(tz)) => format!("datetime({column}, '{tz}')"),
                (None, None) => column.to_string(),
            }
        } else {
            column.to_string()
        };
        let alias = spec.get("alias").and_then(Value::as_str).unwrap_or(column);
        columns.push(format!("{expr} AS {alias}"));
    }
    Ok(columns.join(", "))
}

fn compile_where(node: &Value) -> Result<String, StorageError> {
    let obj = node
        .as_object()
        .ok_or_else(|| StorageError::QuerySchema("`where` nodes must be objects".to_string()))?;

    if let Some(conds) = obj.get("and").and_then(Value::as_array) {
        let parts: Result<Vec<String>, _> = conds.iter().map(compile_where).collect();
        return Ok(format!("({})", parts?.join(" AND ")));
    }
    if let Some(conds) = obj.get("or").and_then(Value::as_array) {
        let parts: Result<Vec<String>, _> = conds.iter().map(compile_where).collect();
        return Ok(format!("({})", parts?.join(" OR ")));
    }

    let field = obj
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::QuerySchema("`where` leaf missing `field`".to_string()))?;
    let op = obj.get("op").and_then(Value::as_str).unwrap_or("=");
    let value = obj
        .get("value")
        .ok_or_else(|| StorageError::QuerySchema("`where` leaf missing `value`".to_string()))?;

    let sql_op = match op {
        "=" | "eq" => "=",
        "!=" | "ne" => "!=",
        ">" | "gt" => ">",
        ">=" | "gte" => ">=",
        "<" | "lt" => "<",
        "<=" | "lte" => "<=",
        "like" => "LIKE",
        other => return Err(StorageError::QuerySchema(format!("unsupported operator `{other}`"))),
    };

    let column = if field == "asset" { "json_extract(reading, '$.asset')".to_string() } else { field.to_string() };
    Ok(format!("{column} {sql_op} {}", sql_literal(value)))
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
        Value::Null => "NULL".to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn compile_limit(limit: Option<&Value>) -> String {
    match limit.and_then(Value::as_u64) {
        Some(n) => format!(" LIMIT {n}"),
        None => String::new(),
    }
}

/// `timebucket` (§6): `{"timestamp": "ts"|"user_ts", "size": n|"n", "format": ..., "alias": ...}`.
/// `size` may arrive as either a JSON number or a numeric string.
fn parse_timebucket(tb: &Value) -> Option<(f64, String)> {
    let obj = tb.as_object()?;
    let size = match obj.get("size")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    let timestamp = obj.get("timestamp").and_then(Value::as_str).unwrap_or("ts").to_string();
    Some((size, timestamp))
}

/// `aggregate` (§4.C/§6): `{"operation": "count"|"sum"|"avg"|"min"|"max"|"all", "column": "..."}`.
/// `"all"` triggers the timebucket-all three-level SELECT that fans every
/// bucket back out into per-asset JSON rows; any other operation collapses
/// the whole (optionally bucketed) result into one row per bucket. An
/// optional top-level `modifier` (e.g. `"DISTINCT"`) is applied to the
/// aggregate function's argument.
fn compile_aggregate(
    agg: &Value,
    obj: &serde_json::Map<String, Value>,
    union: &str,
    tagged_union: &str,
) -> Result<String, StorageError> {
    let agg_obj = agg
        .as_object()
        .ok_or_else(|| StorageError::QuerySchema("`aggregate` must be an object".to_string()))?;
    let operation = agg_obj
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::QuerySchema("`aggregate` missing `operation`".to_string()))?;
    let column = agg_obj.get("column").and_then(Value::as_str).unwrap_or("reading");

    let where_clause = match obj.get("where") {
        Some(w) => format!(" WHERE {}", compile_where(w)?),
        None => String::new(),
    };

    let modifier = obj
        .get("modifier")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty());

    let timebucket = obj.get("timebucket").and_then(parse_timebucket);

    if operation == "all" {
        let (size, timestamp_col) = timebucket.unwrap_or((1.0, "ts".to_string()));
        return Ok(compile_timebucket_all(tagged_union, &where_clause, size, &timestamp_col));
    }

    let expr = if column == "reading" { "CAST(json_extract(reading, '$.value') AS REAL)".to_string() } else { column.to_string() };

    let sql_fn = match operation {
        "count" => "COUNT",
        "sum" => "SUM",
        "avg" => "AVG",
        "min" => "MIN",
        "max" => "MAX",
        other => return Err(StorageError::QuerySchema(format!("unsupported aggregate `{other}`"))),
    };
    let arg = match modifier {
        Some(m) => format!("{m} {expr}"),
        None => expr,
    };

    match timebucket {
        Some((size, timestamp_col)) => {
            let bucket = timebucket_expr(size, &timestamp_col);
            Ok(format!(
                "SELECT {bucket} AS bucket, {sql_fn}({arg}) AS value FROM ({union}){where_clause} GROUP BY bucket ORDER BY bucket"
            ))
        }
        None => Ok(format!("SELECT {sql_fn}({arg}) AS value FROM ({union}){where_clause}")),
    }
}

fn timebucket_expr(seconds: f64, column: &str) -> String {
    if seconds < 1.0 {
        format!("(round((julianday({column}) - {JULIAN_EPOCH}) * 86400 / {seconds}) * {seconds})")
    } else {
        format!("datetime(round((julianday({column}) - {JULIAN_EPOCH}) * 86400 / {seconds}) * {seconds}, 'unixepoch')")
    }
}

/// Three-level nested SELECT for `{"aggregate":{"operation":"all"}}`
/// (§4.C/§8 scenario 3). Innermost expands every reading's JSON object into
/// `(key, value)` rows via `json_each`; the middle level computes
/// per-datapoint min/max/avg/count/sum grouped by `(bucket, asset_code,
/// key)`; the outer level re-assembles those per-datapoint stats into one
/// JSON object per `(bucket, asset_code)`.
fn compile_timebucket_all(tagged_union: &str, where_clause: &str, seconds: f64, timestamp_col: &str) -> String {
    let bucket = timebucket_expr(seconds, timestamp_col);
    format!(
        "SELECT bucket, asset_code, json_group_object(key, json_object('min', min_v, 'max', max_v, 'average', avg_v, 'count', count_v, 'sum', sum_v)) AS reading FROM ( \
            SELECT bucket, asset_code, key, MIN(value) AS min_v, MAX(value) AS max_v, AVG(value) AS avg_v, COUNT(value) AS count_v, SUM(value) AS sum_v FROM ( \
                SELECT {bucket} AS bucket, asset_code, je.key AS key, CAST(je.value AS REAL) AS value FROM ({tagged_union}){where_clause}, json_each(reading) AS je \
            ) GROUP BY bucket, asset_code, key \
        ) GROUP BY bucket, asset_code ORDER BY bucket"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Vec<(String, String)> {
        names.iter().enumerate().map(|(i, n)| (format!("asset{i}"), n.to_string())).collect()
    }

    #[test]
    fn empty_query_dumps_every_table() {
        let sql = compile(None, &tables(&["readings_1", "readings_2"])).unwrap();
        assert!(sql.contains("UNION ALL"));
    }

    #[test]
    fn compiles_equality_where_clause() {
        let sql = compile(Some(r#"{"where": {"field": "id", "op": ">", "value": 5}}"#), &tables(&["readings_1"])).unwrap();
        assert!(sql.contains("WHERE id > 5"));
    }

    #[test]
    fn compiles_sum_aggregate_with_timebucket() {
        let sql = compile(
            Some(r#"{"aggregate": {"operation": "sum", "column": "reading"}, "timebucket": {"timestamp": "ts", "size": 60}}"#),
            &tables(&["readings_1"]),
        )
        .unwrap();
        assert!(sql.contains("SUM("));
        assert!(sql.contains("GROUP BY bucket"));
    }

    #[test]
    fn compiles_aggregate_all_with_string_timebucket_size() {
        let sql = compile(
            Some(r#"{"aggregate":{"operation":"all"},"timebucket":{"timestamp":"user_ts","size":"60"},"where":{"field":"id","op":">","value":0}}"#),
            &tables(&["readings_1"]),
        )
        .unwrap();
        assert!(sql.contains("json_each(reading)"));
        assert!(sql.contains("julianday(user_ts)"));
        assert!(sql.contains("json_group_object"));
        assert!(sql.contains("'average'"));
    }

    #[test]
    fn compiles_aggregate_with_distinct_modifier() {
        let sql = compile(
            Some(r#"{"aggregate": {"operation": "count", "column": "asset_code"}, "modifier": "DISTINCT"}"#),
            &tables(&["readings_1"]),
        )
        .unwrap();
        assert!(sql.contains("COUNT(DISTINCT asset_code)"));
    }

    #[test]
    fn compiles_return_entry_with_timezone() {
        let sql = compile(
            Some(r#"{"return": [{"column": "user_ts", "timezone": "localtime", "alias": "local_ts"}]}"#),
            &tables(&["readings_1"]),
        )
        .unwrap();
        assert!(sql.contains("datetime(user_ts, 'localtime') AS local_ts"));
    }

    #[test]
    fn rejects_unsupported_operator() {
        let err = compile(Some(r#"{"where": {"field": "id", "op": "~=", "value": 1}}"#), &tables(&["readings_1"]));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_aggregate_given_as_a_bare_string() {
        let err = compile(Some(r#"{"aggregate": "sum"}"#), &tables(&["readings_1"]));
        assert!(err.is_err());
    }
}
