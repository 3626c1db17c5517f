use chrono::{DateTime, NaiveDateTime, Utc};

/// The literal sentinel accepted in the `user_ts` field of an ingested reading.
pub const NOW_LITERAL: &str = "now()";

/// Parses the `user_ts` field of an ingested reading.
///
/// Accepts the literal `"now()"` (substituted with the current UTC instant)
/// or an ISO-like `YYYY-MM-DD HH:MM:SS[.ffffff][±HH:MM]` timestamp. A bare
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` with no offset is interpreted as UTC.
pub fn parse_user_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case(NOW_LITERAL) {
        return Ok(Utc::now());
    }

    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
    }

    Err(format!("malformed user_ts: {raw:?}"))
}

/// Renders a timestamp the way `fetchReadings`/`retrieveReadings` report it: UTC,
/// microsecond precision, SQLite `DATETIME` compatible.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_now_literal() {
        let before = Utc::now();
        let parsed = parse_user_ts("now()").unwrap();
        let after = Utc::now();
        assert!(parsed >= before && parsed <= after);
    }

    #[test]
    fn accepts_bare_timestamp() {
        let parsed = parse_user_ts("2024-01-01 00:00:00.000000").unwrap();
        assert_eq!(format_utc(parsed), "2024-01-01 00:00:00.000000");
    }

    #[test]
    fn accepts_timestamp_with_offset() {
        let parsed = parse_user_ts("2024-01-01 00:00:00+02:00").unwrap();
        assert_eq!(format_utc(parsed), "2023-12-31 22:00:00.000000");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_user_ts("not-a-date").is_err());
    }
}
