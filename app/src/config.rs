//! Ambient configuration (§4.J): every tunable the ingest, storage and purge
//! layers need, aggregated in one place so the binary can load it from a
//! file or environment and hand typed values down instead of scattering
//! magic numbers through the call sites.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,

    /// Active-queue readings count that forces a rotation into the full
    /// stack (§4.E).
    pub flush_threshold: usize,
    /// Maximum time an active queue is allowed to sit before it rotates
    /// regardless of size.
    pub flush_timeout_ms: u64,

    pub resend_max_retries: u32,
    pub discard_on_resend_exhaustion: u32,

    pub retry_max: u32,
    pub retry_backoff_micros: u64,
    pub prepared_retry_max: u32,
    pub prepared_retry_base_millis: u64,
    pub prepared_retry_jitter_millis: u64,

    /// How many readings tables to pre-allocate per database file so an
    /// asset seen for the first time never waits on table creation.
    pub readings_to_allocate: usize,

    pub purge_block_initial: i64,
    pub purge_block_min: i64,
    pub purge_block_max: i64,
    pub purge_target_micros: u128,
    pub purge_tolerance_micros: u128,
    pub purge_recalc_blocks: u32,
    pub purge_slow_block_micros: u128,

    pub stats_tick_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            data_dir: PathBuf::from("./data"),
            flush_threshold: 500,
            flush_timeout_ms: 5_000,
            resend_max_retries: 6,
            discard_on_resend_exhaustion: 5,
            retry_max: 40,
            retry_backoff_micros: 100,
            prepared_retry_max: 20,
            prepared_retry_base_millis: 5,
            prepared_retry_jitter_millis: 5,
            readings_to_allocate: 64,
            purge_block_initial: 200,
            purge_block_min: 20,
            purge_block_max: 1500,
            purge_target_micros: 70_000,
            purge_tolerance_micros: 7_000,
            purge_recalc_blocks: 30,
            purge_slow_block_micros: 150_000,
            stats_tick_ms: 1_000,
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from a JSON file at `path`, falling back to
    /// defaults field-by-field for anything the file omits.
    pub fn load(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn flush_timeout(&self) -> Duration {
        millis(self.flush_timeout_ms)
    }

    pub fn stats_tick(&self) -> Duration {
        millis(self.stats_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.resend_max_retries, 6);
        assert_eq!(cfg.discard_on_resend_exhaustion, 5);
        assert_eq!(cfg.retry_max, 40);
        assert_eq!(cfg.purge_block_initial, 200);
    }

    #[test]
    fn loads_partial_override_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"flush_threshold": 10}"#).unwrap();
        let cfg = ServiceConfig::load(&path).unwrap();
        assert_eq!(cfg.flush_threshold, 10);
        assert_eq!(cfg.resend_max_retries, 6);
    }
}
