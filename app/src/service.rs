//! Startup/shutdown sequencing for the whole subsystem: opens storage,
//! boots the catalogue, wires the ingest pipeline and stats worker, and on
//! shutdown drains every in-flight reading before anything exits.

use crate::config::ServiceConfig;
use ingest::IngestPipeline;
use statistics::{AssetTracker, InMemorySink, ManagementSink};
use std::sync::Arc;
use std::thread::JoinHandle;
use storage::{Catalog, Database, StorageEngine};
use tracing::info;

pub struct Service {
    pub storage: Arc<StorageEngine>,
    pub catalog: Arc<Catalog>,
    pub pipeline: IngestPipeline,
    flush_worker: Option<JoinHandle<()>>,
    stats_worker: Option<JoinHandle<()>>,
    stats: AssetTracker,
}

impl Service {
    pub fn start(config: &ServiceConfig) -> Result<Self, error::StorageError> {
        Self::start_with_sink(config, Arc::new(InMemorySink::default()))
    }

    pub fn start_with_sink(config: &ServiceConfig, sink: Arc<dyn ManagementSink>) -> Result<Self, error::StorageError> {
        let db = Arc::new(Database::open(&config.data_dir)?);
        let catalog = Arc::new(Catalog::load(db.clone(), config.readings_to_allocate)?);
        let storage = Arc::new(StorageEngine::new(db, catalog.clone()));

        let (stats, stats_worker) = AssetTracker::start(sink, config.stats_tick());

        let (pipeline, flush_worker) = IngestPipeline::start(
            storage.clone(),
            stats.clone(),
            config.flush_threshold,
            config.flush_timeout(),
            config.flush_timeout(),
        );

        info!(data_dir = %config.data_dir.display(), "service started");

        Ok(Service {
            storage,
            catalog,
            pipeline,
            flush_worker: Some(flush_worker),
            stats_worker: Some(stats_worker),
            stats,
        })
    }

    /// Stops accepting readings, drains the queue, joins both workers, and
    /// persists the next global id so the following boot does not have to
    /// recompute it with a full table scan.
    pub fn shutdown(mut self) -> Result<(), error::StorageError> {
        self.pipeline.shutdown();
        if let Some(handle) = self.flush_worker.take() {
            let _ = handle.join();
        }

        self.stats.shutdown();
        if let Some(handle) = self.stats_worker.take() {
            let _ = handle.join();
        }

        self.catalog.persist_on_shutdown()?;
        info!("service shut down cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use storage::RawReading;

    #[test]
    fn starts_ingests_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.flush_threshold = 2;
        config.flush_timeout_ms = 20;

        let service = Service::start(&config).unwrap();
        service
            .pipeline
            .submit(RawReading { asset_code: "A".into(), payload: json!({"v": 1}), user_ts: None })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        service.shutdown().unwrap();
    }
}
