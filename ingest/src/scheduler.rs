//! Wires the filter pipeline, the ingest queue and the storage engine
//! together behind one flush worker thread (§4.E/§5): readings are filtered
//! and buffered synchronously on the caller's thread, and flushed to
//! storage asynchronously by a dedicated worker woken on threshold, on
//! staleness, or on its own timeout tick.

use crate::filter::FilterPipeline;
use crate::queue::{IngestQueue, PendingBatch};
use error::IngestError;
use statistics::AssetTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use storage::{AppendOutcome, RawReading, StorageEngine};
use threading::Notify;
use tracing::{info, warn};

pub struct IngestPipeline {
    queue: Arc<IngestQueue>,
    filters: Arc<FilterPipeline>,
    notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl IngestPipeline {
    /// Starts the flush worker and returns a handle for producers plus the
    /// worker's `JoinHandle` for shutdown.
    pub fn start(
        storage: Arc<StorageEngine>,
        stats: AssetTracker,
        threshold: usize,
        max_age: Duration,
        flush_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let queue = Arc::new(IngestQueue::new(threshold, max_age));
        let filters = Arc::new(FilterPipeline::default());
        let notify = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = queue.clone();
            let notify = notify.clone();
            let stopped = stopped.clone();
            thread::Builder::new()
                .name("ingest-flush".to_string())
                .spawn(move || flush_loop(queue, notify, stopped, storage, stats, flush_timeout))
                .expect("spawn ingest-flush worker")
        };

        (IngestPipeline { queue, filters, notify, stopped }, worker)
    }

    /// Filters and enqueues one reading. Returns `PipelineStopped` if the
    /// pipeline has already been asked to shut down.
    pub fn submit(&self, reading: RawReading) -> Result<(), IngestError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(IngestError::PipelineStopped);
        }
        let Some(reading) = self.filters.apply(reading) else {
            return Ok(());
        };
        if self.queue.push(reading) {
            self.notify.notify();
        }
        Ok(())
    }

    pub fn reconfigure_filters(&self, stages: Vec<Box<dyn crate::filter::ReadingFilter>>) {
        self.filters.reconfigure(stages);
    }

    pub fn queue(&self) -> &Arc<IngestQueue> {
        &self.queue
    }

    /// Stops accepting new readings and wakes the flush worker one last
    /// time so it drains everything still queued before exiting.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify();
    }
}

fn flush_loop(
    queue: Arc<IngestQueue>,
    notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    storage: Arc<StorageEngine>,
    stats: AssetTracker,
    flush_timeout: Duration,
) {
    loop {
        let deadline = Instant::now() + flush_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if notify.wait_for(remaining * 3 / 4) {
                break;
            }
        }

        queue.rotate_if_stale();
        while let Some(batch) = queue.next_to_flush() {
            flush_batch(&queue, &storage, &stats, batch);
        }

        if stopped.load(Ordering::SeqCst) {
            for batch in queue.drain_all() {
                flush_batch(&queue, &storage, &stats, batch);
            }
            info!("ingest flush worker exiting");
            return;
        }
    }
}

fn flush_batch(queue: &IngestQueue, storage: &StorageEngine, stats: &AssetTracker, batch: PendingBatch) {
    let size = batch.readings.len();
    match storage.append_readings(&batch.readings) {
        Ok(outcomes) => {
            for (reading, outcome) in batch.readings.iter().zip(outcomes) {
                match outcome {
                    AppendOutcome::Stored { .. } => {
                        stats.record_insert(&reading.asset_code, 1);
                        stats.track_ingest("readings", "edge", &reading.asset_code);
                    }
                    AppendOutcome::Rejected { reason } => {
                        warn!(reason, asset = %reading.asset_code, "reading rejected during flush");
                        stats.record_discarded(1);
                    }
                }
            }
        }
        Err(err) => {
            warn!(error = %err, size, "flush failed, requeuing batch");
            let dropped = queue.requeue_failed(batch);
            if dropped > 0 {
                stats.record_discarded(dropped as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statistics::InMemorySink;
    use std::thread;
    use storage::{Catalog, Database};

    fn new_pipeline() -> (tempfile::TempDir, IngestPipeline, JoinHandle<()>, Arc<InMemorySink>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let catalog = Arc::new(Catalog::load(db.clone(), 4).unwrap());
        let storage = Arc::new(StorageEngine::new(db, catalog));
        let sink = Arc::new(InMemorySink::default());
        let (tracker, _stats_worker) = AssetTracker::start(sink.clone() as Arc<dyn statistics::ManagementSink>, Duration::from_millis(20));
        let (pipeline, worker) = IngestPipeline::start(storage, tracker, 2, Duration::from_millis(50), Duration::from_millis(30));
        (dir, pipeline, worker, sink)
    }

    #[test]
    fn submitted_readings_eventually_reach_storage() {
        let (_dir, pipeline, worker, _sink) = new_pipeline();
        pipeline.submit(RawReading { asset_code: "A".into(), payload: json!({"v": 1}), user_ts: None }).unwrap();
        pipeline.submit(RawReading { asset_code: "A".into(), payload: json!({"v": 2}), user_ts: None }).unwrap();
        thread::sleep(Duration::from_millis(100));
        pipeline.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let (_dir, pipeline, worker, _sink) = new_pipeline();
        pipeline.shutdown();
        worker.join().unwrap();
        let result = pipeline.submit(RawReading { asset_code: "A".into(), payload: json!({}), user_ts: None });
        assert!(matches!(result, Err(IngestError::PipelineStopped)));
    }
}
