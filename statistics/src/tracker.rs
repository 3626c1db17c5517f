use crate::sink::ManagementSink;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use threading::Notify;
use tracing::{debug, warn};

pub const READINGS_KEY: &str = "READINGS";
pub const DISCARDED_KEY: &str = "DISCARDED";

/// Messages the flush worker and producers send to the stats worker. The
/// worker never blocks producers: every send is a non-blocking push onto an
/// unbounded channel.
enum Event {
    Insert { asset: String, count: u64 },
    Discarded { count: u64 },
    AssetTracked {
        service: String,
        plugin: String,
        asset: String,
        event: String,
    },
    Stop,
}

/// Handle to the running stats worker. Cloning is cheap; the worker itself
/// is torn down once, when the last handle is dropped via `shutdown`.
#[derive(Clone)]
pub struct AssetTracker {
    tx: Sender<Event>,
    notify: Arc<Notify>,
}

impl AssetTracker {
    /// Spawns the stats worker. It wakes whenever `notify` fires (after a
    /// successful flush, per §4.G) and otherwise polls every `tick` so that
    /// a failed upsert is retried even with no further ingest traffic.
    pub fn start(sink: Arc<dyn ManagementSink>, tick: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = channel::unbounded();
        let notify = Arc::new(Notify::new());
        let worker_notify = notify.clone();

        let handle = thread::Builder::new()
            .name("stats-worker".into())
            .spawn(move || run(sink, rx, worker_notify, tick))
            .expect("failed to spawn stats worker");

        (AssetTracker { tx, notify }, handle)
    }

    pub fn record_insert(&self, asset: &str, count: u64) {
        let _ = self.tx.send(Event::Insert {
            asset: asset.to_string(),
            count,
        });
        self.notify.notify();
    }

    pub fn record_discarded(&self, count: u64) {
        let _ = self.tx.send(Event::Discarded { count });
        self.notify.notify();
    }

    pub fn track_ingest(&self, service: &str, plugin: &str, asset: &str) {
        let _ = self.tx.send(Event::AssetTracked {
            service: service.to_string(),
            plugin: plugin.to_string(),
            asset: asset.to_string(),
            event: "Ingest".to_string(),
        });
        self.notify.notify();
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Stop);
        self.notify.notify();
    }
}

fn run(sink: Arc<dyn ManagementSink>, rx: Receiver<Event>, notify: Arc<Notify>, tick: Duration) {
    let mut pending: HashMap<String, u64> = HashMap::new();
    let mut known: HashSet<String> = HashSet::new();
    let mut tracked: HashSet<(String, String, String, String)> = HashSet::new();

    loop {
        notify.wait_for(tick);

        let mut stop = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Insert { asset, count } => {
                    *pending.entry(READINGS_KEY.to_string()).or_insert(0) += count;
                    *pending.entry(asset).or_insert(0) += count;
                }
                Event::Discarded { count } => {
                    *pending.entry(DISCARDED_KEY.to_string()).or_insert(0) += count;
                }
                Event::AssetTracked {
                    service,
                    plugin,
                    asset,
                    event,
                } => {
                    let key = (service.clone(), plugin.clone(), asset.clone(), event.clone());
                    if tracked.insert(key) {
                        if let Err(err) = sink.track_tuple(&service, &plugin, &asset, &event) {
                            warn!("asset-tracker POST failed, will not retry: {err}");
                        }
                    }
                }
                Event::Stop => stop = true,
            }
        }

        if !pending.is_empty() {
            for key in pending.keys() {
                if known.insert(key.clone()) {
                    sink.ensure_statistic(key);
                }
            }
            let batch: Vec<(String, u64)> = pending.iter().map(|(k, v)| (k.clone(), *v)).collect();
            match sink.apply_deltas(&batch) {
                Ok(()) => {
                    debug!("flushed {} statistic deltas", batch.len());
                    pending.clear();
                }
                Err(err) => {
                    warn!("statistics flush failed, retaining pending deltas: {err}");
                    // `known` entries stay marked so we don't re-issue ensure_statistic
                    // every retry; `pending` is left intact for the next tick.
                }
            }
        }

        if stop {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;
    use std::time::Duration;

    #[test]
    fn accumulates_and_flushes_per_asset_and_readings_total() {
        let sink = Arc::new(InMemorySink::new());
        let (tracker, handle) = AssetTracker::start(sink.clone(), Duration::from_millis(20));

        tracker.record_insert("T1", 3);
        tracker.record_insert("T2", 2);
        tracker.record_discarded(1);

        thread::sleep(Duration::from_millis(100));
        tracker.shutdown();
        handle.join().unwrap();

        assert_eq!(sink.total("T1"), 3);
        assert_eq!(sink.total("T2"), 2);
        assert_eq!(sink.total(READINGS_KEY), 5);
        assert_eq!(sink.total(DISCARDED_KEY), 1);
    }

    #[test]
    fn dedups_asset_tracker_tuples() {
        let sink = Arc::new(InMemorySink::new());
        let (tracker, handle) = AssetTracker::start(sink.clone(), Duration::from_millis(20));

        tracker.track_ingest("readings", "south", "T1");
        tracker.track_ingest("readings", "south", "T1");
        tracker.track_ingest("readings", "south", "T2");

        thread::sleep(Duration::from_millis(100));
        tracker.shutdown();
        handle.join().unwrap();

        assert_eq!(sink.tracked_tuples().len(), 2);
    }
}
