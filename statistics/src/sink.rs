use std::collections::HashMap;
use std::sync::Mutex;

/// Stands in for the opaque HTTP management client / service registry that
/// the statistics and asset-tracker components report into. The CORE only
/// ever needs the statistics upsert surface and the asset-tracker `/track`
/// call; everything else on the management HTTP surface is a descriptive,
/// unimplemented collaborator.
pub trait ManagementSink: Send + Sync {
    /// Ensures a `statistics` row exists for `key` (created uppercase, with
    /// an auto-generated description, the first time it is seen).
    fn ensure_statistic(&self, key: &str);

    /// Adds `delta` to the named statistic's running total in one batch call.
    fn apply_deltas(&self, deltas: &[(String, u64)]) -> Result<(), String>;

    /// Records a `(service, plugin, asset, event)` asset-tracker tuple. Only
    /// called once per distinct tuple by the caller (§4.G dedup).
    fn track_tuple(&self, service: &str, plugin: &str, asset: &str, event: &str) -> Result<(), String>;
}

/// In-memory double used by tests and by a service with no management
/// connection configured.
#[derive(Default)]
pub struct InMemorySink {
    totals: Mutex<HashMap<String, u64>>,
    known: Mutex<std::collections::HashSet<String>>,
    tracked: Mutex<std::collections::HashSet<(String, String, String, String)>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, key: &str) -> u64 {
        self.totals.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn tracked_tuples(&self) -> Vec<(String, String, String, String)> {
        self.tracked.lock().unwrap().iter().cloned().collect()
    }
}

impl ManagementSink for InMemorySink {
    fn ensure_statistic(&self, key: &str) {
        self.known.lock().unwrap().insert(key.to_uppercase());
        self.totals
            .lock()
            .unwrap()
            .entry(key.to_uppercase())
            .or_insert(0);
    }

    fn apply_deltas(&self, deltas: &[(String, u64)]) -> Result<(), String> {
        let mut totals = self.totals.lock().unwrap();
        for (key, delta) in deltas {
            *totals.entry(key.to_uppercase()).or_insert(0) += delta;
        }
        Ok(())
    }

    fn track_tuple(&self, service: &str, plugin: &str, asset: &str, event: &str) -> Result<(), String> {
        self.tracked.lock().unwrap().insert((
            service.to_string(),
            plugin.to_string(),
            asset.to_string(),
            event.to_string(),
        ));
        Ok(())
    }
}
