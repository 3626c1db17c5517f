pub mod sink;
pub mod tracker;

pub use sink::{InMemorySink, ManagementSink};
pub use tracker::{AssetTracker, DISCARDED_KEY, READINGS_KEY};
