pub mod catalog;
pub mod connection;
pub mod engine;
pub mod purge;
pub mod query;
pub mod retry;

pub use catalog::{AssetLocation, Catalog};
pub use connection::Database;
pub use engine::{AppendOutcome, RawReading, StorageEngine, StoredReading};
pub use purge::{PurgeCriterion, PurgeEngine, PurgeOutcome, WriteAccessGuard};
