pub mod filter;
pub mod queue;
pub mod scheduler;

pub use filter::{AssetAllowList, FilterPipeline, ReadingFilter, RequireObjectPayload};
pub use queue::{IngestQueue, PendingBatch, QueueSnapshot};
pub use scheduler::IngestPipeline;
