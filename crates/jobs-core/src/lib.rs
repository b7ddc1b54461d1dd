pub mod error;
pub mod job;
pub mod outbox;
pub mod store;

pub use error::QueueError;
pub use job::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_RETRY_DELAY_MS, EnqueueRequest,
    EnqueueResponse, Failure, Job, JobId, JobState, MAX_RETRY_DELAY_MS, QueueStats,
    clamp_delay_ms,
};
pub use outbox::{OutboxEntry, OutboxId};
pub use store::memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
pub use store::{JobStore, Outbox};
