use async_trait::async_trait;

use crate::{EnqueueRequest, Failure, Job, JobId, OutboxEntry, QueueError, QueueStats};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<JobId, QueueError>;

    /// Lease the next eligible job (`queued`, `scheduled_at <= now`) ordered by
    /// `(priority, scheduled_at)`, moving it to `running` in the same atomic step.
    /// Concurrent callers never receive the same job.
    async fn pick(&self) -> Result<Option<Job>, QueueError>;

    /// `running -> done`, clearing `last_error`.
    async fn complete(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Counts one failed attempt. Returns the job as it stands afterwards:
    /// `failed` once the attempt budget is spent, `queued` with a later
    /// `scheduled_at` otherwise.
    async fn fail(&self, job_id: JobId, failure: Failure) -> Result<Job, QueueError>;

    /// `running -> queued` after `delay_ms` without spending an attempt.
    async fn reschedule(&self, job_id: JobId, reason: &str, delay_ms: i64)
    -> Result<Job, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Most recently updated terminal failures first.
    async fn list_failed(&self, limit: i64) -> Result<Vec<Job>, QueueError>;

    /// `failed -> queued` with a fresh attempt budget.
    async fn requeue_failed(&self, job_id: JobId) -> Result<(), QueueError>;
}

/// Append-only result log: no update or delete.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn write(
        &self,
        job_id: JobId,
        kind: &str,
        content: serde_json::Value,
    ) -> Result<OutboxEntry, QueueError>;

    /// Entries for one job in write order.
    async fn by_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, QueueError>;

    /// Newest entries of one type first.
    async fn by_type(&self, kind: &str, limit: i64) -> Result<Vec<OutboxEntry>, QueueError>;
}
