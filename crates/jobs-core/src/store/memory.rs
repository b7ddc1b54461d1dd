//! Process-local store. One mutex guards jobs and outbox together, so every
//! operation is atomic with respect to every other.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, EnqueueRequest, Failure, Job, JobId, JobState,
    JobStore, Outbox, OutboxEntry, QueueError, QueueStats, clamp_delay_ms,
};

#[derive(Default)]
struct Inner {
    /// job id -> (insertion sequence, job). The sequence breaks ordering ties.
    jobs: HashMap<JobId, (u64, Job)>,
    next_seq: u64,
    outbox: Vec<OutboxEntry>,
}

impl Inner {
    fn running_mut(&mut self, job_id: JobId) -> Result<&mut Job, QueueError> {
        let (_, job) = self.jobs.get_mut(&job_id).ok_or(QueueError::NotFound)?;
        if job.state != JobState::Running {
            return Err(QueueError::InvalidState);
        }
        Ok(job)
    }
}

fn eligible_at(now: DateTime<Utc>, delay_ms: i64) -> Result<DateTime<Utc>, QueueError> {
    Duration::try_milliseconds(clamp_delay_ms(delay_ms))
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| QueueError::Internal(format!("retry delay {delay_ms}ms out of range")))
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<JobId, QueueError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            kind: req.kind,
            payload: req.payload,
            state: JobState::Queued,
            priority: req.priority.unwrap_or(DEFAULT_PRIORITY),
            scheduled_at: req.scheduled_at.unwrap_or(now),
            attempts: 0,
            max_attempts: req.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;

        let mut guard = self.inner.lock().await;
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.jobs.insert(id, (seq, job));
        Ok(id)
    }

    async fn pick(&self) -> Result<Option<Job>, QueueError> {
        let mut guard = self.inner.lock().await;
        let now = Utc::now();

        let next = guard
            .jobs
            .values()
            .filter(|(_, j)| j.state == JobState::Queued && j.scheduled_at <= now)
            .min_by_key(|(seq, j)| (j.priority, j.scheduled_at, *seq))
            .map(|(_, j)| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let (_, job) = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::Internal(format!("picked job {id} vanished")))?;
        job.state = JobState::Running;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut guard = self.inner.lock().await;
        let job = guard.running_mut(job_id)?;
        job.state = JobState::Done;
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, job_id: JobId, failure: Failure) -> Result<Job, QueueError> {
        let mut guard = self.inner.lock().await;
        let job = guard.running_mut(job_id)?;
        let now = Utc::now();
        // Resolved before any field changes so an error leaves the lease intact.
        let retry_at = eligible_at(now, failure.delay_ms())?;

        job.attempts += 1;
        job.last_error = Some(failure.error.clone());
        job.updated_at = now;
        if failure.exhausts(job.attempts, job.max_attempts) {
            job.state = JobState::Failed;
        } else {
            job.state = JobState::Queued;
            job.scheduled_at = retry_at;
        }
        Ok(job.clone())
    }

    async fn reschedule(
        &self,
        job_id: JobId,
        reason: &str,
        delay_ms: i64,
    ) -> Result<Job, QueueError> {
        let mut guard = self.inner.lock().await;
        let job = guard.running_mut(job_id)?;
        let now = Utc::now();
        let retry_at = eligible_at(now, delay_ms)?;

        job.state = JobState::Queued;
        job.last_error = Some(reason.to_string());
        job.scheduled_at = retry_at;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let guard = self.inner.lock().await;
        Ok(guard.jobs.get(&job_id).map(|(_, j)| j.clone()))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let guard = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for (_, job) in guard.jobs.values() {
            stats.bump(job.state, 1);
        }
        Ok(stats)
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<Job>, QueueError> {
        let guard = self.inner.lock().await;
        let mut failed: Vec<Job> = guard
            .jobs
            .values()
            .filter(|(_, j)| j.state == JobState::Failed)
            .map(|(_, j)| j.clone())
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut guard = self.inner.lock().await;
        let (_, job) = guard.jobs.get_mut(&job_id).ok_or(QueueError::NotFound)?;
        if job.state != JobState::Failed {
            return Err(QueueError::InvalidState);
        }
        let now = Utc::now();
        job.state = JobState::Queued;
        job.attempts = 0;
        job.last_error = None;
        job.scheduled_at = now;
        job.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl Outbox for MemoryStore {
    async fn write(
        &self,
        job_id: JobId,
        kind: &str,
        content: serde_json::Value,
    ) -> Result<OutboxEntry, QueueError> {
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            job_id,
            kind: kind.to_string(),
            content,
            created_at: Utc::now(),
        };
        self.inner.lock().await.outbox.push(entry.clone());
        Ok(entry)
    }

    async fn by_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, QueueError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .outbox
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn by_type(&self, kind: &str, limit: i64) -> Result<Vec<OutboxEntry>, QueueError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .outbox
            .iter()
            .rev()
            .filter(|e| e.kind == kind)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
