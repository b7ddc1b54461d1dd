use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
/// Retry spacing used by `fail` when the caller gives no delay.
pub const DEFAULT_RETRY_DELAY_MS: i64 = 1_000;
/// Upper bound on any retry or deferral delay. Longer requests are clamped.
pub const MAX_RETRY_DELAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[schema(value_type = String, example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: JobId,
    /// Handler tag, e.g. `kb.ingest`.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,

    pub state: JobState,

    /// Lower value is served first.
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,

    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    /// Defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: None,
            max_attempts: None,
            scheduled_at: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    #[schema(value_type = String, example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: JobId,
}

/// Outcome of a failed lease, handed to [`crate::JobStore::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error: String,
    /// Delay before the job becomes eligible again; `DEFAULT_RETRY_DELAY_MS` when unset.
    pub delay_ms: Option<i64>,
    /// Replaces the job's `max_attempts` for this decision only.
    pub max_attempts_override: Option<i32>,
}

impl Failure {
    pub fn retry(error: impl Into<String>, delay_ms: i64) -> Self {
        Self {
            error: error.into(),
            delay_ms: Some(delay_ms),
            max_attempts_override: None,
        }
    }

    /// A failure that ends the job regardless of its remaining attempt budget.
    pub fn terminal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            delay_ms: Some(0),
            max_attempts_override: Some(0),
        }
    }

    pub(crate) fn delay_ms(&self) -> i64 {
        clamp_delay_ms(self.delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS))
    }

    /// Whether a job at `attempts` (already incremented) with `max_attempts` is finished.
    pub(crate) fn exhausts(&self, attempts: i32, max_attempts: i32) -> bool {
        attempts >= self.max_attempts_override.unwrap_or(max_attempts)
    }
}

/// Bounds a requested delay to `[0, MAX_RETRY_DELAY_MS]`.
pub fn clamp_delay_ms(delay_ms: i64) -> i64 {
    delay_ms.clamp(0, MAX_RETRY_DELAY_MS)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub failed: i64,
    pub done: i64,
}

impl QueueStats {
    pub(crate) fn bump(&mut self, state: JobState, n: i64) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::Running => self.running += n,
            JobState::Done => self.done += n,
            JobState::Failed => self.failed += n,
        }
    }
}
