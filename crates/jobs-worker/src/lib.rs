pub mod backoff;
pub mod breaker;
pub mod handler;
pub mod inference;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use jobs_core::{
    Failure, Job, JobId, JobState, JobStore, MAX_RETRY_DELAY_MS, Outbox, QueueError,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use backoff::{Backoff, StatusClass, classify_status, compute_backoff, parse_retry_after};
pub use breaker::{Admission, BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use handler::{HandlerError, HandlerRegistry, JobHandler};

/// `last_error` recorded when a job is pushed back because the circuit is open.
pub const CIRCUIT_OPEN: &str = "circuit-open";

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,      // e.g. 4
    pub poll_interval_ms: u64,   // e.g. 500
    pub handler_timeout_ms: u64, // e.g. 60000
    pub breaker: BreakerConfig,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            handler_timeout_ms: 60_000,
            breaker: BreakerConfig::default(),
            backoff: Backoff::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            concurrency: env_or("CONCURRENCY", d.concurrency).max(1),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", d.poll_interval_ms),
            handler_timeout_ms: env_or("HANDLER_TIMEOUT_MS", d.handler_timeout_ms),
            breaker: BreakerConfig {
                failure_threshold: env_or(
                    "BREAKER_FAILURE_THRESHOLD",
                    d.breaker.failure_threshold,
                )
                .max(1),
                open_duration: Duration::from_millis(env_or(
                    "BREAKER_OPEN_MS",
                    d.breaker.open_duration.as_millis() as u64,
                )),
            },
            backoff: Backoff::new(
                env_or("BACKOFF_BASE_MS", d.backoff.base_ms()),
                env_or("BACKOFF_CAP_MS", d.backoff.cap_ms()),
            ),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Caps a delay at `MAX_RETRY_DELAY_MS` so it always fits the store's clock arithmetic.
fn bounded_delay(delay_ms: u64) -> u64 {
    delay_ms.min(MAX_RETRY_DELAY_MS as u64)
}

/// How one leased job was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Back in the queue after a retryable failure.
    Retrying { delay_ms: u64 },
    /// Terminal; `attempts` as stored.
    Failed { attempts: i32 },
    /// Circuit open: requeued without spending an attempt.
    Deferred { delay_ms: u64 },
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub is_running: bool,
    pub breaker: BreakerSnapshot,
}

/// Leases jobs from a [`JobStore`] and runs them through their handlers behind
/// a [`CircuitBreaker`]. Construct once per process and share via `Arc`.
pub struct Worker {
    cfg: WorkerConfig,
    store: Arc<dyn JobStore>,
    outbox: Arc<dyn Outbox>,
    registry: HandlerRegistry,
    breaker: Arc<CircuitBreaker>,
    active_loops: AtomicUsize,
}

/// Keeps `active_loops` accurate however a loop exits.
struct LoopGuard<'a>(&'a AtomicUsize);

impl<'a> LoopGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        store: Arc<dyn JobStore>,
        outbox: Arc<dyn Outbox>,
        registry: HandlerRegistry,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            cfg,
            store,
            outbox,
            registry,
            breaker,
            active_loops: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_running(&self) -> bool {
        self.active_loops.load(Ordering::SeqCst) > 0
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            is_running: self.is_running(),
            breaker: self.breaker.snapshot().await,
        }
    }

    /// Starts `concurrency` loops. They stop once `shutdown` is cancelled,
    /// after finishing the job in hand.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            concurrency = self.cfg.concurrency,
            poll_interval_ms = self.cfg.poll_interval_ms,
            handler_timeout_ms = self.cfg.handler_timeout_ms,
            failure_threshold = self.cfg.breaker.failure_threshold,
            breaker = %self.breaker.name(),
            kinds = ?self.registry.kinds(),
            "worker started"
        );

        (0..self.cfg.concurrency)
            .map(|idx| {
                let worker = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(idx, shutdown).await })
            })
            .collect()
    }

    /// One serial loop: at most one job in flight.
    pub async fn run(&self, idx: usize, shutdown: CancellationToken) {
        let _guard = LoopGuard::enter(&self.active_loops);

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                // Deferred jobs are still eligible soon; pause like an empty poll.
                Ok(Some((_, Outcome::Deferred { .. }))) => {}
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(loop_idx = idx, error = %e, "worker iteration failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
            }
        }

        tracing::info!(loop_idx = idx, "worker loop stopped");
    }

    /// Leases and resolves a single job. `None` when nothing is eligible.
    pub async fn run_once(&self) -> Result<Option<(JobId, Outcome)>, QueueError> {
        let Some(job) = self.store.pick().await? else {
            return Ok(None);
        };
        let id = job.id;
        let outcome = self.process(job).await?;
        Ok(Some((id, outcome)))
    }

    async fn process(&self, job: Job) -> Result<Outcome, QueueError> {
        let attempt = job.attempts.max(0) as u32;

        // Checked before the breaker so a bad type never holds the probe slot.
        let Some(handler) = self.registry.get(&job.kind) else {
            tracing::warn!(job_id = %job.id, kind = %job.kind, "no handler registered");
            let failed = self
                .store
                .fail(job.id, Failure::terminal(format!("unknown job type: {}", job.kind)))
                .await?;
            return Ok(Outcome::Failed {
                attempts: failed.attempts,
            });
        };

        let Some(admission) = self.breaker.acquire().await else {
            let delay_ms = bounded_delay(self.cfg.backoff.delay_ms(attempt));
            tracing::debug!(job_id = %job.id, delay_ms, "circuit open, deferring job");
            self.store
                .reschedule(job.id, CIRCUIT_OPEN, delay_ms as i64)
                .await?;
            return Ok(Outcome::Deferred { delay_ms });
        };

        let probe = admission == Admission::Probe;
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            attempts = job.attempts,
            probe,
            "processing job"
        );

        let timeout = self.cfg.handler_timeout();
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { handler.handle(&payload).await });
        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                tracing::error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    error = %join,
                    "handler panicked"
                );
                Err(HandlerError::new(format!("handler panicked: {join}")))
            }
            Err(_) => {
                task.abort();
                Err(HandlerError::timeout(timeout))
            }
        };

        match result {
            Ok(content) => {
                self.breaker.on_success().await;
                self.finish(&job, content).await?;
                Ok(Outcome::Completed)
            }
            Err(err) => {
                self.breaker.on_failure().await;
                self.resolve_failure(&job, attempt, err).await
            }
        }
    }

    /// Outbox first, then `done`: a crash in between leaves the result on
    /// record rather than losing it.
    async fn finish(&self, job: &Job, content: serde_json::Value) -> Result<(), QueueError> {
        if let Err(e) = self.outbox.write(job.id, &job.kind, content).await {
            tracing::warn!(job_id = %job.id, error = %e, "outbox write failed");
            let delay_ms = bounded_delay(self.cfg.backoff.delay_ms(job.attempts.max(0) as u32));
            self.store
                .fail(job.id, Failure::retry(format!("outbox write failed: {e}"), delay_ms as i64))
                .await?;
            return Err(e);
        }
        self.store.complete(job.id).await?;
        tracing::info!(job_id = %job.id, kind = %job.kind, "job done");
        Ok(())
    }

    async fn resolve_failure(
        &self,
        job: &Job,
        attempt: u32,
        err: HandlerError,
    ) -> Result<Outcome, QueueError> {
        let class = err.class();

        let (failure, delay_ms) = if class.is_retryable() {
            let delay_ms = bounded_delay(
                parse_retry_after(&err.headers)
                    .unwrap_or_else(|| self.cfg.backoff.delay_ms(attempt)),
            );
            (Failure::retry(err.to_string(), delay_ms as i64), Some(delay_ms))
        } else {
            (Failure::terminal(err.to_string()), None)
        };

        let after = self.store.fail(job.id, failure).await?;

        match (after.state, delay_ms) {
            (JobState::Queued, Some(delay_ms)) => {
                tracing::warn!(
                    job_id = %job.id,
                    status = ?err.status,
                    class = ?class,
                    attempts = after.attempts,
                    delay_ms,
                    error = %err,
                    "job failed, retrying"
                );
                Ok(Outcome::Retrying { delay_ms })
            }
            _ => {
                tracing::warn!(
                    job_id = %job.id,
                    status = ?err.status,
                    class = ?class,
                    attempts = after.attempts,
                    error = %err,
                    "job failed permanently"
                );
                Ok(Outcome::Failed {
                    attempts: after.attempts,
                })
            }
        }
    }
}
