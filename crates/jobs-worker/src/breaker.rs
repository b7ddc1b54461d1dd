use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the open duration has elapsed.
    Open,
    /// One probe call decides between closed and open.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(15),
        }
    }
}

/// Granted by [`CircuitBreaker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, ordinary call.
    Pass,
    /// The single half-open probe; its outcome closes or reopens the circuit.
    Probe,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    /// Wall-clock twin of `opened_at`, for reporting only.
    opened_at_utc: Option<DateTime<Utc>>,
    probing: bool,
}

impl Inner {
    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.probing = false;
    }

    fn cooled_down(&self, open_duration: Duration) -> bool {
        self.opened_at
            .is_some_and(|at| Instant::now().duration_since(at) > open_duration)
    }
}

/// Guards one upstream dependency. Process-local and never persisted: a
/// restart starts closed. Every method takes the internal lock, so a single
/// breaker can be shared by all worker loops of a process.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                opened_at_utc: None,
                probing: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may be attempted now. An open circuit whose cool-down
    /// has elapsed moves to half-open here and admits the caller, who must
    /// then [`mark_probe`](Self::mark_probe) before calling.
    pub async fn can_request(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.admit(&mut inner)
    }

    /// Claims the half-open probe slot.
    pub async fn mark_probe(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == BreakerState::HalfOpen {
            inner.probing = true;
        }
    }

    /// `can_request` and `mark_probe` under one lock acquisition, so two
    /// loops sharing the breaker cannot both take the probe.
    pub async fn acquire(&self) -> Option<Admission> {
        let mut inner = self.inner.lock().await;
        if !self.admit(&mut inner) {
            return None;
        }
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probing = true;
                Some(Admission::Probe)
            }
            _ => Some(Admission::Pass),
        }
    }

    pub async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, from = ?inner.state, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.probing = false;
        inner.opened_at = None;
        inner.opened_at_utc = None;
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures = inner.failures.saturating_add(1);

        match inner.state {
            BreakerState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit opened after consecutive failures"
                    );
                    inner.trip();
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit reopened");
                inner.trip();
            }
            // Late result of a call admitted before the trip.
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            opened_at: inner.opened_at_utc,
        }
    }

    fn admit(&self, inner: &mut Inner) -> bool {
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.cooled_down(self.config.open_duration) {
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probing = false;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => !inner.probing,
        }
    }
}
