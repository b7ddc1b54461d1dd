use jobs_core::{JobState, QueueStats};
use jobs_worker::{BreakerSnapshot, BreakerState};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static JOBS_ENQUEUED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_enqueued_total", "Total jobs enqueued").unwrap());

pub static JOBS_REQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("jobs_requeued_total", "Failed jobs requeued by an operator").unwrap()
});

pub static JOBS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("jobs", "Jobs currently in each state"), &["state"]).unwrap()
});

pub static BREAKER_STATE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("breaker_state", "Circuit breaker: 0 closed, 1 half-open, 2 open").unwrap()
});

pub static BREAKER_FAILURES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("breaker_failures", "Consecutive upstream failures").unwrap()
});

pub fn init_metrics() {
    // Ignore errors if called multiple times (common in tests)
    let _ = REGISTRY.register(Box::new(JOBS_ENQUEUED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_REQUEUED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_BY_STATE.clone()));
    let _ = REGISTRY.register(Box::new(BREAKER_STATE.clone()));
    let _ = REGISTRY.register(Box::new(BREAKER_FAILURES.clone()));
}

/// Refreshes the gauges that mirror store and breaker state at scrape time.
pub fn observe(stats: &QueueStats, breaker: &BreakerSnapshot) {
    for (state, count) in [
        (JobState::Queued, stats.queued),
        (JobState::Running, stats.running),
        (JobState::Done, stats.done),
        (JobState::Failed, stats.failed),
    ] {
        JOBS_BY_STATE.with_label_values(&[state.as_str()]).set(count);
    }

    BREAKER_STATE.set(match breaker.state {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    });
    BREAKER_FAILURES.set(i64::from(breaker.failures));
}

pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
