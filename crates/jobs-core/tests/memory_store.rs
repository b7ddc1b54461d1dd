use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobs_core::{
    EnqueueRequest, Failure, JobState, JobStore, MAX_RETRY_DELAY_MS, MemoryStore, Outbox,
    QueueError, QueueStats,
};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_picks_lease_a_job_once() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .enqueue(EnqueueRequest::new("kb.ingest", json!({"doc": 1})))
        .await?;

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.pick().await })
        })
        .collect();

    let mut winners = Vec::new();
    for h in handles {
        if let Some(job) = h.await?? {
            winners.push(job.id);
        }
    }
    assert_eq!(winners, vec![id]);

    let job = store.get(id).await?.expect("job exists");
    assert_eq!(job.state, JobState::Running);
    Ok(())
}

#[tokio::test]
async fn pick_orders_by_priority_then_schedule() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let at = Utc::now() - chrono::Duration::seconds(1);
    for p in [5, 1, 3] {
        store
            .enqueue(
                EnqueueRequest::new("kb.ingest", json!({ "p": p }))
                    .priority(p)
                    .scheduled_at(at),
            )
            .await?;
    }

    let mut order = Vec::new();
    while let Some(job) = store.pick().await? {
        order.push(job.priority);
    }
    assert_eq!(order, vec![1, 3, 5]);
    Ok(())
}

#[tokio::test]
async fn earlier_schedule_wins_within_a_priority() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let now = Utc::now();
    let late = store
        .enqueue(
            EnqueueRequest::new("kb.ingest", json!({}))
                .scheduled_at(now - chrono::Duration::seconds(1)),
        )
        .await?;
    let early = store
        .enqueue(
            EnqueueRequest::new("kb.ingest", json!({}))
                .scheduled_at(now - chrono::Duration::seconds(10)),
        )
        .await?;

    assert_eq!(store.pick().await?.map(|j| j.id), Some(early));
    assert_eq!(store.pick().await?.map(|j| j.id), Some(late));
    Ok(())
}

#[tokio::test]
async fn future_jobs_wait_for_their_time() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store
        .enqueue(
            EnqueueRequest::new("diary.entry", json!({}))
                .scheduled_at(Utc::now() + chrono::Duration::milliseconds(100)),
        )
        .await?;

    assert!(store.pick().await?.is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.pick().await?.map(|j| j.id), Some(id));
    Ok(())
}

#[tokio::test]
async fn enqueue_applies_defaults() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store.enqueue(EnqueueRequest::new("kb.ingest", json!({"a": 1}))).await?;

    let job = store.get(id).await?.expect("job exists");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.priority, 5);
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.payload, json!({"a": 1}));
    assert!(job.scheduled_at <= Utc::now());
    Ok(())
}

#[tokio::test]
async fn retry_accounting_respects_max_attempts() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store
        .enqueue(EnqueueRequest::new("kb.ingest", json!({})).max_attempts(3))
        .await?;

    for n in 1..=2 {
        store.pick().await?.expect("eligible");
        let job = store.fail(id, Failure::retry("503 from upstream", 0)).await?;
        assert_eq!(job.state, JobState::Queued, "after failure {n}");
        assert_eq!(job.attempts, n);
    }

    store.pick().await?.expect("eligible");
    let job = store.fail(id, Failure::retry("503 from upstream", 0)).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("503 from upstream"));
    assert!(store.pick().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn fail_delay_pushes_schedule_out() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;
    store.pick().await?;

    let job = store
        .fail(
            id,
            Failure {
                error: "boom".into(),
                delay_ms: None,
                max_attempts_override: None,
            },
        )
        .await?;
    assert_eq!(job.state, JobState::Queued);
    assert!(job.scheduled_at > Utc::now() + chrono::Duration::milliseconds(500));
    assert!(store.pick().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn oversized_delays_are_clamped() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;
    let ceiling = chrono::Duration::milliseconds(MAX_RETRY_DELAY_MS);

    store.pick().await?;
    let before = Utc::now();
    let job = store.fail(id, Failure::retry("429", i64::MAX)).await?;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.scheduled_at >= before + ceiling);
    assert!(job.scheduled_at <= Utc::now() + ceiling);
    assert!(store.pick().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn oversized_deferral_is_clamped() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;
    store.pick().await?;

    let job = store.reschedule(id, "circuit-open", i64::MAX).await?;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 0);
    assert!(job.scheduled_at <= Utc::now() + chrono::Duration::milliseconds(MAX_RETRY_DELAY_MS));
    assert!(store.pick().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn terminal_failure_ignores_remaining_budget() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store
        .enqueue(EnqueueRequest::new("kb.ingest", json!({})).max_attempts(10))
        .await?;
    store.pick().await?;

    let job = store.fail(id, Failure::terminal("400 bad request")).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn reschedule_keeps_attempts() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;
    store.pick().await?;

    let job = store.reschedule(id, "circuit-open", 0).await?;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.last_error.as_deref(), Some("circuit-open"));
    assert_eq!(store.pick().await?.map(|j| j.id), Some(id));
    Ok(())
}

#[tokio::test]
async fn transitions_require_a_running_job() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;

    assert!(matches!(store.complete(id).await, Err(QueueError::InvalidState)));
    assert!(matches!(
        store.fail(id, Failure::retry("x", 0)).await,
        Err(QueueError::InvalidState)
    ));
    assert!(matches!(
        store.complete(uuid::Uuid::new_v4()).await,
        Err(QueueError::NotFound)
    ));

    store.pick().await?;
    store.complete(id).await?;
    assert!(matches!(store.complete(id).await, Err(QueueError::InvalidState)));
    Ok(())
}

#[tokio::test]
async fn stats_count_by_state() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    for _ in 0..4 {
        store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;
    }
    let a = store.pick().await?.expect("job").id;
    let b = store.pick().await?.expect("job").id;
    store.pick().await?;
    store.complete(a).await?;
    store.fail(b, Failure::terminal("nope")).await?;

    assert_eq!(
        store.stats().await?,
        QueueStats {
            queued: 1,
            running: 1,
            failed: 1,
            done: 1,
        }
    );
    Ok(())
}

#[tokio::test]
async fn failed_jobs_can_be_listed_and_requeued() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let id = store
        .enqueue(EnqueueRequest::new("kb.ingest", json!({})).max_attempts(1))
        .await?;
    store.pick().await?;
    store.fail(id, Failure::retry("boom", 0)).await?;

    let failed = store.list_failed(10).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);

    store.requeue_failed(id).await?;
    let job = store.pick().await?.expect("requeued job is eligible");
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());

    assert!(matches!(
        store.requeue_failed(id).await,
        Err(QueueError::InvalidState)
    ));
    Ok(())
}

#[tokio::test]
async fn outbox_reads_by_job_and_type() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let a = store.enqueue(EnqueueRequest::new("kb.ingest", json!({}))).await?;
    let b = store.enqueue(EnqueueRequest::new("diary.entry", json!({}))).await?;

    store.write(a, "kb.ingest", json!({"chunk": 1})).await?;
    store.write(b, "diary.entry", json!({"mood": "ok"})).await?;
    store.write(a, "kb.ingest", json!({"chunk": 2})).await?;

    let for_a: Vec<_> = store.by_job(a).await?.into_iter().map(|e| e.content).collect();
    assert_eq!(for_a, vec![json!({"chunk": 1}), json!({"chunk": 2})]);

    let kb = store.by_type("kb.ingest", 1).await?;
    assert_eq!(kb.len(), 1);
    assert_eq!(kb[0].content, json!({"chunk": 2}));

    assert_eq!(store.by_type("diary.entry", 10).await?.len(), 1);
    assert!(store.by_type("voice.note", 10).await?.is_empty());
    Ok(())
}
