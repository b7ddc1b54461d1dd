use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use jobs_core::{JobStore, MemoryStore};
use jobs_server::app::{AppState, build_app};
use jobs_worker::{
    CircuitBreaker, HandlerError, HandlerRegistry, JobHandler, Worker, WorkerConfig,
};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Summarise;

#[async_trait]
impl JobHandler for Summarise {
    async fn handle(&self, payload: &Value) -> Result<Value, HandlerError> {
        Ok(json!({ "summary": payload["text"] }))
    }
}

struct Rejecting;

#[async_trait]
impl JobHandler for Rejecting {
    async fn handle(&self, _payload: &Value) -> Result<Value, HandlerError> {
        Err(HandlerError::new("bad prompt").with_status(400))
    }
}

fn setup() -> (Router, Arc<MemoryStore>, Arc<Worker>) {
    let store = Arc::new(MemoryStore::new());
    let cfg = WorkerConfig::default();
    let registry = HandlerRegistry::new()
        .with("diary.entry", Arc::new(Summarise))
        .with("kb.ingest", Arc::new(Rejecting));
    let breaker = Arc::new(CircuitBreaker::new("inference", cfg.breaker.clone()));
    let worker = Arc::new(Worker::new(
        cfg,
        store.clone(),
        store.clone(),
        registry,
        breaker,
    ));
    let app = build_app(AppState {
        store: store.clone(),
        outbox: store.clone(),
        worker: worker.clone(),
    });
    (app, store, worker)
}

async fn send(app: &Router, req: Request<Body>) -> anyhow::Result<(StatusCode, Value)> {
    let resp = app.clone().oneshot(req).await?;
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    Ok((status, body))
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz() -> anyhow::Result<()> {
    let (app, _, _) = setup();
    let (status, body) = send(&app, get("/healthz")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
    Ok(())
}

#[tokio::test]
async fn enqueue_process_and_read_result() -> anyhow::Result<()> {
    let (app, _, worker) = setup();

    let (status, body) = send(
        &app,
        post_json(
            "/v1/jobs",
            json!({"type": "diary.entry", "payload": {"text": "rainy"}, "priority": 1}),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let id = body["jobId"].as_str().expect("jobId").to_string();

    let (status, job) = send(&app, get(&format!("/v1/jobs/{id}"))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "queued");
    assert_eq!(job["type"], "diary.entry");
    assert_eq!(job["priority"], 1);

    worker.run_once().await?;

    let (_, job) = send(&app, get(&format!("/v1/jobs/{id}"))).await?;
    assert_eq!(job["state"], "done");

    let (status, outbox) = send(&app, get(&format!("/v1/jobs/{id}/outbox"))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outbox["entries"][0]["content"], json!({"summary": "rainy"}));
    assert_eq!(outbox["entries"][0]["jobId"], id.as_str());

    let (_, by_type) = send(&app, get("/v1/outbox?type=diary.entry&limit=5")).await?;
    assert_eq!(by_type["entries"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn enqueue_rejects_unknown_type_and_bad_budget() -> anyhow::Result<()> {
    let (app, store, _) = setup();

    let (status, _) = send(
        &app,
        post_json("/v1/jobs", json!({"type": "voice.note", "payload": {}})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/v1/jobs",
            json!({"type": "kb.ingest", "payload": {}, "maxAttempts": 0}),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(store.stats().await?.queued, 0);
    Ok(())
}

#[tokio::test]
async fn missing_job_is_404() -> anyhow::Result<()> {
    let (app, _, _) = setup();
    let (status, _) = send(&app, get(&format!("/v1/jobs/{}", uuid::Uuid::new_v4()))).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn status_reports_worker_and_queue() -> anyhow::Result<()> {
    let (app, _, worker) = setup();

    send(
        &app,
        post_json("/v1/jobs", json!({"type": "kb.ingest", "payload": {}})),
    )
    .await?;
    send(
        &app,
        post_json("/v1/jobs", json!({"type": "diary.entry", "payload": {"text": "x"}})),
    )
    .await?;
    worker.run_once().await?;

    let (status, body) = send(&app, get("/v1/status")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker"]["isRunning"], false);
    assert_eq!(body["worker"]["breaker"]["state"], "closed");
    assert_eq!(body["worker"]["breaker"]["openedAt"], Value::Null);
    assert_eq!(body["queue"]["queued"], 1);
    assert_eq!(
        body["queue"]["done"].as_i64().unwrap() + body["queue"]["failed"].as_i64().unwrap(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn failed_jobs_can_be_listed_and_requeued() -> anyhow::Result<()> {
    let (app, _, worker) = setup();

    let (_, body) = send(
        &app,
        post_json("/v1/jobs", json!({"type": "kb.ingest", "payload": {}})),
    )
    .await?;
    let id = body["jobId"].as_str().expect("jobId").to_string();
    worker.run_once().await?;

    let (status, failed) = send(&app, get("/v1/admin/failed?limit=10")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed["jobs"][0]["id"], id.as_str());
    assert_eq!(failed["jobs"][0]["state"], "failed");

    let (status, _) = send(
        &app,
        Request::post(format!("/v1/admin/jobs/{id}/requeue"))
            .body(Body::empty())
            .unwrap(),
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, job) = send(&app, get(&format!("/v1/jobs/{id}"))).await?;
    assert_eq!(job["state"], "queued");
    assert_eq!(job["attempts"], 0);

    let (status, _) = send(
        &app,
        Request::post(format!("/v1/admin/jobs/{id}/requeue"))
            .body(Body::empty())
            .unwrap(),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn metrics_are_exposed() -> anyhow::Result<()> {
    jobs_server::metrics::init_metrics();
    let (app, _, _) = setup();
    send(
        &app,
        post_json("/v1/jobs", json!({"type": "kb.ingest", "payload": {}})),
    )
    .await?;

    let (status, body) = send(&app, get("/metrics")).await?;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap_or_default();
    assert!(text.contains("jobs_enqueued_total"));
    assert!(text.contains("breaker_state"));
    assert!(text.contains(r#"jobs{state="queued"}"#));
    assert!(text.contains(r#"jobs{state="failed"}"#));
    Ok(())
}
