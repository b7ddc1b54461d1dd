use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, EnqueueRequest, Failure, Job, JobId, JobState,
    JobStore, Outbox, OutboxEntry, QueueError, QueueStats, clamp_delay_ms,
};

const JOB_COLUMNS: &str = r#"
    id, kind, payload, state::text AS state, priority, scheduled_at,
    attempts, max_attempts, last_error, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguishes "no such job" from "job in the wrong state" after an
    /// update guarded on state matched nothing.
    async fn missing_or_invalid(&self, job_id: JobId) -> QueueError {
        match self.get(job_id).await {
            Ok(Some(_)) => QueueError::InvalidState,
            Ok(None) => QueueError::NotFound,
            Err(e) => e,
        }
    }
}

fn parse_state(s: &str) -> Result<JobState, QueueError> {
    match s {
        "queued" => Ok(JobState::Queued),
        "running" => Ok(JobState::Running),
        "done" => Ok(JobState::Done),
        "failed" => Ok(JobState::Failed),
        other => Err(QueueError::Internal(format!("unknown job state: {other}"))),
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, QueueError> {
    let state: String = row.try_get("state")?;

    Ok(Job {
        id: row.try_get::<Uuid, _>("id")?,
        kind: row.try_get::<String, _>("kind")?,
        payload: row.try_get::<Value, _>("payload")?,
        state: parse_state(&state)?,
        priority: row.try_get::<i32, _>("priority")?,
        scheduled_at: row.try_get::<DateTime<Utc>, _>("scheduled_at")?,
        attempts: row.try_get::<i32, _>("attempts")?,
        max_attempts: row.try_get::<i32, _>("max_attempts")?,
        last_error: row.try_get::<Option<String>, _>("last_error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, QueueError> {
    Ok(OutboxEntry {
        id: row.try_get::<Uuid, _>("id")?,
        job_id: row.try_get::<Uuid, _>("job_id")?,
        kind: row.try_get::<String, _>("kind")?,
        content: row.try_get::<Value, _>("content")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<JobId, QueueError> {
        let id: Uuid = Uuid::new_v4();

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, payload, priority, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()))
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(req.kind)
        .bind(req.payload)
        .bind(req.priority.unwrap_or(DEFAULT_PRIORITY))
        .bind(req.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
        .bind(req.scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<Uuid, _>("id")?)
    }

    async fn pick(&self) -> Result<Option<Job>, QueueError> {
        // SKIP LOCKED lets concurrent pickers pass over a row another
        // transaction is claiming instead of blocking on it or taking it twice.
        let sql = format!(
            r#"
            WITH cte AS (
              SELECT id AS pick_id
              FROM jobs
              WHERE state = 'queued'::job_state
                AND scheduled_at <= now()
              ORDER BY priority ASC, scheduled_at ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE jobs j
            SET state = 'running'::job_state,
                updated_at = now()
            FROM cte
            WHERE j.id = cte.pick_id
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'done'::job_state,
                last_error = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running'::job_state
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(self.missing_or_invalid(job_id).await);
        }
        Ok(())
    }

    async fn fail(&self, job_id: JobId, failure: Failure) -> Result<Job, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                last_error = $2,
                state = CASE
                  WHEN (attempts + 1) >= COALESCE($4, max_attempts) THEN 'failed'::job_state
                  ELSE 'queued'::job_state
                END,
                scheduled_at = CASE
                  WHEN (attempts + 1) >= COALESCE($4, max_attempts) THEN scheduled_at
                  ELSE now() + ($3::bigint * interval '1 millisecond')
                END,
                updated_at = now()
            WHERE id = $1 AND state = 'running'::job_state
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(failure.error.as_str())
            .bind(failure.delay_ms())
            .bind(failure.max_attempts_override)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.missing_or_invalid(job_id).await),
        }
    }

    async fn reschedule(
        &self,
        job_id: JobId,
        reason: &str,
        delay_ms: i64,
    ) -> Result<Job, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'queued'::job_state,
                last_error = $2,
                scheduled_at = now() + ($3::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1 AND state = 'running'::job_state
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(reason)
            .bind(clamp_delay_ms(delay_ms))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.missing_or_invalid(job_id).await),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT state::text AS state, count(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            stats.bump(parse_state(&state)?, n);
        }
        Ok(stats)
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = 'failed'::job_state
            ORDER BY updated_at DESC
            LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<(), QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued'::job_state,
                attempts = 0,
                last_error = NULL,
                scheduled_at = now(),
                updated_at = now()
            WHERE id = $1 AND state = 'failed'::job_state
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(self.missing_or_invalid(job_id).await);
        }
        Ok(())
    }
}

#[async_trait]
impl Outbox for PostgresStore {
    async fn write(
        &self,
        job_id: JobId,
        kind: &str,
        content: Value,
    ) -> Result<OutboxEntry, QueueError> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox (id, job_id, kind, content)
            VALUES ($1, $2, $3, $4)
            RETURNING id, job_id, kind, content, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(kind)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        row_to_entry(&row)
    }

    async fn by_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, kind, content, created_at
            FROM outbox
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn by_type(&self, kind: &str, limit: i64) -> Result<Vec<OutboxEntry>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, kind, content, created_at
            FROM outbox
            WHERE kind = $1
            ORDER BY seq DESC
            LIMIT $2
            "#,
        )
        .bind(kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }
}
