//! Postgres-backed job store.
//!
//! Expects an `analysis_jobs` table with a `bigserial` `id`, a `uuid` `job_uuid`,
//! `news_event_id uuid`, `job_type text`, `status text`, `attempts integer`,
//! `next_run_at`/`locked_at`/`created_at`/`updated_at timestamptz`, `locked_by text`,
//! `trace_id uuid`, `last_error text`, and a unique constraint on
//! `(news_event_id, job_type)`.
//!
//! ## Claim
//!
//! One transaction selects eligible rows with `FOR UPDATE SKIP LOCKED` and flips
//! them to `running`. Concurrent workers skip rows another transaction holds
//! instead of waiting, so claimed sets are disjoint. Outcome updates run later in
//! their own statements, guarded by `locked_by`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use newsflow_core::{JobUuid, NewsEventId, TraceId};

use super::store::{JobStats, JobStore, JobStoreError, LEASE_EXPIRED_ERROR};
use super::types::{AnalysisJob, JobId, JobStatus, JobType, RetryPolicy, truncate_error};

const JOB_COLUMNS: &str = "id, job_uuid, news_event_id, job_type, status, attempts, next_run_at, \
     locked_by, locked_at, trace_id, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Distinguish a missing row from a lost lease after a guarded update matched nothing.
    async fn lease_error(&self, id: JobId, worker_id: &str) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(_)) => JobStoreError::LeaseLost {
                id,
                worker_id: worker_id.to_string(),
            },
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(news_event_id = %news_event_id, trace_id = %trace_id), err)]
    async fn publish(
        &self,
        news_event_id: NewsEventId,
        trace_id: TraceId,
        job_type: JobType,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO analysis_jobs (
                job_uuid,
                news_event_id,
                job_type,
                status,
                attempts,
                next_run_at,
                trace_id,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, 'pending', 0, NOW(), $4, NOW(), NOW())
            ON CONFLICT (news_event_id, job_type) DO NOTHING
            "#,
        )
        .bind(JobUuid::new().as_uuid())
        .bind(news_event_id.as_uuid())
        .bind(job_type.as_str())
        .bind(trace_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("publish_job", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_batch(
        &self,
        batch_size: usize,
        max_attempts: u32,
        worker_id: &str,
    ) -> Result<Vec<AnalysisJob>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!(
            r#"
            WITH cte AS (
                SELECT id
                FROM analysis_jobs
                WHERE status IN ('pending', 'failed')
                  AND next_run_at <= NOW()
                  AND attempts < $1
                ORDER BY next_run_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE analysis_jobs j
            SET status = 'running', locked_at = NOW(), locked_by = $3, updated_at = NOW()
            FROM cte
            WHERE j.id = cte.id
            RETURNING {}
            "#,
            prefixed_columns("j")
        );

        let rows = sqlx::query(&sql)
            .bind(max_attempts as i32)
            .bind(batch_size as i64)
            .bind(worker_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_jobs", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| (j.next_run_at, j.created_at, j.id));

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_done(&self, id: JobId, worker_id: &str) -> Result<AnalysisJob, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'done', last_error = NULL, locked_by = NULL, locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(worker_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_done", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.lease_error(id, worker_id).await),
        }
    }

    #[instrument(skip(self, error, policy), fields(job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<AnalysisJob, JobStoreError> {
        // Backoff depends on the post-increment attempt count, which the row holds.
        let base = policy.base_delay.as_secs_f64();
        let cap = policy.max_delay.as_secs_f64();
        let sql = format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $3,
                next_run_at = NOW() + make_interval(
                    secs => LEAST(POWER(2, LEAST(attempts + 1, 32))::float8 * $4, $5)
                ),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(worker_id)
            .bind(truncate_error(error))
            .bind(base)
            .bind(cap)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.lease_error(id, worker_id).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                next_run_at = NOW(),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND locked_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(lease_timeout.as_secs_f64())
        .bind(LEASE_EXPIRED_ERROR)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<AnalysisJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(news_event_id = %news_event_id), err)]
    async fn find(
        &self,
        news_event_id: NewsEventId,
        job_type: JobType,
    ) -> Result<Option<AnalysisJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE news_event_id = $1 AND job_type = $2"
        ))
        .bind(news_event_id.as_uuid())
        .bind(job_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, max_attempts: u32) -> Result<JobStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status <> 'done' AND attempts >= $1) AS exhausted
            FROM analysis_jobs
            "#,
        )
        .bind(max_attempts as i32)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let count = |name: &str| -> Result<u64, JobStoreError> {
            let value: i64 = row
                .try_get(name)
                .map_err(|e| JobStoreError::Storage(format!("failed to read {name}: {e}")))?;
            Ok(value.max(0) as u64)
        };

        Ok(JobStats {
            pending: count("pending")?,
            running: count("running")?,
            done: count("done")?,
            failed: count("failed")?,
            exhausted: count("exhausted")?,
        })
    }
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_job(row: &PgRow) -> Result<AnalysisJob, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    row.try_into()
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    job_uuid: uuid::Uuid,
    news_event_id: uuid::Uuid,
    job_type: String,
    status: String,
    attempts: i32,
    next_run_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    trace_id: Option<uuid::Uuid>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_uuid: row.try_get("job_uuid")?,
            news_event_id: row.try_get("news_event_id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            trace_id: row.try_get("trace_id")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for AnalysisJob {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown job status: {}", row.status)))?;

        Ok(AnalysisJob {
            id: JobId(row.id),
            job_uuid: JobUuid::from_uuid(row.job_uuid),
            news_event_id: NewsEventId::from_uuid(row.news_event_id),
            job_type: row.job_type,
            status,
            attempts: row.attempts.max(0) as u32,
            next_run_at: row.next_run_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            trace_id: row.trace_id.map(TraceId::from_uuid),
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
