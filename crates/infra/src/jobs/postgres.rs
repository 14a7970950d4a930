//! Postgres-backed job record store.
//!
//! The job itself is stored as a JSONB document next to a few indexed columns
//! (`status`, `school_id`, `created_at`). Lease and cancellation state live in their
//! own columns so they can be changed without rewriting the record.
//!
//! Lease expiry uses the database clock (`now()`), so workers on different hosts agree
//! on who holds a job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|-----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / network / other | n/a | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use timetable_core::{Job, JobId};

use super::store::{JobFilter, JobRecordStore, JobStats, JobStoreError, check_forward};
use super::types::{CancelRequest, ClaimOutcome, Lease};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS optimization_jobs (
    job_id              UUID PRIMARY KEY,
    school_id           TEXT NOT NULL,
    status              TEXT NOT NULL,
    record              JSONB NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    lease_owner         TEXT,
    lease_token         UUID,
    lease_expires_at    TIMESTAMPTZ,
    cancel_requested_at TIMESTAMPTZ,
    cancel_reason       TEXT
);
CREATE INDEX IF NOT EXISTS optimization_jobs_status_created_idx
    ON optimization_jobs (status, created_at DESC);
CREATE INDEX IF NOT EXISTS optimization_jobs_school_created_idx
    ON optimization_jobs (school_id, created_at DESC);
"#;

/// Durable job store.
///
/// `Send + Sync`; every operation goes through the SQLx pool.
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

    /// Connect and make sure the table exists.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait::async_trait]
impl JobRecordStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let record = encode(&job)?;
        sqlx::query(
            r#"
            INSERT INTO optimization_jobs (job_id, school_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(job.school_id.as_str())
        .bind(job.status().as_str())
        .bind(record)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT record FROM optimization_jobs WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn claim(
        &self,
        job_id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut tx = self.begin("claim").await?;

        let row = sqlx::query(
            r#"
            SELECT
                record,
                lease_owner,
                lease_token IS NOT NULL AND lease_expires_at > now() AS held,
                EXTRACT(EPOCH FROM (lease_expires_at - now()))::float8 AS remaining_secs
            FROM optimization_jobs
            WHERE job_id = $1
            FOR UPDATE
            "#,
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            return Ok(ClaimOutcome::NotFound);
        };
        let job = decode_row(&row)?;
        if job.is_terminal() {
            return Ok(ClaimOutcome::Terminal(job));
        }

        let held: bool = row.try_get("held").map_err(|e| map_sqlx_error("claim", e))?;
        if held {
            let holder: Option<String> = row
                .try_get("lease_owner")
                .map_err(|e| map_sqlx_error("claim", e))?;
            let remaining: Option<f64> = row
                .try_get("remaining_secs")
                .map_err(|e| map_sqlx_error("claim", e))?;
            return Ok(ClaimOutcome::Held {
                owner: holder.unwrap_or_default(),
                remaining: Duration::from_secs_f64(remaining.unwrap_or(0.0).max(0.0)),
            });
        }

        let lease = Lease::new(job_id, owner);
        sqlx::query(
            r#"
            UPDATE optimization_jobs
            SET lease_owner = $2,
                lease_token = $3,
                lease_expires_at = now() + make_interval(secs => $4)
            WHERE job_id = $1
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(&lease.owner)
        .bind(lease.token)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("claim", e))?;
        debug!(job_id = %job_id, owner, "lease acquired");
        Ok(ClaimOutcome::Acquired { job, lease })
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id), err)]
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE optimization_jobs
            SET lease_expires_at = now() + make_interval(secs => $3)
            WHERE job_id = $1 AND lease_token = $2
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(lease.token)
        .bind(ttl.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::LeaseLost(lease.job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id), err)]
    async fn release_lease(&self, lease: &Lease) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE optimization_jobs
            SET lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL
            WHERE job_id = $1 AND lease_token = $2
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(lease.token)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_lease", e))?;
        Ok(())
    }

    #[instrument(skip(self, job, lease), fields(job_id = %job.id, status = %job.status()), err)]
    async fn save(&self, job: &Job, lease: &Lease) -> Result<(), JobStoreError> {
        if lease.job_id != job.id {
            return Err(JobStoreError::LeaseLost(job.id));
        }
        let mut tx = self.begin("save").await?;

        let row = sqlx::query(
            "SELECT record, lease_token FROM optimization_jobs WHERE job_id = $1 FOR UPDATE",
        )
        .bind(*job.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save", e))?
        .ok_or(JobStoreError::NotFound(job.id))?;

        let token: Option<Uuid> = row
            .try_get("lease_token")
            .map_err(|e| map_sqlx_error("save", e))?;
        if token != Some(lease.token) {
            return Err(JobStoreError::LeaseLost(job.id));
        }
        let stored = decode_row(&row)?;
        check_forward(&stored, job)?;

        sqlx::query(
            r#"
            UPDATE optimization_jobs
            SET status = $2, record = $3, updated_at = $4
            WHERE job_id = $1
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(job.status().as_str())
        .bind(encode(job)?)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    #[instrument(skip(self, reason), fields(job_id = %job_id), err)]
    async fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<CancelRequest, JobStoreError> {
        let mut tx = self.begin("request_cancel").await?;

        let row = sqlx::query(
            r#"
            SELECT record, cancel_requested_at, cancel_reason
            FROM optimization_jobs
            WHERE job_id = $1
            FOR UPDATE
            "#,
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("request_cancel", e))?
        .ok_or(JobStoreError::NotFound(job_id))?;

        let job = decode_row(&row)?;
        if job.is_terminal() {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id} is already {}",
                job.status()
            )));
        }
        if let Some(existing) = cancel_from_row(&row)? {
            return Ok(existing);
        }

        let request = CancelRequest {
            requested_at: Utc::now(),
            reason,
        };
        sqlx::query(
            r#"
            UPDATE optimization_jobs
            SET cancel_requested_at = $2, cancel_reason = $3
            WHERE job_id = $1
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(request.requested_at)
        .bind(request.reason.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("request_cancel", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("request_cancel", e))?;
        Ok(request)
    }

    async fn cancel_requested(&self, job_id: JobId) -> Result<Option<CancelRequest>, JobStoreError> {
        let row = sqlx::query(
            "SELECT cancel_requested_at, cancel_reason FROM optimization_jobs WHERE job_id = $1",
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_requested", e))?;

        match row {
            Some(row) => cancel_from_row(&row),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record
            FROM optimization_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR school_id = $2)
            ORDER BY created_at DESC, job_id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.school_id.as_ref().map(|s| s.as_str()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM optimization_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("bad status column: {e}")))?;
            stats.add(status, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM optimization_jobs WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(())
    }
}

fn encode(job: &Job) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(job)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode job {}: {e}", job.id)))
}

fn decode_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let record: serde_json::Value = row
        .try_get("record")
        .map_err(|e| map_sqlx_error("decode", e))?;
    serde_json::from_value(record)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job record: {e}")))
}

fn cancel_from_row(row: &PgRow) -> Result<Option<CancelRequest>, JobStoreError> {
    let requested_at: Option<DateTime<Utc>> = row
        .try_get("cancel_requested_at")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let reason: Option<String> = row
        .try_get("cancel_reason")
        .map_err(|e| map_sqlx_error("decode", e))?;
    Ok(requested_at.map(|requested_at| CancelRequest {
        requested_at,
        reason,
    }))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
