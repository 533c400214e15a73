//! Repository for durable queue jobs.
//!
//! Backs the job queue with PostgreSQL: enqueueing, lock-free claiming via
//! `FOR UPDATE SKIP LOCKED`, retry scheduling, dead-lettering and the
//! introspection the operator CLI needs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{EnqueueOptions, Job, JobCounts, JobId},
};

const JOB_COLUMNS: &str = "id, name, payload, status, attempts_made, max_attempts, last_error, \
                           request_id, created_at, last_attempt_at, next_retry_at, completed_at, \
                           failed_at";

/// How many completed jobs to retain for observability.
///
/// Completed history is bounded to avoid unbounded table growth; dead-letter
/// history is deliberately unbounded so operators never lose failures.
pub const COMPLETED_RETENTION: i64 = 100;

/// How long an `active` job may sit unattended before it is reclaimed.
///
/// A worker that crashes mid-job never settles the row; once
/// `last_attempt_at` is this far in the past the job counts as abandoned
/// and becomes claimable again. Must exceed the longest legitimate hold
/// time (CRM timeout times the local retry attempts, plus backoff).
pub const STALLED_CLAIM_AFTER: std::time::Duration = std::time::Duration::from_secs(300);

/// Repository for job queue database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Durably persists a new job in the `waiting` state.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r"
            INSERT INTO jobs (id, name, payload, status, attempts_made, max_attempts, request_id, created_at)
            VALUES ($1, $2, $3, 'waiting', 0, $4, $5, NOW())
            RETURNING {JOB_COLUMNS}
            ",
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(sqlx::types::Json(payload))
        .bind(options.max_attempts)
        .bind(options.request_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Claims ready jobs for processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers claim disjoint
    /// jobs without blocking each other. Eligible jobs are `waiting`,
    /// `delayed` jobs whose backoff has elapsed, and `active` jobs whose
    /// last attempt is older than [`STALLED_CLAIM_AFTER`] (their worker
    /// crashed without settling them). `attempts_made` is incremented
    /// here: every hand-off to a worker counts as a delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_ready(&self, batch_size: usize) -> Result<Vec<Job>> {
        let now = Utc::now();
        let stalled_before = now
            - chrono::Duration::from_std(STALLED_CLAIM_AFTER)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM jobs
            WHERE status = 'waiting'
               OR (status = 'delayed' AND next_retry_at <= $1)
               OR (status = 'active' AND last_attempt_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(stalled_before)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, Job>(&format!(
            r"
            UPDATE jobs
            SET status = 'active',
                attempts_made = attempts_made + 1,
                last_attempt_at = NOW()
            WHERE id = ANY($1)
            RETURNING {JOB_COLUMNS}
            ",
        ))
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(claimed = jobs.len(), "claimed ready jobs");

        Ok(jobs)
    }

    /// Marks a job as successfully completed and prunes old history.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(&self, job_id: JobId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW(), last_error = NULL
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .execute(&*self.pool)
        .await?;

        self.prune_completed(COMPLETED_RETENTION).await?;

        Ok(())
    }

    /// Returns a job to the delayed pool for a later retry.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'delayed', next_retry_at = $2, last_error = $3
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(next_retry_at)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Dead-letters a job: terminal `failed` state, never redelivered.
    ///
    /// Used both when retries are exhausted and when a worker discards a job
    /// on a non-retryable error.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dead_lettered(&self, job_id: JobId, reason: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'failed', failed_at = NOW(), next_retry_at = NULL, last_error = $2
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(reason)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1",
        ))
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Per-state job counts for queue introspection.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "waiting" => counts.waiting = count,
                "active" => counts.active = count,
                "delayed" => counts.delayed = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {},
            }
        }

        Ok(counts)
    }

    /// Lists dead-lettered jobs, most recent failures first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_dead_lettered(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'failed'
            ORDER BY failed_at DESC
            LIMIT $1
            ",
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Resets a dead-lettered job to `waiting` for another round of attempts.
    ///
    /// Returns `true` if a job was actually reset (it existed and was in the
    /// dead-letter state).
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn retry_dead_lettered(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'waiting',
                attempts_made = 0,
                next_retry_at = NULL,
                failed_at = NULL
            WHERE id = $1 AND status = 'failed'
            ",
        )
        .bind(job_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes completed jobs beyond the retention window.
    async fn prune_completed(&self, retain: i64) -> Result<()> {
        sqlx::query(
            r"
            DELETE FROM jobs
            WHERE status = 'completed'
              AND id NOT IN (
                  SELECT id FROM jobs
                  WHERE status = 'completed'
                  ORDER BY completed_at DESC
                  LIMIT $1
              )
            ",
        )
        .bind(retain)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
