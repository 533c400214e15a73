//! Storage abstraction layer for the relay engine.
//!
//! Trait-based seam over queue operations so worker and engine logic can be
//! tested without a database. Production goes through the concrete
//! `relay_core::storage::Storage`; tests use the in-memory mock.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use relay_core::{
    error::Result,
    models::{EnqueueOptions, Job, JobCounts, JobId},
};

/// Queue operations required by the relay engine.
pub trait JobStore: Send + Sync + 'static {
    /// Enqueues a new job in the waiting state.
    fn enqueue(
        &self,
        name: String,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Job>> + Send + '_>>;

    /// Claims ready jobs for processing.
    ///
    /// Production uses `FOR UPDATE SKIP LOCKED` so concurrent workers claim
    /// disjoint jobs. Claimed jobs arrive with `attempts_made` already
    /// incremented.
    fn claim_ready(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send + '_>>;

    /// Marks a job as successfully completed.
    fn mark_completed(&self, job_id: JobId)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Parks a job as delayed until `next_retry_at`.
    fn schedule_retry(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
        last_error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Dead-letters a job permanently.
    fn mark_dead_lettered(
        &self,
        job_id: JobId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Per-state job counts.
    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<JobCounts>> + Send + '_>>;

    /// Lists dead-lettered jobs, most recent first.
    fn find_dead_lettered(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send + '_>>;

    /// Resets a dead-lettered job to waiting. Returns whether a job was
    /// actually reset.
    fn retry_dead_lettered(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;
}

/// Production job store backed by PostgreSQL.
pub struct PostgresJobStore {
    storage: Arc<relay_core::storage::Storage>,
}

impl PostgresJobStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<relay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(
        &self,
        name: String,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Job>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.enqueue(&name, payload, options).await })
    }

    fn claim_ready(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.claim_ready(batch_size).await })
    }

    fn mark_completed(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_completed(job_id).await })
    }

    fn schedule_retry(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
        last_error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.schedule_retry(job_id, next_retry_at, &last_error).await })
    }

    fn mark_dead_lettered(
        &self,
        job_id: JobId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_dead_lettered(job_id, &reason).await })
    }

    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<JobCounts>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.counts().await })
    }

    fn find_dead_lettered(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find_dead_lettered(limit).await })
    }

    fn retry_dead_lettered(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.retry_dead_lettered(job_id).await })
    }
}

pub mod mock {
    //! In-memory job store for testing queue and worker logic.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use relay_core::{
        error::{CoreError, Result},
        models::{EnqueueOptions, Job, JobCounts, JobId, JobStatus},
    };
    use tokio::sync::RwLock;

    use super::JobStore;

    /// Mock job store with deterministic in-memory state.
    ///
    /// Claim order is FIFO by insertion. Supports injecting a one-shot
    /// error into the next claim to exercise engine error paths.
    pub struct InMemoryJobStore {
        jobs: Arc<RwLock<HashMap<JobId, Job>>>,
        order: Arc<RwLock<Vec<JobId>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        now: Arc<RwLock<DateTime<Utc>>>,
    }

    impl InMemoryJobStore {
        /// Creates a new empty store.
        pub fn new() -> Self {
            Self {
                jobs: Arc::new(RwLock::new(HashMap::new())),
                order: Arc::new(RwLock::new(Vec::new())),
                claim_error: Arc::new(RwLock::new(None)),
                now: Arc::new(RwLock::new(Utc::now())),
            }
        }

        /// Moves the store's notion of "now" forward so delayed jobs become
        /// claimable without wall-clock waiting.
        pub async fn advance_time(&self, duration: chrono::Duration) {
            let mut now = self.now.write().await;
            *now += duration;
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: String) {
            *self.claim_error.write().await = Some(error);
        }

        /// Returns the stored job, if present.
        pub async fn find_job(&self, job_id: JobId) -> Option<Job> {
            self.jobs.read().await.get(&job_id).cloned()
        }

        /// Verifies a job reached the expected status.
        pub async fn verify_job_status(&self, job_id: JobId, expected: JobStatus) -> bool {
            self.jobs.read().await.get(&job_id).is_some_and(|j| j.status == expected)
        }
    }

    impl Default for InMemoryJobStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl JobStore for InMemoryJobStore {
        fn enqueue(
            &self,
            name: String,
            payload: serde_json::Value,
            options: EnqueueOptions,
        ) -> Pin<Box<dyn Future<Output = Result<Job>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let order = self.order.clone();
            let now = self.now.clone();

            Box::pin(async move {
                let job = Job {
                    id: JobId::new(),
                    name,
                    payload: sqlx::types::Json(payload),
                    status: JobStatus::Waiting,
                    attempts_made: 0,
                    max_attempts: options.max_attempts,
                    last_error: None,
                    request_id: options.request_id,
                    created_at: *now.read().await,
                    last_attempt_at: None,
                    next_retry_at: None,
                    completed_at: None,
                    failed_at: None,
                };

                jobs.write().await.insert(job.id, job.clone());
                order.write().await.push(job.id);

                Ok(job)
            })
        }

        fn claim_ready(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let order = self.order.clone();
            let claim_error = self.claim_error.clone();
            let now = self.now.clone();

            Box::pin(async move {
                let error = claim_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                let now = *now.read().await;
                let order = order.read().await.clone();
                let mut jobs_map = jobs.write().await;
                let mut claimed = Vec::new();

                let stalled = chrono::Duration::from_std(
                    relay_core::storage::jobs::STALLED_CLAIM_AFTER,
                )
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

                for job_id in order {
                    if claimed.len() >= batch_size {
                        break;
                    }
                    if let Some(job) = jobs_map.get_mut(&job_id) {
                        let ready = match job.status {
                            JobStatus::Waiting => true,
                            JobStatus::Delayed => {
                                job.next_retry_at.is_some_and(|at| at <= now)
                            },
                            JobStatus::Active => {
                                job.last_attempt_at.is_some_and(|at| at + stalled <= now)
                            },
                            _ => false,
                        };
                        if ready {
                            job.status = JobStatus::Active;
                            job.attempts_made += 1;
                            job.last_attempt_at = Some(now);
                            claimed.push(job.clone());
                        }
                    }
                }

                Ok(claimed)
            })
        }

        fn mark_completed(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let now = self.now.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(*now.read().await);
                    job.last_error = None;
                }
                Ok(())
            })
        }

        fn schedule_retry(
            &self,
            job_id: JobId,
            next_retry_at: DateTime<Utc>,
            last_error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    job.status = JobStatus::Delayed;
                    job.next_retry_at = Some(next_retry_at);
                    job.last_error = Some(last_error);
                }
                Ok(())
            })
        }

        fn mark_dead_lettered(
            &self,
            job_id: JobId,
            reason: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let now = self.now.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    job.status = JobStatus::Failed;
                    job.failed_at = Some(*now.read().await);
                    job.next_retry_at = None;
                    job.last_error = Some(reason);
                }
                Ok(())
            })
        }

        fn counts(&self) -> Pin<Box<dyn Future<Output = Result<JobCounts>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut counts = JobCounts::default();
                for job in jobs.read().await.values() {
                    match job.status {
                        JobStatus::Waiting => counts.waiting += 1,
                        JobStatus::Active => counts.active += 1,
                        JobStatus::Delayed => counts.delayed += 1,
                        JobStatus::Completed => counts.completed += 1,
                        JobStatus::Failed => counts.failed += 1,
                    }
                }
                Ok(counts)
            })
        }

        fn find_dead_lettered(
            &self,
            limit: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut dead: Vec<Job> = jobs
                    .read()
                    .await
                    .values()
                    .filter(|j| j.status == JobStatus::Failed)
                    .cloned()
                    .collect();
                dead.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
                dead.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                Ok(dead)
            })
        }

        fn retry_dead_lettered(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut jobs_map = jobs.write().await;
                match jobs_map.get_mut(&job_id) {
                    Some(job) if job.status == JobStatus::Failed => {
                        job.status = JobStatus::Waiting;
                        job.attempts_made = 0;
                        job.next_retry_at = None;
                        job.failed_at = None;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }
    }
}
