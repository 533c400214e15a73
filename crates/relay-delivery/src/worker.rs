//! Upsert worker: turns claimed jobs into CRM writes.
//!
//! Each worker claims batches of jobs from the queue and dispatches on the
//! job name: customer jobs run the upsert pipeline (token, map fields,
//! search by external id, create or update), deal jobs look the deal up by
//! quote id and move its stage. Every invocation makes at most one CRM
//! write; transient failures are handed back to the queue, permanent ones
//! dead-letter the job immediately.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use relay_core::{AccessTokenProvider, CUSTOMER_UPSERT_JOB, Clock, DEAL_STAGE_JOB, models::Job};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    crm::{CrmApi, CrmConfig},
    error::{DeliveryError, Result},
    mapping::{deal_stage_for_event, map_customer_fields},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::JobStore,
};

/// Configuration for the relay engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Number of concurrent upsert workers.
    pub worker_count: usize,

    /// Maximum jobs to claim per worker batch.
    pub batch_size: usize,

    /// How often workers poll for new jobs.
    pub poll_interval: Duration,

    /// CRM client configuration.
    pub crm_config: CrmConfig,

    /// Queue-level retry policy between attempts.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            crm_config: CrmConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active workers.
    pub active_workers: usize,
    /// Total jobs processed since startup.
    pub jobs_processed: u64,
    /// Jobs completed successfully.
    pub succeeded: u64,
    /// Jobs parked for a later retry.
    pub retried: u64,
    /// Jobs dead-lettered.
    pub dead_lettered: u64,
    /// Jobs currently being processed.
    pub in_flight: u64,
}

/// Which write path the upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertPath {
    /// No existing record; a new one was created.
    Create,
    /// Existing record found and updated in place.
    Update,
}

impl UpsertPath {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Successful upsert result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Whether the record was created or updated.
    pub path: UpsertPath,
    /// CRM-assigned record id.
    pub crm_id: String,
}

/// Individual worker that processes upsert jobs.
pub struct UpsertWorker {
    id: usize,
    store: Arc<dyn JobStore>,
    crm: Arc<dyn CrmApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    config: RelayConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl UpsertWorker {
    /// Creates a new upsert worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        store: Arc<dyn JobStore>,
        crm: Arc<dyn CrmApi>,
        tokens: Arc<dyn AccessTokenProvider>,
        config: RelayConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, store, crm, tokens, config, stats, cancellation_token, clock }
    }

    /// Main worker loop. Claims and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails; batch errors are logged
    /// and the loop backs off before polling again.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "upsert worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "upsert worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(processed_count) => {
                    if processed_count == 0 {
                        tokio::select! {
                            () = self.clock.sleep(self.config.poll_interval) => {},
                            () = self.cancellation_token.cancelled() => break,
                        }
                    }
                },
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "upsert worker stopped");
        Ok(())
    }

    /// Claims and processes a batch of ready jobs.
    ///
    /// # Errors
    ///
    /// Returns error if claiming from the queue fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self
            .store
            .claim_ready(self.config.batch_size)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim jobs: {e}")))?;
        let batch_size = jobs.len();

        debug!(worker_id = self.id, batch_size, "processing job batch");

        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(error) = self.process_job(job).await {
                error!(
                    worker_id = self.id,
                    error = %error,
                    "job processing failed"
                );
            }
        }

        Ok(batch_size)
    }

    /// Processes one claimed job through the upsert pipeline and records the
    /// queue transition for its outcome.
    ///
    /// # Errors
    ///
    /// Returns error if a queue state update fails. Upsert failures are
    /// absorbed into retry scheduling or dead-lettering, not propagated.
    async fn process_job(&self, job: Job) -> Result<()> {
        let start_time = self.clock.now();

        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        let result = self.execute_job(&job).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.jobs_processed += 1;
        }

        let duration = start_time.elapsed();
        histogram!("relay_job_duration_seconds").record(duration.as_secs_f64());

        match result {
            Ok(outcome) => {
                self.store
                    .mark_completed(job.id)
                    .await
                    .map_err(|e| DeliveryError::database(format!("failed to mark completed: {e}")))?;

                {
                    let mut stats = self.stats.write().await;
                    stats.succeeded += 1;
                }
                counter!("relay_jobs_total", "outcome" => "completed").increment(1);

                info!(
                    worker_id = self.id,
                    job_id = %job.id,
                    external_entity_id = job.external_entity_id().unwrap_or("unknown"),
                    path = outcome.path.as_str(),
                    crm_id = %outcome.crm_id,
                    attempt = job.attempts_made,
                    duration_ms = duration.as_millis(),
                    "job completed"
                );

                Ok(())
            },
            Err(error) => self.handle_failed_job(&job, error).await,
        }
    }

    /// Dispatches a claimed job to the pipeline its name selects.
    ///
    /// A job name nothing here handles is a payload defect and
    /// dead-letters the job.
    async fn execute_job(&self, job: &Job) -> Result<UpsertOutcome> {
        match job.name.as_str() {
            CUSTOMER_UPSERT_JOB => self.execute_upsert(job).await,
            DEAL_STAGE_JOB => self.execute_stage_update(job).await,
            other => Err(DeliveryError::invalid_payload(format!("unknown job name: {other}"))),
        }
    }

    /// Runs the upsert pipeline: token, mapping, search, create-or-update.
    ///
    /// At most one write reaches the CRM per invocation. This method never
    /// loops on retryable errors; the CRM client's local retry is the only
    /// in-process repetition, everything beyond it belongs to the queue.
    async fn execute_upsert(&self, job: &Job) -> Result<UpsertOutcome> {
        let external_id = job
            .external_entity_id()
            .ok_or_else(|| DeliveryError::invalid_payload("job payload missing external_entity_id"))?
            .to_string();
        let fields = job
            .fields()
            .ok_or_else(|| DeliveryError::invalid_payload("job payload missing fields"))?;

        let record = map_customer_fields(&external_id, fields)?;
        let token = self.tokens.access_token().await?;

        let existing = self.crm.search_by_external_id(&token, &external_id).await?;

        match existing {
            Some(found) => {
                let crm_id = self.crm.update_record(&token, &found.id, &record).await?;
                Ok(UpsertOutcome { path: UpsertPath::Update, crm_id })
            },
            None => {
                let crm_id = self.crm.create_record(&token, &record).await?;
                Ok(UpsertOutcome { path: UpsertPath::Create, crm_id })
            },
        }
    }

    /// Moves a deal to the stage its lifecycle event dictates.
    ///
    /// The deal is located by the source system's quote id. A deal that
    /// does not exist yet is a retryable condition: deals are created by a
    /// separate flow and the event may simply have outrun it.
    async fn execute_stage_update(&self, job: &Job) -> Result<UpsertOutcome> {
        let quote_id = job
            .external_entity_id()
            .ok_or_else(|| DeliveryError::invalid_payload("job payload missing external_entity_id"))?
            .to_string();
        let event = job
            .fields()
            .and_then(|fields| fields.get("event"))
            .and_then(Value::as_str)
            .ok_or_else(|| DeliveryError::invalid_payload("job payload missing event"))?;
        let stage = deal_stage_for_event(event).ok_or_else(|| {
            DeliveryError::invalid_payload(format!("unsupported deal event: {event}"))
        })?;

        let token = self.tokens.access_token().await?;

        let deal = self
            .crm
            .search_deal_by_quote_id(&token, &quote_id)
            .await?
            .ok_or_else(|| DeliveryError::missing_record(format!("no deal for quote {quote_id}")))?;

        let crm_id = self.crm.update_deal_stage(&token, &deal.id, stage).await?;
        Ok(UpsertOutcome { path: UpsertPath::Update, crm_id })
    }

    /// Routes a failed job to retry or the dead-letter state.
    ///
    /// Non-retryable errors discard immediately regardless of remaining
    /// attempts. Retryable errors go through the backoff policy, which
    /// dead-letters once `max_attempts` is reached.
    async fn handle_failed_job(&self, job: &Job, error: DeliveryError) -> Result<()> {
        if !error.is_retryable() {
            self.dead_letter(job, &format!("non-retryable: {error}")).await?;

            error!(
                worker_id = self.id,
                job_id = %job.id,
                attempt = job.attempts_made,
                error = %error,
                "job discarded on non-retryable error"
            );
            return Ok(());
        }

        let attempt_number = u32::try_from(job.attempts_made).unwrap_or(u32::MAX);
        let max_attempts = u32::try_from(job.max_attempts).unwrap_or(u32::MAX);
        let retry_context = RetryContext::new(
            attempt_number,
            error.clone(),
            DateTime::<Utc>::from(self.clock.now_system()),
            RetryPolicy { max_attempts, ..self.config.retry_policy.clone() },
        );

        match retry_context.decide_retry() {
            RetryDecision::Retry { next_attempt_at } => {
                self.store
                    .schedule_retry(job.id, next_attempt_at, error.to_string())
                    .await
                    .map_err(|e| {
                        DeliveryError::database(format!("failed to schedule retry: {e}"))
                    })?;

                {
                    let mut stats = self.stats.write().await;
                    stats.retried += 1;
                }
                counter!("relay_jobs_total", "outcome" => "retried").increment(1);

                warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    next_retry_at = %next_attempt_at,
                    error = %error,
                    "job failed, retry scheduled"
                );
            },
            RetryDecision::GiveUp { reason } => {
                self.dead_letter(job, &format!("{reason}; last error: {error}")).await?;

                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    reason = %reason,
                    error = %error,
                    "job dead-lettered"
                );
            },
        }

        Ok(())
    }

    async fn dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        self.store
            .mark_dead_lettered(job.id, reason.to_string())
            .await
            .map_err(|e| DeliveryError::database(format!("failed to dead-letter job: {e}")))?;

        {
            let mut stats = self.stats.write().await;
            stats.dead_lettered += 1;
        }
        counter!("relay_jobs_total", "outcome" => "dead_lettered").increment(1);

        Ok(())
    }
}
