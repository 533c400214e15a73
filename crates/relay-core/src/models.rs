//! Job model and strongly-typed identifiers for the durable queue.
//!
//! A [`Job`] is one unit of queued work: relay a single upsert into the CRM.
//! Jobs move through a small state machine driven by the queue and the
//! worker's outcome:
//!
//! ```text
//! waiting -> active -> { completed | delayed -> waiting (loop) | failed }
//! ```
//!
//! `active -> failed` happens directly when a worker discards the job on a
//! non-retryable error. `completed` and `failed` are terminal; `failed` is
//! the dead-letter state operators inspect and retry manually.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Job name for customer upserts into the CRM.
pub const CUSTOMER_UPSERT_JOB: &str = "customer.upsert";

/// Job name for deal stage transitions driven by lifecycle events.
pub const DEAL_STAGE_JOB: &str = "deal.stage";

/// Strongly-typed job identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Assigned by the queue
/// at enqueue time and stable for the job's whole lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Processing state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued and ready to be claimed by a worker.
    Waiting,

    /// Claimed by a worker; exactly one worker holds an active job.
    Active,

    /// Failed with a retryable error; waiting out its backoff delay before
    /// returning to the waiting pool.
    Delayed,

    /// Upsert succeeded. Terminal; completed history is pruned.
    Completed,

    /// Dead-lettered: retries exhausted or explicitly discarded. Terminal;
    /// retained indefinitely for operator inspection.
    Failed,
}

impl JobStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Delayed => write!(f, "delayed"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "delayed" => Ok(Self::Delayed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid job status: {s}").into()),
        }
    }
}

/// One unit of queued work for the upsert pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Queue-assigned unique identifier.
    pub id: JobId,

    /// Operation type, e.g. `customer.upsert`.
    pub name: String,

    /// Job payload: request correlation id, external entity id and the raw
    /// business fields the worker maps into the CRM record shape.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Current processing state.
    pub status: JobStatus,

    /// Number of times the queue has handed this job to a worker.
    ///
    /// Incremented at claim time, so a job that dead-letters after
    /// exhausting `max_attempts` reports the full attempt count.
    pub attempts_made: i32,

    /// Attempt ceiling before the queue dead-letters the job.
    pub max_attempts: i32,

    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,

    /// Correlation id propagated from the webhook request.
    pub request_id: Option<String>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the most recent claim.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Earliest time a delayed job may be reclaimed.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the job completed (terminal state).
    pub completed_at: Option<DateTime<Utc>>,

    /// When the job was dead-lettered (terminal state).
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// External entity id carried in the payload, if present.
    pub fn external_entity_id(&self) -> Option<&str> {
        self.payload.0.get("external_entity_id").and_then(|v| v.as_str())
    }

    /// Business fields carried in the payload.
    pub fn fields(&self) -> Option<&serde_json::Value> {
        self.payload.0.get("fields")
    }
}

/// Options applied when enqueueing a job.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Attempt ceiling before dead-lettering. Defaults to 5.
    pub max_attempts: i32,

    /// Request correlation id to carry alongside the payload.
    pub request_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { max_attempts: 5, request_id: None }
    }
}

/// Per-state job counts for queue introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Jobs ready to be claimed.
    pub waiting: i64,
    /// Jobs currently held by workers.
    pub active: i64,
    /// Jobs waiting out a retry delay.
    pub delayed: i64,
    /// Successfully finished jobs still retained.
    pub completed: i64,
    /// Dead-lettered jobs.
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_formats_for_database_storage() {
        assert_eq!(JobStatus::Waiting.to_string(), "waiting");
        assert_eq!(JobStatus::Active.to_string(), "active");
        assert_eq!(JobStatus::Delayed.to_string(), "delayed");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn terminal_states_identified() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn payload_accessors_read_expected_keys() {
        let payload = serde_json::json!({
            "request_id": "req-1",
            "external_entity_id": "42",
            "fields": { "name": "Acme" }
        });
        let job = Job {
            id: JobId::new(),
            name: "customer.upsert".to_string(),
            payload: sqlx::types::Json(payload),
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: 5,
            last_error: None,
            request_id: Some("req-1".to_string()),
            created_at: Utc::now(),
            last_attempt_at: None,
            next_retry_at: None,
            completed_at: None,
            failed_at: None,
        };

        assert_eq!(job.external_entity_id(), Some("42"));
        assert_eq!(job.fields().and_then(|f| f.get("name")).and_then(|v| v.as_str()), Some("Acme"));
    }
}
