//! Core domain types and storage for the CRM relay.
//!
//! Defines the job model and its state machine, the error taxonomy shared
//! across crates, PostgreSQL repositories for the durable job queue and the
//! idempotency key store, and the seams (clock, access token) that the
//! delivery and API crates depend on.

pub mod error;
pub mod models;
pub mod storage;
pub mod time;
pub mod token;

pub use error::{CoreError, Result};
pub use models::{
    CUSTOMER_UPSERT_JOB, DEAL_STAGE_JOB, EnqueueOptions, Job, JobCounts, JobId, JobStatus,
};
pub use time::{Clock, RealClock, TestClock};
pub use token::{AccessTokenProvider, StaticTokenProvider, TokenError};
