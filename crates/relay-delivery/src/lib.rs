//! Upsert pipeline relaying queued webhook events into the CRM.
//!
//! This crate implements the background half of the relay: workers claim
//! jobs from PostgreSQL using `FOR UPDATE SKIP LOCKED`, map the stored
//! business fields into the CRM record shape, and create or update the
//! matching record through the CRM REST API.
//!
//! # Architecture
//!
//! 1. **Claim** - workers claim ready jobs (waiting, or delayed past their
//!    backoff)
//! 2. **Upsert** - token, field mapping, search by external id, then one
//!    create or update
//! 3. **Settle** - mark completed, schedule an exponential-backoff retry, or
//!    dead-letter
//!
//! Transient CRM failures are retried twice: a short local loop inside the
//! client for blips, and the queue's coarser delayed-state backoff for
//! anything that survives it. Non-retryable failures dead-letter the job
//! immediately.

pub mod crm;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod retry;
pub mod storage;
pub mod worker;
pub mod worker_pool;

pub use engine::RelayEngine;
pub use error::{DeliveryError, ErrorKind, Result};
pub use worker::{EngineStats, RelayConfig, UpsertOutcome, UpsertPath};

/// Default number of concurrent upsert workers.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default batch size for claiming jobs from the queue.
pub const DEFAULT_BATCH_SIZE: usize = 10;
