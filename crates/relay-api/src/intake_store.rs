//! Persistence seam for the intake handler.
//!
//! The HTTP handlers only need three storage operations: the atomic
//! idempotency reservation, enqueueing the upsert job and a liveness ping
//! for the readiness probe. [`IntakeStore`] captures exactly those so the
//! HTTP surface is testable against [`mock::InMemoryIntakeStore`].

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use relay_core::{EnqueueOptions, Job, Result, storage::Storage};
use serde_json::Value;

/// Storage operations the intake surface depends on.
pub trait IntakeStore: Send + Sync {
    /// Atomically reserves an idempotency key for the TTL window.
    ///
    /// Returns `true` when the key was fresh (or expired) and is now
    /// reserved, `false` when it is already held.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Enqueues a job for background processing.
    fn enqueue(
        &self,
        name: String,
        payload: Value,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Job>> + Send + '_>>;

    /// Verifies the store is reachable.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// PostgreSQL-backed intake store over the shared [`Storage`] layer.
pub struct PostgresIntakeStore {
    storage: Arc<Storage>,
}

impl PostgresIntakeStore {
    /// Creates an intake store over the given storage layer.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl IntakeStore for PostgresIntakeStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { self.storage.idempotency_keys.set_if_absent(key, ttl).await })
    }

    fn enqueue(
        &self,
        name: String,
        payload: Value,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Job>> + Send + '_>> {
        Box::pin(async move { self.storage.jobs.enqueue(&name, payload, options).await })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

/// In-memory intake store for handler tests.
pub mod mock {
    use std::{
        collections::HashMap,
        sync::Mutex,
        time::{Duration, Instant},
    };

    use chrono::Utc;
    use relay_core::{Clock, CoreError, JobId, JobStatus, RealClock};

    use super::*;

    /// Mock store with injectable failures and inspectable state.
    ///
    /// Key expiry reads the injected [`Clock`], so tests drive TTL
    /// elapse through a `TestClock` instead of waiting.
    pub struct InMemoryIntakeStore {
        clock: Arc<dyn Clock>,
        keys: Mutex<HashMap<String, Instant>>,
        jobs: Mutex<Vec<Job>>,
        fail_set_if_absent: Mutex<bool>,
        fail_enqueue: Mutex<bool>,
        fail_ping: Mutex<bool>,
    }

    impl InMemoryIntakeStore {
        /// Creates an empty mock store on the real clock.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty mock store reading time from `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                clock,
                keys: Mutex::new(HashMap::new()),
                jobs: Mutex::new(Vec::new()),
                fail_set_if_absent: Mutex::new(false),
                fail_enqueue: Mutex::new(false),
                fail_ping: Mutex::new(false),
            }
        }

        /// Makes the next idempotency reservations fail.
        pub fn fail_set_if_absent(&self) {
            *self.fail_set_if_absent.lock().unwrap() = true;
        }

        /// Makes the next enqueues fail.
        pub fn fail_enqueue(&self) {
            *self.fail_enqueue.lock().unwrap() = true;
        }

        /// Makes the readiness ping fail.
        pub fn fail_ping(&self) {
            *self.fail_ping.lock().unwrap() = true;
        }

        /// Jobs enqueued so far.
        pub fn enqueued_jobs(&self) -> Vec<Job> {
            self.jobs.lock().unwrap().clone()
        }

        /// Idempotency keys currently reserved.
        pub fn reserved_keys(&self) -> Vec<String> {
            self.keys.lock().unwrap().keys().cloned().collect()
        }
    }

    impl Default for InMemoryIntakeStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl IntakeStore for InMemoryIntakeStore {
        fn set_if_absent<'a>(
            &'a self,
            key: &'a str,
            ttl: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            Box::pin(async move {
                if *self.fail_set_if_absent.lock().unwrap() {
                    return Err(CoreError::Database("injected idempotency failure".to_string()));
                }

                let mut keys = self.keys.lock().unwrap();
                let now = self.clock.now();
                match keys.get(key) {
                    Some(expires_at) if *expires_at > now => Ok(false),
                    _ => {
                        keys.insert(key.to_string(), now + ttl);
                        Ok(true)
                    },
                }
            })
        }

        fn enqueue(
            &self,
            name: String,
            payload: Value,
            options: EnqueueOptions,
        ) -> Pin<Box<dyn Future<Output = Result<Job>> + Send + '_>> {
            Box::pin(async move {
                if *self.fail_enqueue.lock().unwrap() {
                    return Err(CoreError::Database("injected enqueue failure".to_string()));
                }

                let job = Job {
                    id: JobId::new(),
                    name,
                    payload: sqlx::types::Json(payload),
                    status: JobStatus::Waiting,
                    attempts_made: 0,
                    max_attempts: options.max_attempts,
                    last_error: None,
                    request_id: options.request_id,
                    created_at: Utc::now(),
                    last_attempt_at: None,
                    next_retry_at: None,
                    completed_at: None,
                    failed_at: None,
                };
                self.jobs.lock().unwrap().push(job.clone());
                Ok(job)
            })
        }

        fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if *self.fail_ping.lock().unwrap() {
                    return Err(CoreError::Database("injected ping failure".to_string()));
                }
                Ok(())
            })
        }
    }
}
