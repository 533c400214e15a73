//! Database access layer implementing the repository pattern for the relay.
//!
//! All database operations go through these repositories; direct SQL outside
//! this module is forbidden so the schema can evolve behind one seam.

use std::sync::Arc;

use sqlx::PgPool;

pub mod idempotency_keys;
pub mod jobs;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for durable queue jobs.
    pub jobs: Arc<jobs::Repository>,

    /// Repository for idempotency keys with TTL semantics.
    pub idempotency_keys: Arc<idempotency_keys::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            jobs: Arc::new(jobs::Repository::new(pool.clone())),
            idempotency_keys: Arc::new(idempotency_keys::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// Used by the readiness endpoint; a failing check means intake must not
    /// accept events (an unreachable store may neither be treated as "new"
    /// nor as "duplicate").
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.jobs.pool()).await?;

        Ok(())
    }
}
