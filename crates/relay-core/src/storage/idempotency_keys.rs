//! Repository for idempotency keys with TTL semantics.
//!
//! Duplicate suppression for webhook intake: the first writer of a key wins
//! and the event proceeds; every later writer within the TTL window is told
//! the key already exists and the event is dropped. Expiry is logical (rows
//! past `expires_at` count as absent) with a physical sweep for hygiene.

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;

use crate::error::Result;

/// Repository for idempotency key database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Atomically records `key` if it is absent or expired.
    ///
    /// Returns `true` if this call claimed the key (the event is fresh) and
    /// `false` if a live entry already holds it (duplicate). The check and
    /// the write are a single statement, so two concurrent deliveries of the
    /// same event can never both observe "fresh".
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails. Callers must treat this as
    /// "unknown", not as either verdict.
    pub async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        // The DO UPDATE arm only fires for expired rows; a live conflicting
        // row matches neither arm and affects zero rows.
        let result = sqlx::query(
            r"
            INSERT INTO idempotency_keys (key, created_at, expires_at)
            VALUES ($1, NOW(), NOW() + make_interval(secs => $2::double precision))
            ON CONFLICT (key) DO UPDATE
            SET created_at = NOW(),
                expires_at = NOW() + make_interval(secs => $2::double precision)
            WHERE idempotency_keys.expires_at <= NOW()
            ",
        )
        .bind(key)
        .bind(ttl_secs)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes keys whose TTL has elapsed.
    ///
    /// Correctness never depends on this running; it only keeps the table
    /// small. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
