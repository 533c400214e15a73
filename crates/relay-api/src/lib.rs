//! CRM relay HTTP API.
//!
//! Exposes the webhook intake endpoint plus health and readiness probes.
//! Handlers talk to persistence through the [`intake_store::IntakeStore`]
//! seam so the HTTP surface can be tested without a database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{sync::Arc, time::Duration};

use relay_core::{AccessTokenProvider, Clock};

pub mod config;
pub mod handlers;
pub mod intake_store;
pub mod server;

pub use config::Config;
pub use intake_store::IntakeStore;
pub use server::{create_router, start_server};

/// Shared state threaded through all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Idempotency and queue persistence.
    pub store: Arc<dyn IntakeStore>,
    /// CRM credential source, checked by the readiness probe.
    pub tokens: Arc<dyn AccessTokenProvider>,
    /// Time source for timestamps in probe responses.
    pub clock: Arc<dyn Clock>,
    /// Webhook source system accepted by the intake route.
    pub webhook_source: String,
    /// How long an event id stays deduplicated.
    pub idempotency_ttl: Duration,
}

impl AppState {
    /// Creates application state with the given dependencies.
    pub fn new(
        store: Arc<dyn IntakeStore>,
        tokens: Arc<dyn AccessTokenProvider>,
        clock: Arc<dyn Clock>,
        webhook_source: impl Into<String>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self { store, tokens, clock, webhook_source: webhook_source.into(), idempotency_ttl }
    }
}
