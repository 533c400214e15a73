//! Error types for CRM delivery operations.
//!
//! Every failure a worker can hit while relaying a job into the CRM lands
//! here, categorized for the one decision that matters downstream: schedule a
//! retry or dead-letter the job immediately.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions during CRM delivery.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure (DNS, refused connection, reset).
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// CRM responded with a client error (4xx other than 429).
    ///
    /// The request itself is wrong; repeating it cannot succeed.
    #[error("client error: HTTP {status_code}")]
    Client {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// CRM responded with a server error (5xx).
    #[error("server error: HTTP {status_code}")]
    Server {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// CRM rate limit exceeded (HTTP 429).
    #[error("rate limited by CRM API")]
    RateLimited {
        /// Seconds to wait before retrying, when the CRM said so
        retry_after_seconds: Option<u64>,
    },

    /// No usable access token could be obtained.
    #[error("access token unavailable: {message}")]
    Token {
        /// Token failure message
        message: String,
    },

    /// Job payload cannot be mapped into a CRM record.
    #[error("invalid job payload: {message}")]
    InvalidPayload {
        /// What was wrong with the payload
        message: String,
    },

    /// CRM response body did not match the expected shape.
    #[error("unexpected CRM response: {message}")]
    UnexpectedResponse {
        /// What was wrong with the response
        message: String,
    },

    /// The record this job must update does not exist in the CRM yet.
    ///
    /// Deals are created by a separate flow, so a lifecycle event can
    /// arrive before its deal; the job retries until the deal appears or
    /// attempts run out.
    #[error("record not found: {message}")]
    MissingRecord {
        /// Which record was missing
        message: String,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the panicked worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Graceful shutdown did not finish in time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout: std::time::Duration,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::Client { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::Server { status_code, body: body.into() }
    }

    /// Creates a rate limit error, with retry guidance when the CRM gave any.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a token acquisition error.
    pub fn token(message: impl Into<String>) -> Self {
        Self::Token { message: message.into() }
    }

    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload { message: message.into() }
    }

    /// Creates an unexpected response error.
    pub fn unexpected_response(message: impl Into<String>) -> Self {
        Self::UnexpectedResponse { message: message.into() }
    }

    /// Creates a missing record error.
    pub fn missing_record(message: impl Into<String>) -> Self {
        Self::MissingRecord { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Whether this failure is worth another delivery attempt.
    ///
    /// Network failures, timeouts, server errors (5xx), rate limits, token
    /// outages, database hiccups and missing target records are transient.
    /// Client errors (4xx), unmappable payloads and malformed responses are
    /// permanent: the job will fail identically on every retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Server { .. }
            | Self::RateLimited { .. }
            | Self::Token { .. }
            | Self::MissingRecord { .. }
            | Self::Database { .. } => true,

            Self::Client { .. }
            | Self::InvalidPayload { .. }
            | Self::UnexpectedResponse { .. }
            | Self::ShutdownRequested
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }

    /// Suggested retry delay in seconds, when the CRM provided one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Retry classification of this error.
    ///
    /// Fixed by the variant chosen at classification time; downstream code
    /// branches on this instead of re-inspecting messages or status codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            _ if self.is_retryable() => ErrorKind::Retryable,
            _ => ErrorKind::NonRetryable,
        }
    }
}

/// Retry classification of a delivery error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; worth another attempt.
    Retryable,
    /// Transient, but the CRM asked us to back off.
    RateLimited,
    /// Permanent; retries would fail identically.
    NonRetryable,
}

impl From<relay_core::TokenError> for DeliveryError {
    fn from(error: relay_core::TokenError) -> Self {
        Self::Token { message: error.message }
    }
}

impl From<relay_core::CoreError> for DeliveryError {
    fn from(error: relay_core::CoreError) -> Self {
        Self::Database { message: error.to_string() }
    }
}

/// Category of delivery error for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues, including timeouts.
    Network,
    /// HTTP client errors (4xx) and unusable payloads.
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Token acquisition failures.
    Token,
    /// Database operations.
    Database,
    /// Everything else.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::Client { .. }
            | DeliveryError::InvalidPayload { .. }
            | DeliveryError::UnexpectedResponse { .. } => Self::Client,
            DeliveryError::Server { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::Token { .. } => Self::Token,
            DeliveryError::Database { .. } => Self::Database,
            DeliveryError::MissingRecord { .. }
            | DeliveryError::ShutdownRequested
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Token => write!(f, "token"),
            Self::Database => write!(f, "database"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
