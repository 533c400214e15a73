//! Access credential seam for the CRM API.
//!
//! OAuth acquisition and refresh live outside this service; callers consume
//! a single `access_token()` call that yields a token assumed fresh enough
//! to use. The trait-object seam keeps the worker and readiness checks
//! testable without real credentials.

use std::{future::Future, pin::Pin};

use thiserror::Error;

/// Failure to obtain a usable access token.
///
/// Always treated as retryable by the worker: a token outage is transient
/// infrastructure, not a property of the job.
#[derive(Debug, Clone, Error)]
#[error("access token unavailable: {message}")]
pub struct TokenError {
    /// Description of the failure.
    pub message: String,
}

impl TokenError {
    /// Creates a token error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Source of valid CRM access tokens.
pub trait AccessTokenProvider: Send + Sync + 'static {
    /// Returns a token valid for at least the next request.
    fn access_token(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<String, TokenError>> + Send + '_>>;
}

/// Token provider backed by a fixed credential.
///
/// Used when the deployment injects a long-lived token (or an external
/// refresher keeps an environment value current).
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider that always yields `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn access_token(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<String, TokenError>> + Send + '_>> {
        let token = self.token.clone();
        Box::pin(async move {
            if token.is_empty() {
                return Err(TokenError::new("no access token configured"));
            }
            Ok(token)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_yields_configured_token() {
        let provider = StaticTokenProvider::new("tok-1");
        assert_eq!(provider.access_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn empty_token_is_an_error() {
        let provider = StaticTokenProvider::new("");
        assert!(provider.access_token().await.is_err());
    }
}
