//! HTTP client for the CRM REST API.
//!
//! Wraps record search, create and update with a short local retry loop for
//! transient failures (429, 5xx, network) and classifies every terminal
//! failure once, at this boundary. Callers never inspect status codes; they
//! see a [`DeliveryError`] whose retryability is already decided.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use relay_core::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, info_span};

use crate::{
    error::{DeliveryError, Result},
    mapping::{EXTERNAL_ID_FIELD, QUOTE_ID_FIELD},
};

/// Configuration for the CRM API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Base URL of the CRM REST API, e.g. `https://www.zohoapis.com/crm/v2`.
    pub base_url: String,
    /// Timeout applied to each HTTP request.
    pub timeout: Duration,
    /// Attempts per API call before the error propagates to the queue.
    pub max_attempts: u32,
    /// Base delay of the local retry loop.
    pub retry_base_delay: Duration,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.zohoapis.com/crm/v2".to_string(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// A record as the CRM returned it from a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmRecord {
    /// CRM-assigned record identifier.
    pub id: String,
}

/// Seam between the worker and the CRM.
///
/// The production implementation is [`CrmClient`]; tests swap in a
/// scripted mock to drive the worker without a network.
pub trait CrmApi: Send + Sync + 'static {
    /// Finds the record carrying the given external entity id, if any.
    fn search_by_external_id<'a>(
        &'a self,
        token: &'a str,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CrmRecord>>> + Send + 'a>>;

    /// Creates a record and returns the CRM-assigned id.
    fn create_record<'a>(
        &'a self,
        token: &'a str,
        record: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Updates an existing record in place and returns its id.
    fn update_record<'a>(
        &'a self,
        token: &'a str,
        crm_id: &'a str,
        record: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Finds the deal carrying the given source-system quote id, if any.
    fn search_deal_by_quote_id<'a>(
        &'a self,
        token: &'a str,
        quote_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CrmRecord>>> + Send + 'a>>;

    /// Moves a deal to the given stage and returns its id.
    fn update_deal_stage<'a>(
        &'a self,
        token: &'a str,
        crm_id: &'a str,
        stage: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Production CRM client over reqwest.
#[derive(Debug, Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    config: CrmConfig,
    clock: Arc<dyn Clock>,
}

impl CrmClient {
    /// Creates a new CRM client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidPayload` if the HTTP client cannot be
    /// built with the configured timeout.
    pub fn new(config: CrmConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build().map_err(|e| {
            DeliveryError::invalid_payload(format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self { client, config, clock })
    }

    fn accounts_url(&self, suffix: &str) -> String {
        format!("{}/Accounts{}", self.config.base_url.trim_end_matches('/'), suffix)
    }

    fn deals_url(&self, suffix: &str) -> String {
        format!("{}/Deals{}", self.config.base_url.trim_end_matches('/'), suffix)
    }

    /// Sends one request through the local retry loop.
    ///
    /// Transient failures (429, 5xx, network, timeout) are retried up to
    /// `max_attempts` with `retry_base_delay * 2^(attempt-1)` between tries.
    /// Whatever error survives the loop is already classified; the queue
    /// applies its own coarser backoff on top.
    async fn send_with_retry(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<Value> {
        let mut last_error = DeliveryError::network("no attempt made");

        for attempt in 1..=self.config.max_attempts {
            let start = std::time::Instant::now();

            match build().send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let duration_ms = start.elapsed().as_millis();

                    if response.status().is_success() {
                        tracing::debug!(status, attempt, duration_ms, "crm request succeeded");
                        if status == 204 {
                            return Ok(Value::Null);
                        }
                        return response.json::<Value>().await.map_err(|e| {
                            DeliveryError::unexpected_response(format!(
                                "response body is not JSON: {e}"
                            ))
                        });
                    }

                    tracing::warn!(status, attempt, duration_ms, "crm request failed");

                    last_error = match status {
                        429 => DeliveryError::rate_limited(extract_retry_after(
                            response.headers(),
                        )),
                        500..=599 => {
                            let body = response.text().await.unwrap_or_default();
                            DeliveryError::server_error(status, truncate(&body))
                        },
                        _ => {
                            let body = response.text().await.unwrap_or_default();
                            // Other 4xx cannot succeed on retry; bail out of
                            // the loop immediately.
                            return Err(DeliveryError::client_error(status, truncate(&body)));
                        },
                    };
                },
                Err(e) => {
                    let duration_ms = start.elapsed().as_millis();
                    tracing::warn!(attempt, duration_ms, error = %e, "crm request errored");

                    last_error = if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else {
                        DeliveryError::network(e.to_string())
                    };
                },
            }

            if attempt < self.config.max_attempts {
                let exponent = attempt.saturating_sub(1).min(20);
                let delay = self.config.retry_base_delay * 2_u32.saturating_pow(exponent);
                self.clock.sleep(delay).await;
            }
        }

        Err(last_error)
    }
}

impl CrmApi for CrmClient {
    fn search_by_external_id<'a>(
        &'a self,
        token: &'a str,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CrmRecord>>> + Send + 'a>> {
        Box::pin(
            async move {
                let criteria = format!("({EXTERNAL_ID_FIELD}:equals:{external_id})");
                let url = self.accounts_url("/search");

                let body = self
                    .send_with_retry(|| {
                        self.client
                            .get(&url)
                            .header("Authorization", format!("Zoho-oauthtoken {token}"))
                            .query(&[("criteria", criteria.as_str())])
                    })
                    .await?;

                extract_search_record(&body)
            }
            .instrument(info_span!("crm_search", external_id)),
        )
    }

    fn create_record<'a>(
        &'a self,
        token: &'a str,
        record: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(
            async move {
                let url = self.accounts_url("");
                let payload = serde_json::json!({ "data": [record] });

                let body = self
                    .send_with_retry(|| {
                        self.client
                            .post(&url)
                            .header("Authorization", format!("Zoho-oauthtoken {token}"))
                            .json(&payload)
                    })
                    .await?;

                extract_record_id(&body)
                    .ok_or_else(|| DeliveryError::unexpected_response("create result without id"))
            }
            .instrument(info_span!("crm_create")),
        )
    }

    fn update_record<'a>(
        &'a self,
        token: &'a str,
        crm_id: &'a str,
        record: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(
            async move {
                let url = self.accounts_url(&format!("/{crm_id}"));
                let payload = serde_json::json!({ "data": [record] });

                self.send_with_retry(|| {
                    self.client
                        .put(&url)
                        .header("Authorization", format!("Zoho-oauthtoken {token}"))
                        .json(&payload)
                })
                .await?;

                Ok(crm_id.to_string())
            }
            .instrument(info_span!("crm_update", crm_id)),
        )
    }

    fn search_deal_by_quote_id<'a>(
        &'a self,
        token: &'a str,
        quote_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CrmRecord>>> + Send + 'a>> {
        Box::pin(
            async move {
                let criteria = format!("({QUOTE_ID_FIELD}:equals:{quote_id})");
                let url = self.deals_url("/search");

                let body = self
                    .send_with_retry(|| {
                        self.client
                            .get(&url)
                            .header("Authorization", format!("Zoho-oauthtoken {token}"))
                            .query(&[("criteria", criteria.as_str())])
                    })
                    .await?;

                extract_search_record(&body)
            }
            .instrument(info_span!("crm_deal_search", quote_id)),
        )
    }

    fn update_deal_stage<'a>(
        &'a self,
        token: &'a str,
        crm_id: &'a str,
        stage: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(
            async move {
                let url = self.deals_url(&format!("/{crm_id}"));
                let payload = serde_json::json!({ "data": [{ "Stage": stage }] });

                self.send_with_retry(|| {
                    self.client
                        .put(&url)
                        .header("Authorization", format!("Zoho-oauthtoken {token}"))
                        .json(&payload)
                })
                .await?;

                Ok(crm_id.to_string())
            }
            .instrument(info_span!("crm_deal_update", crm_id, stage)),
        )
    }
}

/// Reads the first record out of a search response body.
///
/// An empty search comes back as 204 (mapped to Null upstream) or as a
/// body without a data array; both mean "no match".
fn extract_search_record(body: &Value) -> Result<Option<CrmRecord>> {
    body.get("data")
        .and_then(Value::as_array)
        .and_then(|records| records.first())
        .map(|record| {
            let id = record.get("id").and_then(Value::as_str).ok_or_else(|| {
                DeliveryError::unexpected_response("search result without id")
            })?;
            Ok(CrmRecord { id: id.to_string() })
        })
        .transpose()
}

/// Pulls the record id out of a create/update response body.
///
/// The CRM nests it as `data[0].details.id`; older API versions return
/// `data[0].id` directly.
fn extract_record_id(body: &Value) -> Option<String> {
    let record = body.get("data").and_then(Value::as_array).and_then(|records| records.first())?;

    record
        .get("details")
        .and_then(|details| details.get("id"))
        .or_else(|| record.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

fn truncate(body: &str) -> String {
    const MAX_STORED_BODY: usize = 1024;

    if body.len() > MAX_STORED_BODY {
        let mut end = MAX_STORED_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_id_extracted_from_details() {
        let body = json!({ "data": [{ "details": { "id": "crm-1" }, "status": "success" }] });
        assert_eq!(extract_record_id(&body), Some("crm-1".to_string()));
    }

    #[test]
    fn record_id_extracted_from_flat_shape() {
        let body = json!({ "data": [{ "id": "crm-2" }] });
        assert_eq!(extract_record_id(&body), Some("crm-2".to_string()));
    }

    #[test]
    fn missing_record_id_yields_none() {
        assert_eq!(extract_record_id(&json!({ "data": [] })), None);
        assert_eq!(extract_record_id(&json!({})), None);
    }

    #[test]
    fn long_bodies_truncated_for_storage() {
        let body = "x".repeat(4096);
        let stored = truncate(&body);
        assert!(stored.len() < 1100);
        assert!(stored.ends_with("(truncated)"));
    }
}
