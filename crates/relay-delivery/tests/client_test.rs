//! CRM client behavior against a scripted HTTP server.
//!
//! Covers the local retry loop, error classification and response parsing
//! using wiremock so no real CRM is involved.

use std::{sync::Arc, time::Duration};

use relay_core::TestClock;
use relay_delivery::{
    DeliveryError,
    crm::{CrmApi, CrmClient, CrmConfig},
};
use serde_json::json;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

fn test_client(base_url: String) -> CrmClient {
    let config = CrmConfig {
        base_url,
        timeout: Duration::from_secs(5),
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(500),
    };
    CrmClient::new(config, Arc::new(TestClock::new())).expect("client builds")
}

#[tokio::test]
async fn search_returns_matching_record() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Accounts/search"))
        .and(matchers::query_param("criteria", "(PrintIQ_Customer_ID:equals:42)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "9001", "Account_Name": "Acme" }]
        })))
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let found = client.search_by_external_id("tok", "42").await.unwrap();

    assert_eq!(found.map(|r| r.id), Some("9001".to_string()));
}

#[tokio::test]
async fn search_with_no_match_returns_none() {
    let server = MockServer::start().await;

    // The CRM answers an empty search with 204 and no body.
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Accounts/search"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let found = client.search_by_external_id("tok", "42").await.unwrap();

    assert!(found.is_none());
}

#[tokio::test]
async fn create_extracts_record_id_from_details() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/Accounts"))
        .and(matchers::header("Authorization", "Zoho-oauthtoken tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "details": { "id": "9002" }, "status": "success" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let record = json!({ "Account_Name": "Acme", "PrintIQ_Customer_ID": "42" });
    let crm_id = client.create_record("tok", &record).await.unwrap();

    assert_eq!(crm_id, "9002");
}

#[tokio::test]
async fn update_targets_record_path() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("PUT"))
        .and(matchers::path("/Accounts/9001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "details": { "id": "9001" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let record = json!({ "Account_Name": "Acme" });
    let crm_id = client.update_record("tok", "9001", &record).await.unwrap();

    assert_eq!(crm_id, "9001");
}

#[tokio::test]
async fn deal_search_queries_by_quote_id() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Deals/search"))
        .and(matchers::query_param("criteria", "(PrintIQ_Quote_ID:equals:Q-1001)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "deal-77", "Stage": "Quote Requested" }]
        })))
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let found = client.search_deal_by_quote_id("tok", "Q-1001").await.unwrap();

    assert_eq!(found.map(|r| r.id), Some("deal-77".to_string()));
}

#[tokio::test]
async fn deal_search_with_no_match_returns_none() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Deals/search"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let found = client.search_deal_by_quote_id("tok", "Q-1001").await.unwrap();

    assert!(found.is_none());
}

#[tokio::test]
async fn deal_stage_update_targets_deal_path() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("PUT"))
        .and(matchers::path("/Deals/deal-77"))
        .and(matchers::body_json(json!({ "data": [{ "Stage": "Accepted" }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "details": { "id": "deal-77" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let crm_id = client.update_deal_stage("tok", "deal-77", "Accepted").await.unwrap();

    assert_eq!(crm_id, "deal-77");
}

#[tokio::test]
async fn server_errors_retried_locally_then_succeed() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/Accounts"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/Accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "details": { "id": "9003" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let record = json!({ "Account_Name": "Acme" });
    let crm_id = client.create_record("tok", &record).await.unwrap();

    assert_eq!(crm_id, "9003");
}

#[tokio::test]
async fn persistent_server_errors_exhaust_local_retries() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/Accounts"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(3)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let record = json!({ "Account_Name": "Acme" });
    let error = client.create_record("tok", &record).await.unwrap_err();

    assert!(matches!(error, DeliveryError::Server { status_code: 503, .. }));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn rate_limits_classified_with_retry_after() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Accounts/search"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_string("Too Many Requests")
                .append_header("Retry-After", "120"),
        )
        .expect(3)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let error = client.search_by_external_id("tok", "42").await.unwrap_err();

    assert!(matches!(error, DeliveryError::RateLimited { .. }));
    assert_eq!(error.retry_after_seconds(), Some(120));
}

#[tokio::test]
async fn client_errors_fail_immediately_without_retry() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/Accounts"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad field"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(server.uri());
    let record = json!({ "Bogus": true });
    let error = client.create_record("tok", &record).await.unwrap_err();

    assert!(matches!(error, DeliveryError::Client { status_code: 400, .. }));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn connection_failures_classified_as_network() {
    // Nothing listens on this port.
    let client = test_client("http://127.0.0.1:1".to_string());
    let error = client.search_by_external_id("tok", "42").await.unwrap_err();

    assert!(matches!(error, DeliveryError::Network { .. }));
    assert!(error.is_retryable());
}
