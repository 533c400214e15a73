//! Intake and probe behavior through the full router.
//!
//! Drives the Axum router with `tower::ServiceExt::oneshot` against the
//! in-memory intake store, so middleware, extractors and handlers are all
//! exercised without a database.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use relay_api::{AppState, create_router, intake_store::mock::InMemoryIntakeStore};
use relay_core::{StaticTokenProvider, TestClock};
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_app_with_token(token: &str) -> (Arc<InMemoryIntakeStore>, Router) {
    let store = Arc::new(InMemoryIntakeStore::new());
    let state = AppState::new(
        store.clone(),
        Arc::new(StaticTokenProvider::new(token)),
        Arc::new(TestClock::new()),
        "printiq",
        Duration::from_secs(1800),
    );
    (store, create_router(state))
}

fn test_app() -> (Arc<InMemoryIntakeStore>, Router) {
    test_app_with_token("test-token")
}

fn customer_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/printiq/customer")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

fn deal_request(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/printiq/{path}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.expect("body readable").to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

#[tokio::test]
async fn fresh_event_is_queued() {
    let (store, app) = test_app();
    let body = json!({ "id": "evt-1", "externalEntityId": "42", "name": "Acme Printing" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response_json(response).await, json!({ "queued": true }));

    let jobs = store.enqueued_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "customer.upsert");
    assert_eq!(jobs[0].external_entity_id(), Some("42"));
    assert!(jobs[0].request_id.is_some());

    let fields = jobs[0].fields().cloned().unwrap();
    assert_eq!(fields.get("name"), Some(&json!("Acme Printing")));
    // Envelope keys must not leak into the business fields.
    assert!(fields.get("externalEntityId").is_none());
    assert!(fields.get("id").is_none());
}

#[tokio::test]
async fn duplicate_event_id_is_deduped() {
    let (store, app) = test_app();
    let body = json!({ "id": "evt-1", "externalEntityId": "42", "name": "Acme Printing" });

    let first = app.clone().oneshot(customer_request(body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app.oneshot(customer_request(body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert_eq!(response_json(second).await, json!({ "deduped": true }));

    assert_eq!(store.enqueued_jobs().len(), 1);
}

#[tokio::test]
async fn dedup_keys_on_event_id_not_payload() {
    let (store, app) = test_app();

    let first = json!({ "id": "evt-1", "externalEntityId": "42", "name": "Acme Printing" });
    let second = json!({ "id": "evt-1", "externalEntityId": "42", "name": "Acme Holdings" });

    app.clone().oneshot(customer_request(first)).await.unwrap();
    let response = app.oneshot(customer_request(second)).await.unwrap();

    assert_eq!(response_json(response).await, json!({ "deduped": true }));
    assert_eq!(store.enqueued_jobs().len(), 1);
}

#[tokio::test]
async fn payloads_without_id_dedupe_by_content_hash() {
    let (store, app) = test_app();
    let body = json!({ "externalEntityId": "42", "name": "Acme Printing" });

    app.clone().oneshot(customer_request(body.clone())).await.unwrap();
    let repeat = app.clone().oneshot(customer_request(body)).await.unwrap();
    assert_eq!(response_json(repeat).await, json!({ "deduped": true }));

    // A different payload is a different event.
    let changed = json!({ "externalEntityId": "42", "name": "Acme Holdings" });
    let response = app.oneshot(customer_request(changed)).await.unwrap();
    assert_eq!(response_json(response).await, json!({ "queued": true }));

    assert_eq!(store.enqueued_jobs().len(), 2);
}

#[tokio::test]
async fn numeric_external_entity_id_is_accepted() {
    let (store, app) = test_app();
    let body = json!({ "externalEntityId": 42, "name": "Acme Printing" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(store.enqueued_jobs()[0].external_entity_id(), Some("42"));
}

#[tokio::test]
async fn missing_external_entity_id_is_rejected() {
    let (store, app) = test_app();
    let body = json!({ "name": "Acme Printing" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.enqueued_jobs().is_empty());
    // Rejected events must not burn an idempotency slot.
    assert!(store.reserved_keys().is_empty());
}

#[tokio::test]
async fn missing_name_is_rejected() {
    let (store, app) = test_app();
    let body = json!({ "externalEntityId": "42" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.enqueued_jobs().is_empty());
}

#[tokio::test]
async fn unknown_source_is_not_found() {
    let (store, app) = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/other-system/customer")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "externalEntityId": "42", "name": "Acme" }).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(store.enqueued_jobs().is_empty());
}

#[tokio::test]
async fn enqueue_failure_answers_500() {
    let (store, app) = test_app();
    store.fail_enqueue();
    let body = json!({ "externalEntityId": "42", "name": "Acme Printing" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response_json(response).await, json!({ "error": "enqueue_failed" }));
}

#[tokio::test]
async fn idempotency_store_failure_answers_500() {
    let (store, app) = test_app();
    store.fail_set_if_absent();
    let body = json!({ "externalEntityId": "42", "name": "Acme Printing" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    // A broken store must never be treated as "fresh".
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response_json(response).await, json!({ "error": "enqueue_failed" }));
    assert!(store.enqueued_jobs().is_empty());
}

#[tokio::test]
async fn expired_event_id_is_accepted_again() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(InMemoryIntakeStore::with_clock(clock.clone()));
    let state = AppState::new(
        store.clone(),
        Arc::new(StaticTokenProvider::new("test-token")),
        clock.clone(),
        "printiq",
        Duration::from_secs(1800),
    );
    let app = create_router(state);
    let body = json!({ "id": "evt-1", "externalEntityId": "42", "name": "Acme Printing" });

    let first = app.clone().oneshot(customer_request(body.clone())).await.unwrap();
    assert_eq!(response_json(first).await, json!({ "queued": true }));

    let repeat = app.clone().oneshot(customer_request(body.clone())).await.unwrap();
    assert_eq!(response_json(repeat).await, json!({ "deduped": true }));

    // The TTL window closes; the same event id counts as fresh again.
    clock.advance(Duration::from_secs(1801));

    let after_expiry = app.oneshot(customer_request(body)).await.unwrap();
    assert_eq!(response_json(after_expiry).await, json!({ "queued": true }));
    assert_eq!(store.enqueued_jobs().len(), 2);
}

#[tokio::test]
async fn deal_lifecycle_event_is_queued() {
    let (store, app) = test_app();
    let body = json!({
        "id": "evt-9",
        "event": "quote_accepted",
        "quote_id": "Q-1001",
        "user": "customer@shop.example"
    });

    let response = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response_json(response).await, json!({ "queued": true }));

    let jobs = store.enqueued_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "deal.stage");
    assert_eq!(jobs[0].external_entity_id(), Some("Q-1001"));
    assert_eq!(jobs[0].fields().unwrap().get("event"), Some(&json!("quote_accepted")));
}

#[tokio::test]
async fn deal_event_casing_is_normalized() {
    let (store, app) = test_app();
    let body = json!({ "event": "Job_Converted", "quote_id": "Q-1001" });

    let response = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        store.enqueued_jobs()[0].fields().unwrap().get("event"),
        Some(&json!("job_converted"))
    );
}

#[tokio::test]
async fn legacy_lifecycle_paths_reach_the_same_handler() {
    let (store, app) = test_app();

    for (path, quote) in [("quote", "Q-1"), ("job", "Q-2")] {
        let body = json!({ "event": "quote_cancelled", "quote_id": quote });
        let response = app.clone().oneshot(deal_request(path, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    assert_eq!(store.enqueued_jobs().len(), 2);
}

#[tokio::test]
async fn unsupported_deal_event_is_rejected() {
    let (store, app) = test_app();
    let body = json!({ "event": "order_shipped", "quote_id": "Q-1001" });

    let response = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await, json!({ "error": "unsupported_event" }));
    assert!(store.enqueued_jobs().is_empty());
    assert!(store.reserved_keys().is_empty());
}

#[tokio::test]
async fn deal_event_without_quote_id_is_rejected() {
    let (store, app) = test_app();
    let body = json!({ "event": "quote_accepted" });

    let response = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.enqueued_jobs().is_empty());
}

#[tokio::test]
async fn storefront_quote_created_is_ignored() {
    let (store, app) = test_app();
    let body = json!({
        "event": "quote_created",
        "quote_id": "Q-1001",
        "user": "shopper@web.example"
    });

    let response = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response_json(response).await, json!({ "ignored": true }));
    assert!(store.enqueued_jobs().is_empty());
    // Ignored events must not burn an idempotency slot.
    assert!(store.reserved_keys().is_empty());
}

#[tokio::test]
async fn integration_quote_created_is_relayed() {
    let (store, app) = test_app();
    let body = json!({
        "event": "quote_created",
        "quote_id": "Q-1001",
        "user": "printIQ.Api.Integration"
    });

    let response = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response_json(response).await, json!({ "queued": true }));
    assert_eq!(store.enqueued_jobs().len(), 1);
}

#[tokio::test]
async fn duplicate_deal_event_is_deduped() {
    let (store, app) = test_app();
    let body = json!({ "id": "evt-9", "event": "quote_accepted", "quote_id": "Q-1001" });

    app.clone().oneshot(deal_request("deal-lifecycle", body.clone())).await.unwrap();
    let second = app.oneshot(deal_request("deal-lifecycle", body)).await.unwrap();

    assert_eq!(response_json(second).await, json!({ "deduped": true }));
    assert_eq!(store.enqueued_jobs().len(), 1);
}

#[tokio::test]
async fn responses_carry_request_id_header() {
    let (_, app) = test_app();
    let body = json!({ "externalEntityId": "42", "name": "Acme Printing" });

    let response = app.oneshot(customer_request(body)).await.unwrap();

    assert!(response.headers().contains_key("X-Request-Id"));
}

#[tokio::test]
async fn healthz_is_always_ok() {
    let (store, app) = test_app();
    store.fail_ping();

    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body.get("ok"), Some(&json!(true)));
    assert!(body.get("ts").is_some());
}

#[tokio::test]
async fn readyz_is_ok_when_dependencies_are_up() {
    let (_, app) = test_app();

    let request = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await, json!({ "ready": true }));
}

#[tokio::test]
async fn readyz_fails_when_store_is_down() {
    let (store, app) = test_app();
    store.fail_ping();

    let request = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response_json(response).await, json!({ "ready": false }));
}

#[tokio::test]
async fn readyz_fails_without_crm_credentials() {
    let (_, app) = test_app_with_token("");

    let request = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
