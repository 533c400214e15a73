//! Webhook intake handlers.
//!
//! Accepts customer and deal lifecycle events from the source system,
//! deduplicates them through the idempotency store and enqueues a job for
//! the background workers. Handlers never talk to the CRM themselves; a
//! 202 only promises the event is durably queued.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::counter;
use relay_core::{CUSTOMER_UPSERT_JOB, DEAL_STAGE_JOB, EnqueueOptions};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{AppState, server::RequestId};

/// Event type assumed when a customer payload carries none.
const DEFAULT_EVENT_TYPE: &str = "customer.updated";

/// Lifecycle events that move a deal stage. Every entry must have a stage
/// mapping on the worker side; anything else is rejected with 400.
const SUPPORTED_DEAL_EVENTS: [&str; 6] = [
    "quote_created",
    "quote_accepted",
    "job_converted",
    "invoice_created",
    "quote_cancelled",
    "job_cancelled",
];

/// Source-system account whose quote_created events are authoritative.
/// Quotes raised by storefront users get a deal only once accepted.
const INTEGRATION_USERNAME: &str = "printIQ.Api.Integration";

/// Ingests a customer event for relay into the CRM.
///
/// # Responses
///
/// - 202 `{"queued":true}` - fresh event, job enqueued
/// - 202 `{"deduped":true}` - duplicate inside the TTL window, dropped
/// - 400 - required fields missing
/// - 404 - unknown source system
/// - 500 `{"error":"enqueue_failed"}` - store or queue failure
#[instrument(
    name = "receive_customer",
    skip(state, request_id, payload),
    fields(source = %source)
)]
pub async fn receive_customer(
    Path(source): Path<String>,
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(payload): Json<Value>,
) -> Response {
    if source != state.webhook_source {
        warn!(configured = %state.webhook_source, "rejecting webhook from unknown source");
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown_source" })))
            .into_response();
    }

    let Some(external_entity_id) = extract_id_value(payload.get("externalEntityId")) else {
        warn!("rejecting webhook without externalEntityId");
        counter!("relay_intake_total", "outcome" => "rejected").increment(1);
        return missing_fields_response();
    };

    let has_name = payload.get("name").and_then(Value::as_str).is_some_and(|n| !n.trim().is_empty());
    if !has_name {
        warn!(external_entity_id = %external_entity_id, "rejecting webhook without name");
        counter!("relay_intake_total", "outcome" => "rejected").increment(1);
        return missing_fields_response();
    }

    let event_type = payload
        .get("event")
        .and_then(Value::as_str)
        .filter(|e| !e.trim().is_empty())
        .unwrap_or(DEFAULT_EVENT_TYPE);
    let event_id = extract_id_value(payload.get("id")).unwrap_or_else(|| hash_payload(&payload));
    let idempotency_key = format!("{source}:{event_type}:{event_id}");

    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let job_payload = json!({
        "request_id": request_id,
        "external_entity_id": external_entity_id,
        "fields": business_fields(&payload),
    });

    dedupe_and_enqueue(
        &state,
        &idempotency_key,
        &event_id,
        CUSTOMER_UPSERT_JOB,
        job_payload,
        request_id,
    )
    .await
}

/// Ingests a deal lifecycle event for relay into the CRM.
///
/// The source system posts these to several paths; they all land here.
///
/// # Responses
///
/// - 202 `{"queued":true}` - fresh event, stage-update job enqueued
/// - 202 `{"deduped":true}` - duplicate inside the TTL window, dropped
/// - 202 `{"ignored":true}` - storefront quote_created, accepted but not
///   relayed
/// - 400 `{"error":"unsupported_event"}` - event outside the lifecycle set
/// - 400 - missing quote id
/// - 404 - unknown source system
/// - 500 `{"error":"enqueue_failed"}` - store or queue failure
#[instrument(
    name = "receive_deal_lifecycle",
    skip(state, request_id, payload),
    fields(source = %source)
)]
pub async fn receive_deal_lifecycle(
    Path(source): Path<String>,
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(payload): Json<Value>,
) -> Response {
    if source != state.webhook_source {
        warn!(configured = %state.webhook_source, "rejecting webhook from unknown source");
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown_source" })))
            .into_response();
    }

    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_DEAL_EVENTS.contains(&event.as_str()) {
        warn!(event = %event, "rejecting unsupported deal event");
        counter!("relay_intake_total", "outcome" => "rejected").increment(1);
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "unsupported_event" })))
            .into_response();
    }

    // Quotes created by storefront users only become deals once accepted;
    // relaying their quote_created would move deals that do not exist.
    let sender = payload.get("user").and_then(Value::as_str).unwrap_or_default();
    if event == "quote_created" && sender != INTEGRATION_USERNAME {
        info!(sender = %sender, "ignoring storefront quote_created event");
        counter!("relay_intake_total", "outcome" => "ignored").increment(1);
        return (StatusCode::ACCEPTED, Json(json!({ "ignored": true }))).into_response();
    }

    let Some(quote_id) = extract_id_value(payload.get("quote_id")) else {
        warn!(event = %event, "rejecting deal event without quote_id");
        counter!("relay_intake_total", "outcome" => "rejected").increment(1);
        return missing_fields_response();
    };

    let event_id = extract_id_value(payload.get("id")).unwrap_or_else(|| hash_payload(&payload));
    let idempotency_key = format!("{source}:{event}:{event_id}");

    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let job_payload = json!({
        "request_id": request_id,
        "external_entity_id": quote_id,
        "fields": { "event": event },
    });

    dedupe_and_enqueue(
        &state,
        &idempotency_key,
        &event_id,
        DEAL_STAGE_JOB,
        job_payload,
        request_id,
    )
    .await
}

/// Reserves the idempotency key and enqueues the job. Shared tail of both
/// intake handlers.
async fn dedupe_and_enqueue(
    state: &AppState,
    idempotency_key: &str,
    event_id: &str,
    job_name: &'static str,
    job_payload: Value,
    request_id: String,
) -> Response {
    match state.store.set_if_absent(idempotency_key, state.idempotency_ttl).await {
        Ok(true) => {},
        Ok(false) => {
            info!(event_id = %event_id, "duplicate event dropped");
            counter!("relay_intake_total", "outcome" => "deduped").increment(1);
            return (StatusCode::ACCEPTED, Json(json!({ "deduped": true }))).into_response();
        },
        Err(e) => {
            error!(error = %e, "idempotency reservation failed");
            counter!("relay_intake_total", "outcome" => "failed").increment(1);
            return enqueue_failed_response();
        },
    }

    let options = EnqueueOptions { request_id: Some(request_id), ..EnqueueOptions::default() };

    match state.store.enqueue(job_name.to_string(), job_payload, options).await {
        Ok(job) => {
            info!(job_id = %job.id, event_id = %event_id, name = job_name, "event queued");
            counter!("relay_intake_total", "outcome" => "queued").increment(1);
            (StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response()
        },
        Err(e) => {
            error!(error = %e, event_id = %event_id, "enqueue failed");
            counter!("relay_intake_total", "outcome" => "failed").increment(1);
            enqueue_failed_response()
        },
    }
}

/// Reads an id that may arrive as a JSON string or number.
fn extract_id_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Derives a deterministic event id for payloads without one.
///
/// Object keys serialize in sorted order, so equal payloads hash equal
/// regardless of the order the source sent their fields in.
fn hash_payload(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Strips envelope keys, leaving the business fields the mapper consumes.
fn business_fields(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let fields: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "id" | "event" | "externalEntityId"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(fields)
        },
        other => other.clone(),
    }
}

fn missing_fields_response() -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing_required_fields" }))).into_response()
}

fn enqueue_failed_response() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "enqueue_failed" })))
        .into_response()
}
