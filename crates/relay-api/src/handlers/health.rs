//! Health and readiness probes.
//!
//! `/healthz` answers 200 whenever the process is serving requests.
//! `/readyz` additionally checks the dependencies intake cannot work
//! without: the CRM credential source and the idempotency store.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::AppState;

/// Liveness probe.
///
/// Deliberately checks nothing beyond the HTTP server itself so a
/// dependency outage never gets the process restarted.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "ok": true,
        "ts": DateTime::<Utc>::from(state.clock.now_system()),
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness probe.
///
/// Ready only when a CRM access token can be produced and the idempotency
/// store answers a ping. Either failing means intake would answer 500s,
/// so traffic should stay away.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let token_ok = match state.tokens.access_token().await {
        Ok(_) => true,
        Err(error) => {
            warn!(error = %error, "readiness check failed: no CRM access token");
            false
        },
    };

    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(error) => {
            warn!(error = %error, "readiness check failed: idempotency store unreachable");
            false
        },
    };

    if token_ok && store_ok {
        debug!("readiness check passed");
        (StatusCode::OK, Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "ready": false })))
            .into_response()
    }
}
