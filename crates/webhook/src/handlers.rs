use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::matching::{event_matches, PushEvent};
use crate::signature::{verify, SIGNATURE_HEADER};
use crate::telemetry::DELIVERIES_TOTAL;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushResponse {
    /// Applications whose repository and selector matched the push.
    pub matched: usize,
    /// Matches whose trigger annotation was written.
    pub triggered: usize,
}

#[derive(Serialize)]
pub struct HealthResponse { pub status: &'static str }

pub async fn health() -> Json<HealthResponse> { Json(HealthResponse { status: "ok" }) }

fn reject(result: &'static str, err: ApiError) -> ApiError {
    DELIVERIES_TOTAL.with_label_values(&[result]).inc();
    warn!(code = err.code, message = %err.message, "webhook.rejected");
    err
}

/// Push receiver. Answers 200 whenever the payload was authentic and parsed,
/// including when nothing matched, so senders do not retry.
pub async fn push(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Json<PushResponse>> {
    if let Some(secret) = state.secret.as_deref() {
        let Some(sig) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            return Err(reject("unauthorized", ApiError::unauthorized("missing signature")));
        };
        if !verify(secret, &body, sig) {
            return Err(reject("unauthorized", ApiError::unauthorized("invalid signature")));
        }
    }
    let event: PushEvent =
        serde_json::from_slice(&body).map_err(|e| reject("bad_request", ApiError::bad_request(format!("invalid push payload: {e}"))))?;

    let apps = state
        .directory
        .list()
        .await
        .map_err(|e| reject("error", ApiError::internal(format!("listing applications failed: {e}"))))?;

    let now = Utc::now();
    let mut matched = 0;
    let mut triggered = 0;
    for app in apps.iter().filter(|a| event_matches(&a.spec, &event)) {
        matched += 1;
        match state.directory.trigger(app, now).await {
            Ok(()) => {
                triggered += 1;
                info!(app = %app.name_any(), namespace = ?app.namespace(), git_ref = %event.git_ref, "webhook.triggered");
            }
            Err(e) => warn!(app = %app.name_any(), namespace = ?app.namespace(), error = %e, "webhook.trigger_failed"),
        }
    }
    let result = match (matched, triggered) {
        (0, _) => "no_match",
        (_, 0) => "trigger_failed",
        _ => "triggered",
    };
    DELIVERIES_TOTAL.with_label_values(&[result]).inc();
    info!(git_ref = %event.git_ref, matched, triggered, "webhook.delivery");
    Ok(Json(PushResponse { matched, triggered }))
}
