use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use once_cell::sync::Lazy;
use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("keel_reconcile_total", "Control-loop steps by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BUILDS_SUBMITTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(opts!("keel_builds_submitted_total", "Build jobs created")).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONVERGE_WRITES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("keel_converge_writes_total", "Mutating calls issued by convergence"), &["kind"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

/// `/metrics` and `/health` for the operator process.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
}
