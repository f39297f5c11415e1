use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use keel_operator::crd::{SourceSelector, TRIGGER_ANNOTATION};
use keel_operator::test_support::{keel_app, spec};
use keel_operator::KeelApp;
use keel_webhook::{
    build_router, handlers::PushResponse, signature::sign, test_support::MemoryDirectory, AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

const SECRET: &str = "hook-secret";

fn app(name: &str, repo: &str, source: SourceSelector) -> KeelApp {
    let mut s = spec(repo, "x/y");
    s.source = source;
    keel_app(name, "apps", s)
}

fn fleet() -> Arc<MemoryDirectory> {
    Arc::new(MemoryDirectory::new(vec![
        app("web", "https://github.com/x/y", SourceSelector::branch("main")),
        app("web-default", "git@github.com:X/y.git", SourceSelector::branch("")),
        app("web-dev", "https://github.com/x/y", SourceSelector::branch("dev")),
        app("other", "https://github.com/x/z", SourceSelector::branch("main")),
        app("release", "https://github.com/x/y", SourceSelector::tag("v1")),
    ]))
}

fn router(dir: &Arc<MemoryDirectory>, secret: Option<&str>) -> Router {
    build_router(AppState::new(dir.clone(), secret))
}

fn push_body(git_ref: &str) -> String {
    json!({"ref": git_ref, "repository": {"clone_url": "https://github.com/x/y.git", "html_url": "https://github.com/x/y"}}).to_string()
}

fn request(body: &str, signature: Option<&str>) -> Request<Body> {
    let mut b = Request::builder().method("POST").uri("/webhook").header("content-type", "application/json");
    if let Some(sig) = signature { b = b.header("X-Hub-Signature-256", sig); }
    b.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    serde_json::from_slice(&to_bytes(res.into_body(), usize::MAX).await.unwrap()).unwrap()
}

#[tokio::test]
async fn signed_push_triggers_matching_apps() {
    let dir = fleet();
    let body = push_body("refs/heads/main");
    let sig = sign(SECRET.as_bytes(), body.as_bytes());
    let res = router(&dir, Some(SECRET)).oneshot(request(&body, Some(&sig))).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let out: PushResponse = serde_json::from_value(json_body(res).await).unwrap();
    assert_eq!(out, PushResponse { matched: 2, triggered: 2 });
    assert!(dir.annotation("apps", "web").is_some());
    assert!(dir.annotation("apps", "web-default").is_some());
    assert!(dir.annotation("apps", "web-dev").is_none());
    assert!(dir.annotation("apps", "other").is_none());
    assert!(dir.annotation("apps", "release").is_none());
}

#[tokio::test]
async fn tag_push_matches_tag_selectors_only() {
    let dir = fleet();
    let res = router(&dir, None).oneshot(request(&push_body("refs/tags/v1"), None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({"matched": 1, "triggered": 1}));
    let stamp = dir.annotation("apps", "release").unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok(), "{TRIGGER_ANNOTATION}={stamp}");
}

#[tokio::test]
async fn no_match_is_still_ok() {
    let dir = fleet();
    let res = router(&dir, None).oneshot(request(&push_body("refs/heads/feature"), None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({"matched": 0, "triggered": 0}));
}

#[tokio::test]
async fn missing_or_bad_signature_is_unauthorized() {
    let dir = fleet();
    let body = push_body("refs/heads/main");

    let res = router(&dir, Some(SECRET)).oneshot(request(&body, None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(res).await["code"], "unauthorized");

    let forged = sign(b"wrong", body.as_bytes());
    let res = router(&dir, Some(SECRET)).oneshot(request(&body, Some(&forged))).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(dir.annotation("apps", "web").is_none());
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let dir = fleet();
    let res = router(&dir, None).oneshot(request("{not json", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["code"], "bad_request");
}

#[tokio::test]
async fn listing_failure_is_internal_error() {
    let dir = fleet();
    dir.set_unavailable(true);
    let res = router(&dir, None).oneshot(request(&push_body("refs/heads/main"), None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn one_failed_patch_does_not_block_the_rest() {
    let dir = fleet();
    dir.fail_trigger_for("web");
    let res = router(&dir, None).oneshot(request(&push_body("refs/heads/main"), None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({"matched": 2, "triggered": 1}));
    assert!(dir.annotation("apps", "web-default").is_some());
}

#[tokio::test]
async fn health_and_metrics_are_served() {
    let dir = fleet();
    let res = router(&dir, None).oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    router(&dir, None).oneshot(request(&push_body("refs/heads/main"), None)).await.unwrap();
    let res = router(&dir, None).oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
    let text = String::from_utf8(to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("keel_webhook_deliveries_total"));
}
