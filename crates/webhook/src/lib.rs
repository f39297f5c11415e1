//! HTTP receiver that maps git push notifications onto `KeelApp` trigger
//! annotations.
pub mod directory;
pub mod error;
pub mod handlers;
pub mod matching;
pub mod signature;
pub mod telemetry;
pub mod test_support;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use directory::AppDirectory;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn AppDirectory>,
    /// Shared HMAC secret; when unset, signatures are not checked.
    pub secret: Option<Arc<[u8]>>,
}

impl AppState {
    pub fn new(directory: Arc<dyn AppDirectory>, secret: Option<&str>) -> Self {
        let secret = secret.filter(|s| !s.is_empty()).map(|s| Arc::from(s.as_bytes()));
        Self { directory, secret }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(telemetry::metrics_handler))
        .route("/webhook", post(handlers::push))
        .with_state(state)
}
