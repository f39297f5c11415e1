use keel_operator::telemetry::REGISTRY;
use once_cell::sync::Lazy;
use prometheus::{opts, IntCounterVec};

pub use keel_operator::telemetry::metrics_handler;

/// Deliveries by result: `triggered`, `no_match`, `trigger_failed`,
/// `unauthorized`, `bad_request` or `error`.
pub static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("keel_webhook_deliveries_total", "Push deliveries by result"), &["result"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
