use anyhow::Result;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// `RUST_LOG` wins over `level`; `format` is `json` or anything else for compact text.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    match format {
        "json" => tracing_subscriber::registry().with(env).with(base.json()).try_init()?,
        _ => tracing_subscriber::registry().with(env).with(base.compact()).try_init()?,
    }
    Ok(())
}

/// Per-step logging context. Each control-loop step gets a fresh request id and
/// a `reconcile` span; components receive this by reference and log inside it.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub request_id: Uuid,
    pub app: String,
    pub namespace: String,
    pub span: Span,
}

impl StepContext {
    pub fn new(app: &str, namespace: &str) -> Self {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("reconcile", %request_id, app = %app, namespace = %namespace);
        Self { request_id, app: app.to_string(), namespace: namespace.to_string(), span }
    }
}
