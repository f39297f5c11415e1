use thiserror::Error;

use crate::converge::quantity::QuantityError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid quantity: {0}")]
    Quantity(#[from] QuantityError),
    #[error("invalid desired state: {0}")]
    Invalid(String),
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Short label used for metrics and log fields.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Conflict { .. } => "conflict",
            Self::Serde(_) => "serde",
            Self::Quantity(_) | Self::Invalid(_) => "invalid",
            Self::MissingObjectKey(_) => "missing_key",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
