//! Reconciler for `KeelApp` resources: resolves the tracked revision, builds
//! an image for each new commit and converges the workload onto it.
pub mod build;
pub mod cluster;
pub mod config;
pub mod converge;
pub mod crd;
pub mod credentials;
pub mod error;
pub mod image;
pub mod logging;
pub mod phase;
pub mod reconciler;
pub mod revision;
pub mod telemetry;
pub mod test_support;

pub use crd::{KeelApp, KeelAppSpec, KeelAppStatus};
pub use error::{Error, Result};
pub use phase::Phase;
