//! Image reference derivation for a commit.
use crate::config::RegistryConfig;

/// Where the build pushes and where the kubelet pulls. They differ only for
/// the in-cluster registry, which is reachable under different names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRefs {
    pub push: String,
    pub pull: String,
    /// Kaniko layer cache repository.
    pub cache: String,
}

/// Lowercases the repository and drops any tag the user supplied. A `:` that
/// belongs to a registry port (before the last `/`) is kept.
pub fn base_repository(image_name: &str) -> String {
    let lower = image_name.trim().to_ascii_lowercase();
    let lower = lower.split('@').next().unwrap_or_default().to_string();
    let last_slash = lower.rfind('/').map(|i| i + 1).unwrap_or(0);
    match lower[last_slash..].rfind(':') {
        Some(i) => lower[..last_slash + i].to_string(),
        None => lower,
    }
}

pub fn image_refs(image_name: &str, commit: &str, registry: &RegistryConfig, has_registry_secret: bool) -> ImageRefs {
    let base = base_repository(image_name);
    let (push_repo, pull_repo) = if has_registry_secret {
        (base.clone(), base)
    } else {
        (format!("{}/{base}", registry.push_host), format!("{}/{base}", registry.pull_host))
    };
    ImageRefs { push: format!("{push_repo}:{commit}"), pull: format!("{pull_repo}:{commit}"), cache: format!("{push_repo}-cache") }
}
