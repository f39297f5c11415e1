//! Loads git credential material from the application's namespace.
use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crate::cluster::Cluster;
use crate::config::GitConfig;
use crate::crd::KeelApp;
use crate::error::Result;
use crate::revision::GitCredentials;
use kube::ResourceExt;

/// Credentials plus the secrets they came from, so the build job can mount the same ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSecrets {
    pub creds: GitCredentials,
    /// `(secret name, key)` holding the SSH private key.
    pub ssh: Option<(String, String)>,
    /// `(secret name, key)` holding the access token.
    pub token: Option<(String, String)>,
}

pub fn ssh_secret_name(app: &KeelApp, git: &GitConfig) -> String {
    app.spec.credentials.as_ref().and_then(|c| c.ssh_key_secret.clone()).unwrap_or_else(|| format!("{}{}", app.name_any(), git.ssh_secret_suffix))
}

pub fn token_secret_name(app: &KeelApp, git: &GitConfig) -> String {
    app.spec.credentials.as_ref().and_then(|c| c.token_secret.clone()).unwrap_or_else(|| git.token_secret.clone())
}

/// Value of `key` from `data`, falling back to `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let from_data = secret.data.as_ref().and_then(|d| d.get(key)).map(|b| String::from_utf8_lossy(&b.0).into_owned());
    from_data
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).cloned())
        .filter(|v| !v.trim().is_empty())
}

/// Absent secrets or keys are not errors: the resolver falls through to the
/// next strategy.
pub async fn load<C: Cluster>(cluster: &C, app: &KeelApp, git: &GitConfig) -> Result<SourceSecrets> {
    let ns = app.namespace().unwrap_or_default();
    let mut out = SourceSecrets::default();

    let ssh_name = ssh_secret_name(app, git);
    if let Some(secret) = cluster.get::<Secret>(&ns, &ssh_name).await? {
        if let Some(key) = secret_value(&secret, &git.ssh_key) {
            out.creds.ssh_key = Some(key);
            out.ssh = Some((ssh_name.clone(), git.ssh_key.clone()));
        }
    }
    let token_name = token_secret_name(app, git);
    if let Some(secret) = cluster.get::<Secret>(&ns, &token_name).await? {
        if let Some(token) = secret_value(&secret, &git.token_key) {
            out.creds.token = Some(token.trim().to_string());
            out.token = Some((token_name.clone(), git.token_key.clone()));
        }
    }
    debug!(ssh = out.ssh.is_some(), token = out.token.is_some(), "credentials.loaded");
    Ok(out)
}
