//! `KeelApp` custom resource: the user-declared desired state and the
//! reconciler-owned observed status.
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::phase::Phase;

/// Maximum number of entries kept in `status.buildHistory`.
pub const BUILD_HISTORY_LIMIT: usize = 10;

/// Stamped with an RFC 3339 timestamp by the push receiver; any change wakes the controller.
pub const TRIGGER_ANNOTATION: &str = "keel.dev/last-webhook-trigger";

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "KeelApp",
    plural = "keelapps",
    shortname = "kapp",
    namespaced,
    status = "KeelAppStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.latestBuildId"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.appUrl"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeelAppSpec {
    /// Git repository, HTTPS (`https://github.com/org/repo`) or SSH (`git@github.com:org/repo.git`).
    pub repo_url: String,
    #[serde(default)]
    pub source: SourceSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialRefs>,

    /// Secret holding docker credentials. When unset images go through the in-cluster registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_secret_ref: Option<String>,
    /// Image repository without tag, e.g. `ghcr.io/org/app`. The commit id becomes the tag.
    pub image_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<IngressRuleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub tls: TlsConfig,
    /// Secrets injected wholesale as environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_refs: Vec<String>,
    /// Secrets mounted read-only as files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_mounts: Vec<SecretMountConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<AddonConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind { Branch, Tag, Commit }

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
pub struct SourceSelector {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub value: String,
}

impl Default for SourceSelector {
    fn default() -> Self { Self { kind: SourceKind::Branch, value: "main".into() } }
}

impl SourceSelector {
    pub fn branch(value: impl Into<String>) -> Self { Self { kind: SourceKind::Branch, value: value.into() } }
    pub fn tag(value: impl Into<String>) -> Self { Self { kind: SourceKind::Tag, value: value.into() } }
    pub fn commit(value: impl Into<String>) -> Self { Self { kind: SourceKind::Commit, value: value.into() } }

    /// Branch selectors with an empty or `HEAD` value follow the repository default branch.
    pub fn is_default_branch(&self) -> bool {
        self.kind == SourceKind::Branch && (self.value.is_empty() || self.value == "HEAD")
    }
}

/// Secret names holding git credentials. Unset fields fall back to the conventional names.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port exposed on the Service.
    pub port: i32,
    /// Port the container listens on.
    pub target_port: i32,
    #[serde(default)]
    pub protocol: PortProtocol,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol { #[default] Tcp, Udp }

impl PortProtocol {
    pub fn as_str(&self) -> &'static str { match self { Self::Tcp => "TCP", Self::Udp => "UDP" } }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRuleConfig {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub service_port: i32,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,
}

/// Limits as Kubernetes quantities (`500m`, `1Gi`).
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    pub name: String,
    pub mount_path: String,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretMountConfig {
    pub secret_name: String,
    pub mount_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddonKind { Postgres, Redis }

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddonSize { #[default] Small, Medium, Large }

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
pub struct AddonConfig {
    #[serde(rename = "type")]
    pub kind: AddonKind,
    pub name: String,
    #[serde(default)]
    pub size: AddonSize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind { Polling, Webhook }

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
pub struct UpdateStrategy {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Go-style duration (`5m`, `1h`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl Default for UpdateStrategy {
    fn default() -> Self { Self { kind: UpdateKind::Polling, interval: Some("5m".into()) } }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq, Eq)]
pub struct TlsConfig {
    /// Issuer looked up in the application's namespace (default `letsencrypt-prod`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
pub enum BuildResult { Succeeded, Failed }

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub commit_id: String,
    pub status: BuildResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed state. Optional fields serialize as `null` so a merge patch clears them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeelAppStatus {
    #[serde(default)]
    pub latest_build_id: Option<String>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub app_url: Option<String>,
    #[serde(default)]
    pub build_history: Vec<BuildRecord>,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub desired_replicas: i32,
    #[serde(default)]
    pub restart_count: i32,
    #[serde(default)]
    pub last_deployed_at: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub ingress_host: Option<String>,
}

impl KeelAppStatus {
    /// Prepends a record, silently dropping entries past [`BUILD_HISTORY_LIMIT`].
    pub fn record_build(&mut self, record: BuildRecord) {
        self.build_history.insert(0, record);
        self.build_history.truncate(BUILD_HISTORY_LIMIT);
    }
}

impl KeelAppSpec {
    pub fn desired_replicas(&self) -> i32 { self.replicas.filter(|r| *r > 0).unwrap_or(1) }
}
