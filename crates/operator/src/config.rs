use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config {path:?}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Registry endpoints used when an application has no private registry secret.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host the build job pushes to (in-cluster service DNS name).
    pub push_host: String,
    /// Host the kubelet pulls from (node-local published port).
    pub pull_host: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { push_host: "keel-registry.keel-system.svc.cluster.local:5000".into(), pull_host: "localhost:30005".into() }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitConfig {
    /// Hosts whose HTTPS URLs are rewritten to `git@host:path` when an SSH key is present.
    pub ssh_hosts: Vec<String>,
    pub token_secret: String,
    pub token_key: String,
    pub token_username: String,
    /// Suffix appended to the application name to find its SSH key secret.
    pub ssh_secret_suffix: String,
    pub ssh_key: String,
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            ssh_hosts: vec!["github.com".into(), "gitlab.com".into(), "bitbucket.org".into(), "codeberg.org".into()],
            token_secret: "keel-git-token".into(),
            token_key: "token".into(),
            token_username: "oauth2".into(),
            ssh_secret_suffix: "-ssh-key".into(),
            ssh_key: "ssh-privatekey".into(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    pub backoff_limit: i32,
    pub deadline_secs: i64,
    pub ttl_secs: i32,
    pub git_image: String,
    pub kaniko_image: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            backoff_limit: 1,
            deadline_secs: 3600,
            ttl_secs: 3600,
            git_image: "alpine/git:2.45.2".into(),
            kaniko_image: "gcr.io/kaniko-project/executor:v1.23.2".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    pub registry: RegistryConfig,
    pub git: GitConfig,
    pub build: BuildConfig,
    pub ingress_class: String,
    pub default_issuer: String,
    /// Applied when an update strategy has no interval or an unparseable one.
    pub default_poll_interval: String,
    pub metrics_addr: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            git: GitConfig::default(),
            build: BuildConfig::default(),
            ingress_class: "nginx".into(),
            default_issuer: "letsencrypt-prod".into(),
            default_poll_interval: "5m".into(),
            metrics_addr: "0.0.0.0:8080".into(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl OperatorConfig {
    /// Defaults, then the TOML file named by `KEEL_CONFIG`, then `KEEL_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("KEEL_CONFIG").ok().filter(|p| !p.is_empty()) {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        debug!(?cfg, "config.loaded");
        Ok(cfg)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        debug!(path=?path, "config.load.attempt");
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn var(key: &str) -> Option<String> { std::env::var(key).ok().filter(|v| !v.is_empty()) }
        if let Some(v) = var("KEEL_REGISTRY_PUSH_HOST") { self.registry.push_host = v; }
        if let Some(v) = var("KEEL_REGISTRY_PULL_HOST") { self.registry.pull_host = v; }
        if let Some(v) = var("KEEL_GIT_TOKEN_SECRET") { self.git.token_secret = v; }
        if let Some(v) = var("KEEL_GIT_TIMEOUT_SECS") {
            self.git.timeout_secs = v.parse().map_err(|_| ConfigError::InvalidEnv { key: "KEEL_GIT_TIMEOUT_SECS", value: v })?;
        }
        if let Some(v) = var("KEEL_BUILD_DEADLINE_SECS") {
            self.build.deadline_secs = v.parse().map_err(|_| ConfigError::InvalidEnv { key: "KEEL_BUILD_DEADLINE_SECS", value: v })?;
        }
        if let Some(v) = var("KEEL_INGRESS_CLASS") { self.ingress_class = v; }
        if let Some(v) = var("KEEL_DEFAULT_ISSUER") { self.default_issuer = v; }
        if let Some(v) = var("KEEL_METRICS_ADDR") { self.metrics_addr = v; }
        if let Some(v) = var("KEEL_LOG_LEVEL") { self.log_level = v; }
        if let Some(v) = var("KEEL_LOG_FORMAT") { self.log_format = v; }
        Ok(())
    }

    pub fn git_timeout(&self) -> Duration { Duration::from_secs(self.git.timeout_secs.max(1)) }

    pub fn default_poll(&self) -> Duration {
        humantime::parse_duration(&self.default_poll_interval).unwrap_or(Duration::from_secs(300))
    }
}
