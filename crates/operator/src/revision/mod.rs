//! Revision resolution: turns a repository URL and a [`SourceSelector`] into
//! the commit id the application should run.
//!
//! Credential strategies are tried in a fixed order (SSH key, token,
//! anonymous). The transport reports which stage failed for each attempt so
//! the composite error can be classified without inspecting message text.
mod http;
mod ssh;

pub use http::{parse_advertisement, HttpRefLister};
pub use ssh::{classify_ssh_stderr, SshRefLister};

use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crd::{SourceKind, SourceSelector};
use crate::logging::StepContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef { pub name: String, pub oid: String }

impl RemoteRef {
    pub fn new(name: impl Into<String>, oid: impl Into<String>) -> Self { Self { name: name.into(), oid: oid.into() } }
}

#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    SshKey(&'a str),
    Token { username: &'a str, token: &'a str },
    Anonymous,
}

/// Where a single attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// DNS, TCP, TLS, timeouts, unexpected protocol responses.
    Connect,
    /// The remote rejected (or demanded) credentials.
    Authenticate,
    /// The repository or the selected ref does not exist.
    NotFound,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Stage::Connect => "connect", Stage::Authenticate => "authenticate", Stage::NotFound => "not found" })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage}: {message}")]
pub struct TransportError { pub stage: Stage, pub message: String }

impl TransportError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self { Self { stage, message: message.into() } }
}

/// Lists the refs a remote advertises. Implementations must bound their own runtime.
#[async_trait]
pub trait RefLister: Send + Sync {
    async fn list_refs(&self, url: &str, credential: Credential<'_>) -> Result<Vec<RemoteRef>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy { Ssh, Token, Anonymous }

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Strategy::Ssh => "ssh", Strategy::Token => "token", Strategy::Anonymous => "anonymous" })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{strategy} {stage}: {message}")]
pub struct AttemptFailure { pub strategy: Strategy, pub stage: Stage, pub message: String }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveErrorKind { Auth, NotFound, Network }

/// Every attempted strategy failed. Attempts are kept in the order they ran;
/// the last one is the innermost cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionError { pub attempts: Vec<AttemptFailure> }

impl RevisionError {
    /// A remote that listed refs but lacked the target is `NotFound`; otherwise
    /// any rejected credential makes the failure `Auth`; the rest is `Network`.
    pub fn kind(&self) -> ResolveErrorKind {
        if self.attempts.iter().any(|a| a.stage == Stage::NotFound) {
            ResolveErrorKind::NotFound
        } else if self.attempts.iter().any(|a| a.stage == Stage::Authenticate) {
            ResolveErrorKind::Auth
        } else {
            ResolveErrorKind::Network
        }
    }

    pub fn is_auth(&self) -> bool { self.kind() == ResolveErrorKind::Auth }
}

impl fmt::Display for RevisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all credential strategies failed")?;
        for a in &self.attempts { write!(f, "; {a}")?; }
        Ok(())
    }
}

impl std::error::Error for RevisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.attempts.last().map(|a| a as &(dyn std::error::Error + 'static))
    }
}

/// Credential material read from the application's secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitCredentials { pub ssh_key: Option<String>, pub token: Option<String> }

#[derive(Clone)]
pub struct RevisionResolver {
    lister: Arc<dyn RefLister>,
    ssh_hosts: Vec<String>,
    token_username: String,
}

impl RevisionResolver {
    pub fn new(lister: Arc<dyn RefLister>, ssh_hosts: Vec<String>, token_username: impl Into<String>) -> Self {
        Self { lister, ssh_hosts, token_username: token_username.into() }
    }

    /// Production resolver: smart-HTTP over reqwest, SSH through `git ls-remote`.
    pub fn with_git_remote(timeout: Duration, ssh_hosts: Vec<String>, token_username: impl Into<String>) -> anyhow::Result<Self> {
        let lister = GitRemote { http: HttpRefLister::new(timeout)?, ssh: SshRefLister::new(timeout) };
        Ok(Self::new(Arc::new(lister), ssh_hosts, token_username))
    }

    pub async fn resolve(&self, step: &StepContext, repo_url: &str, selector: &SourceSelector, creds: &GitCredentials) -> Result<String, RevisionError> {
        if selector.kind == SourceKind::Commit {
            debug!(parent: &step.span, commit=%selector.value, "revision.fixed_commit");
            return Ok(selector.value.clone());
        }
        let mut attempts = Vec::new();
        let mut plan: Vec<(Strategy, String, Credential<'_>)> = Vec::with_capacity(3);
        if let Some(key) = creds.ssh_key.as_deref().filter(|k| !k.trim().is_empty()) {
            plan.push((Strategy::Ssh, ssh_url(repo_url, &self.ssh_hosts), Credential::SshKey(key)));
        }
        if let Some(token) = creds.token.as_deref().filter(|t| !t.trim().is_empty()) {
            plan.push((Strategy::Token, repo_url.to_string(), Credential::Token { username: &self.token_username, token: token.trim() }));
        }
        plan.push((Strategy::Anonymous, repo_url.to_string(), Credential::Anonymous));

        for (strategy, url, credential) in plan {
            debug!(parent: &step.span, %strategy, %url, "revision.attempt");
            let outcome = match self.lister.list_refs(&url, credential).await {
                Ok(refs) => select_ref(&refs, selector).ok_or_else(|| TransportError::new(Stage::NotFound, format!("ref {} not advertised", target_label(selector)))),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(commit) => {
                    info!(parent: &step.span, %strategy, %commit, "revision.resolved");
                    return Ok(commit);
                }
                Err(e) => {
                    warn!(parent: &step.span, %strategy, stage=%e.stage, error=%e.message, "revision.attempt_failed");
                    attempts.push(AttemptFailure { strategy, stage: e.stage, message: e.message });
                }
            }
        }
        Err(RevisionError { attempts })
    }
}

fn target_label(selector: &SourceSelector) -> String {
    match selector.kind {
        _ if selector.is_default_branch() => "refs/heads/main|master".into(),
        SourceKind::Branch => format!("refs/heads/{}", selector.value),
        SourceKind::Tag => format!("refs/tags/{}", selector.value),
        SourceKind::Commit => selector.value.clone(),
    }
}

/// Picks the commit for `selector` out of an advertisement. Annotated tags
/// resolve to their peeled commit when the remote advertises one.
pub fn select_ref(refs: &[RemoteRef], selector: &SourceSelector) -> Option<String> {
    let find = |name: &str| refs.iter().find(|r| r.name == name).map(|r| r.oid.clone());
    match selector.kind {
        SourceKind::Commit => Some(selector.value.clone()),
        _ if selector.is_default_branch() => find("refs/heads/main").or_else(|| find("refs/heads/master")).or_else(|| find("HEAD")),
        SourceKind::Branch => find(&format!("refs/heads/{}", selector.value)),
        SourceKind::Tag => {
            let name = format!("refs/tags/{}", selector.value);
            find(&format!("{name}^{{}}")).or_else(|| find(&name))
        }
    }
}

/// Rewrites `https://<known host>/org/repo` to `git@<known host>:org/repo`.
/// Anything else is returned unchanged.
pub fn ssh_url(url: &str, known_hosts: &[String]) -> String {
    if is_ssh_url(url) { return url.to_string(); }
    let Some(rest) = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://")) else { return url.to_string() };
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = host.rsplit('@').next().unwrap_or(host);
    if path.is_empty() || !known_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) { return url.to_string(); }
    format!("git@{}:{}", host.to_ascii_lowercase(), path.trim_end_matches('/'))
}

pub fn is_ssh_url(url: &str) -> bool { url.starts_with("ssh://") || (url.contains('@') && !url.contains("://")) }

/// Routes each attempt to the transport its URL and credential need.
pub struct GitRemote { pub http: HttpRefLister, pub ssh: SshRefLister }

#[async_trait]
impl RefLister for GitRemote {
    async fn list_refs(&self, url: &str, credential: Credential<'_>) -> Result<Vec<RemoteRef>, TransportError> {
        if is_ssh_url(url) {
            let key = match credential { Credential::SshKey(k) => Some(k), _ => None };
            return self.ssh.list(url, key).await;
        }
        match credential {
            Credential::SshKey(_) => Err(TransportError::new(Stage::Connect, format!("no ssh form known for {url}"))),
            other => self.http.list_refs(url, other).await,
        }
    }
}
