//! The build Job: a git init container checks out the commit, kaniko builds
//! and pushes the image.
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EmptyDirVolumeSource, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use std::collections::BTreeMap;

use crate::config::OperatorConfig;
use crate::converge::{APP_LABEL, COMMIT_LABEL};
use crate::credentials::SourceSecrets;
use crate::error::{Error, Result};
use crate::image::ImageRefs;
use crate::revision::ssh_url;

const WORKSPACE: &str = "/workspace";
const SSH_MOUNT: &str = "/git-secrets/ssh";
const TOKEN_MOUNT: &str = "/git-secrets/token";

/// Deterministic per (app, commit) so concurrent submitters collide on create.
pub fn job_name(app: &str, commit: &str) -> String {
    let short: String = commit.chars().take(7).collect();
    let prefix: String = app.chars().take(63 - "-build-".len() - short.len()).collect();
    format!("{}-build-{short}", prefix.trim_end_matches('-'))
}

/// Clone script. Credentials are tried in the same order the resolver uses:
/// SSH key, then token, then anonymous. Each failed attempt empties the
/// workspace before the next one; the script fails only when all do.
pub const CLONE_SCRIPT: &str = r#"set -eu
WORKSPACE="${WORKSPACE:-/workspace}"
SSH_KEY_FILE="${SSH_KEY_FILE:-/git-secrets/ssh/key}"
TOKEN_FILE="${TOKEN_FILE:-/git-secrets/token/token}"
try_clone() {
  rm -rf "$WORKSPACE"/* "$WORKSPACE"/.[!.]* 2>/dev/null || true
  git clone --quiet "$1" "$WORKSPACE"
}
CLONED=""
if [ -s "$SSH_KEY_FILE" ]; then
  mkdir -p /tmp/ssh
  cp "$SSH_KEY_FILE" /tmp/ssh/id
  chmod 600 /tmp/ssh/id
  export GIT_SSH_COMMAND="ssh -i /tmp/ssh/id -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null"
  if try_clone "$SSH_URL"; then CLONED=ssh; else echo "keel: ssh clone failed" >&2; fi
fi
if [ -z "$CLONED" ] && [ -s "$TOKEN_FILE" ]; then
  TOKEN="$(tr -d '\r\n' < "$TOKEN_FILE")"
  TOKEN_URL="$(printf '%s' "$REPO_URL" | sed "s#^https://#https://${TOKEN_USER}:${TOKEN}@#")"
  if try_clone "$TOKEN_URL"; then CLONED=token; else echo "keel: token clone failed" >&2; fi
fi
if [ -z "$CLONED" ]; then
  try_clone "$REPO_URL" || { echo "keel: every clone attempt failed" >&2; exit 1; }
fi
cd "$WORKSPACE"
git -c advice.detachedHead=false checkout --quiet "$COMMIT"
rm -rf .git
"#;

/// Marker file → Dockerfile used when the repository does not ship one.
/// Checked in order; the first marker present wins.
pub const DOCKERFILE_TEMPLATES: &[(&str, &str)] = &[
    ("package.json", "FROM node:20-alpine\nWORKDIR /app\nCOPY . .\nRUN npm ci || npm install\nENV PORT=8080\nEXPOSE 8080\nUSER 1000\nCMD [\"npm\", \"start\"]\n"),
    ("requirements.txt", "FROM python:3.12-slim\nWORKDIR /app\nCOPY . .\nRUN pip install --no-cache-dir -r requirements.txt\nENV PORT=8080\nEXPOSE 8080\nUSER 1000\nCMD [\"python\", \"app.py\"]\n"),
    ("go.mod", "FROM golang:1.22-alpine AS build\nWORKDIR /src\nCOPY . .\nRUN CGO_ENABLED=0 go build -o /out/app .\nFROM alpine:3.20\nCOPY --from=build /out/app /app\nEXPOSE 8080\nUSER 1000\nCMD [\"/app\"]\n"),
    ("Cargo.toml", "FROM rust:1.81 AS build\nWORKDIR /src\nCOPY . .\nRUN cargo build --release && cp \"$(find target/release -maxdepth 1 -type f -perm -u+x | head -n1)\" /app\nFROM debian:bookworm-slim\nCOPY --from=build /app /app\nEXPOSE 8080\nUSER 1000\nCMD [\"/app\"]\n"),
];

/// Used when no marker matches: serve the checkout as static files.
pub const STATIC_DOCKERFILE: &str = "FROM nginxinc/nginx-unprivileged:1.27-alpine\nCOPY . /usr/share/nginx/html\nEXPOSE 8080\n";

/// Shell snippet appended to the clone script that writes a Dockerfile when missing.
pub fn dockerfile_fallback_script() -> String {
    let mut s = String::from("if [ ! -f Dockerfile ]; then\n");
    for (i, (marker, dockerfile)) in DOCKERFILE_TEMPLATES.iter().enumerate() {
        let kw = if i == 0 { "if" } else { "elif" };
        s.push_str(&format!("  {kw} [ -f {marker} ]; then\n    cat > Dockerfile <<'KEEL_EOF'\n{dockerfile}KEEL_EOF\n"));
    }
    s.push_str(&format!("  else\n    cat > Dockerfile <<'KEEL_EOF'\n{STATIC_DOCKERFILE}KEEL_EOF\n  fi\nfi\n"));
    s
}

fn env(name: &str, value: impl Into<String>) -> EnvVar { EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() } }

fn secret_volume(name: &str, secret: &str, key: &str, path: &str) -> Volume {
    Volume {
        name: name.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.into()),
            items: Some(vec![KeyToPath { key: key.into(), path: path.into(), mode: None }]),
            default_mode: Some(0o400),
            optional: Some(true),
        }),
        ..Default::default()
    }
}

pub struct JobParams<'a> {
    pub app: &'a crate::crd::KeelApp,
    pub commit: &'a str,
    pub images: &'a ImageRefs,
    pub secrets: &'a SourceSecrets,
    pub config: &'a OperatorConfig,
}

pub fn build_job(p: &JobParams<'_>) -> Result<Job> {
    let name = p.app.metadata.name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
    let ns = p.app.metadata.namespace.clone().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let owner = kube::Resource::controller_owner_ref(p.app, &()).ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let build = &p.config.build;

    let mut volumes = vec![Volume { name: "workspace".into(), empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() }];
    let mut clone_mounts = vec![VolumeMount { name: "workspace".into(), mount_path: WORKSPACE.into(), ..Default::default() }];
    if let Some((secret, key)) = &p.secrets.ssh {
        volumes.push(secret_volume("git-ssh", secret, key, "key"));
        clone_mounts.push(VolumeMount { name: "git-ssh".into(), mount_path: SSH_MOUNT.into(), read_only: Some(true), ..Default::default() });
    }
    if let Some((secret, key)) = &p.secrets.token {
        volumes.push(secret_volume("git-token", secret, key, "token"));
        clone_mounts.push(VolumeMount { name: "git-token".into(), mount_path: TOKEN_MOUNT.into(), read_only: Some(true), ..Default::default() });
    }

    let clone = Container {
        name: "clone".into(),
        image: Some(build.git_image.clone()),
        command: Some(vec!["sh".into(), "-c".into(), format!("{CLONE_SCRIPT}{}", dockerfile_fallback_script())]),
        env: Some(vec![
            env("REPO_URL", p.app.spec.repo_url.clone()),
            env("SSH_URL", ssh_url(&p.app.spec.repo_url, &p.config.git.ssh_hosts)),
            env("COMMIT", p.commit),
            env("TOKEN_USER", p.config.git.token_username.clone()),
        ]),
        volume_mounts: Some(clone_mounts),
        ..Default::default()
    };

    let mut args = vec![
        format!("--context=dir://{WORKSPACE}"),
        format!("--dockerfile={WORKSPACE}/Dockerfile"),
        format!("--destination={}", p.images.push),
        "--cache=true".to_string(),
        format!("--cache-repo={}", p.images.cache),
    ];
    let mut kaniko_mounts = vec![VolumeMount { name: "workspace".into(), mount_path: WORKSPACE.into(), ..Default::default() }];
    match &p.app.spec.registry_secret_ref {
        Some(secret) => {
            volumes.push(secret_volume("docker-config", secret, ".dockerconfigjson", "config.json"));
            kaniko_mounts.push(VolumeMount { name: "docker-config".into(), mount_path: "/kaniko/.docker".into(), read_only: Some(true), ..Default::default() });
        }
        None => {
            // the in-cluster registry speaks plain HTTP
            args.push("--insecure".into());
            args.push("--skip-tls-verify".into());
            args.push("--insecure-pull".into());
        }
    }
    let kaniko = Container { name: "kaniko".into(), image: Some(build.kaniko_image.clone()), args: Some(args), volume_mounts: Some(kaniko_mounts), ..Default::default() };

    let labels = BTreeMap::from([(APP_LABEL.to_string(), name.clone()), (COMMIT_LABEL.to_string(), p.commit.to_string())]);
    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&name, p.commit)),
            namespace: Some(ns),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(build.backoff_limit),
            ttl_seconds_after_finished: Some(build.ttl_secs),
            active_deadline_seconds: Some(build.deadline_secs),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".into()),
                    init_containers: Some(vec![clone]),
                    containers: vec![kaniko],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
