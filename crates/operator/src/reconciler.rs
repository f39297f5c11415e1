//! One control-loop step per application: resolve the revision, compare it
//! with the last built commit, build or converge, write status, and pick the
//! next wake-up.
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn, Instrument};

use crate::build::{self, BuildState, Gate, JobParams};
use crate::cluster::Cluster;
use crate::config::OperatorConfig;
use crate::converge::{self, SELECTOR_LABEL};
use crate::credentials;
use crate::crd::{BuildResult, KeelApp, KeelAppSpec, KeelAppStatus, UpdateKind};
use crate::error::{Error, Result};
use crate::image::image_refs;
use crate::logging::StepContext;
use crate::phase::{transition, Event, Phase};
use crate::revision::RevisionResolver;
use crate::telemetry::RECONCILE_TOTAL;

pub const AUTH_BACKOFF: Duration = Duration::from_secs(300);
pub const RESOLVE_BACKOFF: Duration = Duration::from_secs(60);
pub const BUILD_POLL: Duration = Duration::from_secs(30);
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60);

pub struct Context<C: Cluster> {
    pub cluster: C,
    pub resolver: RevisionResolver,
    pub config: Arc<OperatorConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// No timed wake-up; the next watch event (e.g. a webhook annotation) triggers a step.
    AwaitChange,
}

impl Requeue {
    pub fn into_action(self) -> Action {
        match self {
            Requeue::After(d) => Action::requeue(d),
            Requeue::AwaitChange => Action::await_change(),
        }
    }
}

/// How a step ended, for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    AuthError,
    ResolveFailed,
    BuildSubmitted,
    BuildPending,
    BuildSucceeded,
    BuildFailed,
    HeldFailed,
    Converged,
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AuthError => "auth_error",
            Self::ResolveFailed => "resolve_failed",
            Self::BuildSubmitted => "build_submitted",
            Self::BuildPending => "build_pending",
            Self::BuildSucceeded => "build_succeeded",
            Self::BuildFailed => "build_failed",
            Self::HeldFailed => "held_failed",
            Self::Converged => "converged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step { pub outcome: StepOutcome, pub requeue: Requeue }

/// Wake-up after convergence. Webhook strategies without an interval wait for
/// a change; unparseable intervals fall back to the configured default.
pub fn poll_requeue(spec: &KeelAppSpec, config: &OperatorConfig) -> Requeue {
    match spec.update_strategy.interval.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
        Some(i) => Requeue::After(humantime::parse_duration(i).unwrap_or_else(|_| config.default_poll())),
        None if spec.update_strategy.kind == UpdateKind::Webhook => Requeue::AwaitChange,
        None => Requeue::After(config.default_poll()),
    }
}

/// Patches status only when it changed; `written` tracks what the server has.
async fn write_status<C: Cluster>(cluster: &C, app: &KeelApp, written: &mut KeelAppStatus, next: &KeelAppStatus) -> Result<()> {
    if written == next { return Ok(()); }
    let ns = app.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    cluster.patch_status::<KeelApp>(&ns, &app.name_any(), &serde_json::to_value(next)?).await?;
    *written = next.clone();
    Ok(())
}

/// Sum of container restarts across the application's pods. Listing failures
/// only cost the metric, never the step.
async fn restart_count<C: Cluster>(cluster: &C, step: &StepContext, ns: &str, name: &str) -> i32 {
    match cluster.list::<Pod>(ns, &format!("{SELECTOR_LABEL}={name}")).await {
        Ok(pods) => pods
            .iter()
            .filter_map(|p| p.status.as_ref()?.container_statuses.as_ref())
            .flatten()
            .map(|c| c.restart_count)
            .sum(),
        Err(e) => {
            debug!(parent: &step.span, error=%e, "status.restart_count.unavailable");
            0
        }
    }
}

pub async fn run_step<C: Cluster>(app: &KeelApp, ctx: &Context<C>, step: &StepContext) -> Result<Step> {
    let config = ctx.config.as_ref();
    let ns = app.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = app.name_any();
    let mut written = app.status.clone().unwrap_or_default();
    let mut status = written.clone();

    let secrets = credentials::load(&ctx.cluster, app, &config.git).await?;
    let commit = match ctx.resolver.resolve(step, &app.spec.repo_url, &app.spec.source, &secrets.creds).await {
        Ok(c) => c,
        Err(e) => {
            let (event, outcome, wait) = if e.is_auth() {
                (Event::AuthFailure, StepOutcome::AuthError, AUTH_BACKOFF)
            } else {
                (Event::ResolutionFailed, StepOutcome::ResolveFailed, RESOLVE_BACKOFF)
            };
            warn!(parent: &step.span, kind=?e.kind(), error=%e, "revision.failed");
            status.phase = transition(status.phase, event);
            write_status(&ctx.cluster, app, &mut written, &status).await?;
            return Ok(Step { outcome, requeue: Requeue::After(wait) });
        }
    };
    status.phase = transition(status.phase, Event::ResolutionSucceeded);

    let has_registry_secret = app.spec.registry_secret_ref.is_some();
    let images = image_refs(&app.spec.image_name, &commit, &config.registry, has_registry_secret);

    match build::gate(Some(&status), &commit) {
        Gate::Observe => {
            if status.latest_build_id.as_deref() != Some(commit.as_str()) {
                info!(parent: &step.span, %commit, previous=?status.latest_build_id, "revision.new_commit");
                status.latest_build_id = Some(commit.clone());
                status.phase = transition(status.phase, Event::BuildSubmitted);
                // recorded before the job exists so a crash never leaves an untracked build
                write_status(&ctx.cluster, app, &mut written, &status).await?;
            }
            let params = JobParams { app, commit: &commit, images: &images, secrets: &secrets, config };
            let (outcome, requeue) = match build::ensure_build(&ctx.cluster, step, app, &commit, &params).await? {
                BuildState::Submitted => {
                    status.phase = transition(status.phase, Event::BuildSubmitted);
                    (StepOutcome::BuildSubmitted, Requeue::After(BUILD_POLL))
                }
                BuildState::Pending => {
                    status.phase = transition(status.phase, Event::BuildPending);
                    (StepOutcome::BuildPending, Requeue::After(BUILD_POLL))
                }
                BuildState::Finished(record) => {
                    let succeeded = record.status == BuildResult::Succeeded;
                    info!(parent: &step.span, %commit, ?record.status, "build.finished");
                    status.record_build(record);
                    if succeeded {
                        status.phase = transition(status.phase, Event::BuildSucceeded);
                        (StepOutcome::BuildSucceeded, Requeue::After(Duration::ZERO))
                    } else {
                        status.phase = transition(status.phase, Event::BuildFailed);
                        (StepOutcome::BuildFailed, poll_requeue(&app.spec, config))
                    }
                }
            };
            write_status(&ctx.cluster, app, &mut written, &status).await?;
            Ok(Step { outcome, requeue })
        }
        Gate::HoldFailed => {
            debug!(parent: &step.span, %commit, "build.hold_failed");
            status.phase = transition(status.phase, Event::BuildFailed);
            write_status(&ctx.cluster, app, &mut written, &status).await?;
            Ok(Step { outcome: StepOutcome::HeldFailed, requeue: poll_requeue(&app.spec, config) })
        }
        Gate::Converge => {
            let report = converge::converge(&ctx.cluster, step, app, &images.pull, config).await?;
            status.ready_replicas = report.ready_replicas;
            status.desired_replicas = report.desired_replicas;
            status.service_type = report.service_type;
            status.ingress_host = report.ingress_host;
            status.app_url = Some(report.app_url);
            status.restart_count = restart_count(&ctx.cluster, step, &ns, &name).await;

            let before = status.phase;
            let event = if report.ready_replicas >= report.desired_replicas { Event::WorkloadReady } else { Event::WorkloadNotReady };
            status.phase = transition(status.phase, event);
            if status.phase == Some(Phase::Running) && before != Some(Phase::Running) {
                status.last_deployed_at = Some(Utc::now().to_rfc3339());
                info!(parent: &step.span, %commit, image=%images.pull, "deploy.running");
            }
            write_status(&ctx.cluster, app, &mut written, &status).await?;
            Ok(Step { outcome: StepOutcome::Converged, requeue: poll_requeue(&app.spec, config) })
        }
    }
}

/// Controller entry point: a fresh [`StepContext`] per call, the step runs inside its span.
pub async fn reconcile<C: Cluster>(app: Arc<KeelApp>, ctx: Arc<Context<C>>) -> Result<Action> {
    let step = StepContext::new(&app.name_any(), &app.namespace().unwrap_or_default());
    let span = step.span.clone();
    let result = run_step(&app, &ctx, &step).instrument(span).await;
    match &result {
        Ok(s) => {
            RECONCILE_TOTAL.with_label_values(&[s.outcome.label()]).inc();
            debug!(parent: &step.span, outcome = s.outcome.label(), requeue=?s.requeue, "reconcile.done");
        }
        Err(e) => {
            RECONCILE_TOTAL.with_label_values(&[e.metric_label()]).inc();
        }
    }
    result.map(|s| s.requeue.into_action())
}

pub fn error_policy<C: Cluster>(app: Arc<KeelApp>, err: &Error, _ctx: Arc<Context<C>>) -> Action {
    warn!(app=%app.name_any(), namespace=?app.namespace(), error=%err, "reconcile.error");
    Action::requeue(ERROR_BACKOFF)
}
