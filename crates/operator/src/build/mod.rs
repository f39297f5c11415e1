//! Build orchestration: at most one build Job per (application, commit), and
//! the gate that decides whether a resolved commit may be rolled out.
pub mod job;

pub use job::{build_job, job_name, JobParams};

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::crd::{BuildRecord, BuildResult, KeelApp, KeelAppStatus};
use crate::error::{Error, Result};
use crate::logging::StepContext;
use crate::telemetry::BUILDS_SUBMITTED_TOTAL;

/// What the reconciler may do with a resolved commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// No finished build is known for the commit; submit or watch its Job.
    Observe,
    /// The commit's image exists; converge the workload onto it.
    Converge,
    /// The commit's build failed; keep the previous workload and wait for a new commit.
    HoldFailed,
}

pub fn gate(status: Option<&KeelAppStatus>, commit: &str) -> Gate {
    let Some(status) = status else { return Gate::Observe };
    if status.latest_build_id.as_deref() != Some(commit) { return Gate::Observe; }
    match status.build_history.iter().find(|r| r.commit_id == commit).map(|r| r.status) {
        Some(BuildResult::Succeeded) => Gate::Converge,
        Some(BuildResult::Failed) => Gate::HoldFailed,
        None => Gate::Observe,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome { Running, Succeeded, Failed(String) }

/// Terminal conditions win; counters are a fallback for API servers that have
/// not posted a condition yet. A failed pod only counts as terminal once the
/// retry budget is spent.
pub fn job_outcome(job: &Job, backoff_limit: i32) -> JobOutcome {
    let Some(status) = job.status.as_ref() else { return JobOutcome::Running };
    for c in status.conditions.iter().flatten() {
        if c.status != "True" { continue; }
        match c.type_.as_str() {
            "Complete" | "SuccessCriteriaMet" => return JobOutcome::Succeeded,
            "Failed" | "FailureTarget" => {
                return JobOutcome::Failed(c.message.clone().or_else(|| c.reason.clone()).unwrap_or_else(|| "build job failed".into()))
            }
            _ => {}
        }
    }
    if status.succeeded.unwrap_or(0) > 0 { return JobOutcome::Succeeded; }
    let limit = job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(backoff_limit);
    if status.failed.unwrap_or(0) > limit { return JobOutcome::Failed(format!("{} failed attempts", status.failed.unwrap_or(0))); }
    JobOutcome::Running
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    /// This call created the Job.
    Submitted,
    /// A Job for the commit exists and has not finished.
    Pending,
    Finished(BuildRecord),
}

/// Ensures a build Job exists for `commit` and reports its state. Creation
/// races are settled by the API server: whoever loses sees `AlreadyExists`.
pub async fn ensure_build<C: Cluster>(cluster: &C, step: &StepContext, app: &KeelApp, commit: &str, params: &JobParams<'_>) -> Result<BuildState> {
    let ns = app.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = job_name(&app.name_any(), commit);
    if let Some(existing) = cluster.get::<Job>(&ns, &name).await? {
        return Ok(match job_outcome(&existing, params.config.build.backoff_limit) {
            JobOutcome::Running => BuildState::Pending,
            JobOutcome::Succeeded => BuildState::Finished(record(&existing, commit, BuildResult::Succeeded, None)),
            JobOutcome::Failed(msg) => {
                warn!(parent: &step.span, job=%name, %commit, error=%msg, "build.failed");
                BuildState::Finished(record(&existing, commit, BuildResult::Failed, Some(msg)))
            }
        });
    }
    match cluster.create(&ns, &build_job(params)?).await {
        Ok(_) => {
            BUILDS_SUBMITTED_TOTAL.inc();
            info!(parent: &step.span, job=%name, %commit, image=%params.images.push, "build.submitted");
            Ok(BuildState::Submitted)
        }
        Err(Error::AlreadyExists { .. }) => Ok(BuildState::Pending),
        Err(e) => Err(e),
    }
}

fn record(job: &Job, commit: &str, status: BuildResult, message: Option<String>) -> BuildRecord {
    let st = job.status.as_ref();
    BuildRecord {
        commit_id: commit.to_string(),
        status,
        start_time: st.and_then(|s| s.start_time.as_ref()).map(|t| t.0.to_rfc3339()),
        completion_time: Some(st.and_then(|s| s.completion_time.as_ref()).map(|t| t.0.to_rfc3339()).unwrap_or_else(|| Utc::now().to_rfc3339())),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};

    fn job_with(status: JobStatus) -> Job {
        Job { spec: Some(JobSpec { backoff_limit: Some(1), ..Default::default() }), status: Some(status), ..Default::default() }
    }

    fn cond(type_: &str) -> JobCondition { JobCondition { type_: type_.into(), status: "True".into(), ..Default::default() } }

    #[test]
    fn conditions_decide_outcome() {
        assert_eq!(job_outcome(&job_with(JobStatus { conditions: Some(vec![cond("Complete")]), ..Default::default() }), 1), JobOutcome::Succeeded);
        assert!(matches!(job_outcome(&job_with(JobStatus { conditions: Some(vec![cond("Failed")]), ..Default::default() }), 1), JobOutcome::Failed(_)));
    }

    #[test]
    fn single_failed_pod_within_backoff_is_still_running() {
        assert_eq!(job_outcome(&job_with(JobStatus { failed: Some(1), active: Some(1), ..Default::default() }), 1), JobOutcome::Running);
        assert!(matches!(job_outcome(&job_with(JobStatus { failed: Some(2), ..Default::default() }), 1), JobOutcome::Failed(_)));
    }

    fn status(latest: &str, history: &[(&str, BuildResult)]) -> KeelAppStatus {
        KeelAppStatus {
            latest_build_id: Some(latest.into()),
            build_history: history
                .iter()
                .map(|(c, r)| BuildRecord { commit_id: (*c).into(), status: *r, start_time: None, completion_time: None, message: None })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn gate_follows_history_for_latest_commit() {
        assert_eq!(gate(None, "a"), Gate::Observe);
        assert_eq!(gate(Some(&status("a", &[])), "b"), Gate::Observe);
        assert_eq!(gate(Some(&status("a", &[])), "a"), Gate::Observe);
        assert_eq!(gate(Some(&status("a", &[("a", BuildResult::Succeeded)])), "a"), Gate::Converge);
        assert_eq!(gate(Some(&status("b", &[("b", BuildResult::Failed), ("a", BuildResult::Succeeded)])), "b"), Gate::HoldFailed);
    }
}
