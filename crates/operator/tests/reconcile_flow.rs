use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentStatus},
        batch::v1::{Job, JobCondition, JobStatus},
        core::v1::Secret,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString,
};
use keel_operator::{
    config::OperatorConfig,
    crd::BuildResult,
    logging::StepContext,
    reconciler::{run_step, Context, Requeue, Step, StepOutcome},
    revision::{RemoteRef, Stage, TransportError},
    test_support::{keel_app, spec, FakeCluster, FakeRemote},
    KeelApp, KeelAppStatus, Phase,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

const NS: &str = "apps";
const SHA: &str = "abc1234def5678901234567890abcdef12345678";
const SHA2: &str = "fedcba9876543210fedcba9876543210fedcba98";

fn context(remote: &Arc<FakeRemote>) -> Context<FakeCluster> {
    Context { cluster: FakeCluster::new(), resolver: remote.resolver(), config: Arc::new(OperatorConfig::default()) }
}

fn seed_app(ctx: &Context<FakeCluster>, replicas: i32) {
    let mut s = spec("https://github.com/x/y", "x/y");
    s.replicas = Some(replicas);
    ctx.cluster.seed(NS, &keel_app("demo", NS, s));
}

async fn step(ctx: &Context<FakeCluster>) -> Step {
    let app: KeelApp = ctx.cluster.object(NS, "demo").expect("app seeded");
    run_step(&app, ctx, &StepContext::new("demo", NS)).await.expect("step succeeds")
}

fn status(ctx: &Context<FakeCluster>) -> KeelAppStatus {
    ctx.cluster.object::<KeelApp>(NS, "demo").and_then(|a| a.status).unwrap_or_default()
}

fn finish_job(ctx: &Context<FakeCluster>, name: &str, condition: &str) {
    ctx.cluster.modify::<Job>(NS, name, |job| {
        job.status = Some(JobStatus {
            succeeded: (condition == "Complete").then_some(1),
            failed: (condition == "Failed").then_some(2),
            conditions: Some(vec![JobCondition { type_: condition.into(), status: "True".into(), ..Default::default() }]),
            ..Default::default()
        });
    });
}

fn set_ready(ctx: &Context<FakeCluster>, ready: i32) {
    ctx.cluster.modify::<Deployment>(NS, "demo", |d| d.status = Some(DeploymentStatus { ready_replicas: Some(ready), ..Default::default() }));
}

#[tokio::test]
async fn new_commit_builds_then_rolls_out() {
    let remote = FakeRemote::new(vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 1);

    let s = step(&ctx).await;
    assert_eq!(s, Step { outcome: StepOutcome::BuildSubmitted, requeue: Requeue::After(Duration::from_secs(30)) });
    assert_eq!(status(&ctx).phase, Some(Phase::Building));
    assert_eq!(status(&ctx).latest_build_id.as_deref(), Some(SHA));
    assert_eq!(ctx.cluster.created::<Job>(), vec!["demo-build-abc1234".to_string()]);

    assert_eq!(step(&ctx).await.outcome, StepOutcome::BuildPending);
    assert!(ctx.cluster.object::<Deployment>(NS, "demo").is_none());

    finish_job(&ctx, "demo-build-abc1234", "Complete");
    let s = step(&ctx).await;
    assert_eq!(s, Step { outcome: StepOutcome::BuildSucceeded, requeue: Requeue::After(Duration::ZERO) });
    assert_eq!(status(&ctx).build_history[0].status, BuildResult::Succeeded);
    assert_eq!(status(&ctx).phase, Some(Phase::Building));

    let s = step(&ctx).await;
    assert_eq!(s, Step { outcome: StepOutcome::Converged, requeue: Requeue::After(Duration::from_secs(300)) });
    let dep = ctx.cluster.object::<Deployment>(NS, "demo").expect("workload created");
    let image = dep.spec.unwrap().template.spec.unwrap().containers[0].image.clone().unwrap();
    assert_eq!(image, format!("localhost:30005/x/y:{SHA}"));
    assert_eq!(status(&ctx).phase, Some(Phase::Building), "not ready yet");

    set_ready(&ctx, 1);
    step(&ctx).await;
    let st = status(&ctx);
    assert_eq!(st.phase, Some(Phase::Running));
    assert!(st.last_deployed_at.is_some());
    assert_eq!(st.app_url.as_deref(), Some("http://demo.apps.svc.cluster.local"));
    assert_eq!(ctx.cluster.created::<Job>().len(), 1);
}

#[tokio::test]
async fn running_is_latched_when_a_replica_drops() {
    let remote = FakeRemote::new(vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 3);
    step(&ctx).await;
    finish_job(&ctx, "demo-build-abc1234", "Complete");
    step(&ctx).await;
    step(&ctx).await;
    set_ready(&ctx, 3);
    step(&ctx).await;
    assert_eq!(status(&ctx).phase, Some(Phase::Running));
    let deployed_at = status(&ctx).last_deployed_at;

    set_ready(&ctx, 2);
    step(&ctx).await;
    let st = status(&ctx);
    assert_eq!(st.phase, Some(Phase::Running));
    assert_eq!(st.ready_replicas, 2);
    assert_eq!(st.last_deployed_at, deployed_at);
}

#[tokio::test]
async fn steady_state_step_issues_no_writes() {
    let remote = FakeRemote::new(vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 1);
    step(&ctx).await;
    finish_job(&ctx, "demo-build-abc1234", "Complete");
    step(&ctx).await;
    step(&ctx).await;
    set_ready(&ctx, 1);
    step(&ctx).await;

    let before = ctx.cluster.mutation_count();
    assert_eq!(step(&ctx).await.outcome, StepOutcome::Converged);
    assert_eq!(ctx.cluster.mutation_count(), before);
}

#[tokio::test]
async fn failed_build_holds_until_next_commit() {
    let remote = FakeRemote::new(vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 1);
    step(&ctx).await;
    finish_job(&ctx, "demo-build-abc1234", "Failed");

    let s = step(&ctx).await;
    assert_eq!(s, Step { outcome: StepOutcome::BuildFailed, requeue: Requeue::After(Duration::from_secs(300)) });
    let st = status(&ctx);
    assert_eq!(st.phase, Some(Phase::Failed));
    assert_eq!(st.build_history[0].status, BuildResult::Failed);

    assert_eq!(step(&ctx).await.outcome, StepOutcome::HeldFailed);
    assert_eq!(ctx.cluster.created::<Job>().len(), 1, "no retry for the same commit");
    assert!(ctx.cluster.object::<Deployment>(NS, "demo").is_none());

    remote.set_branch("main", SHA2);
    assert_eq!(step(&ctx).await.outcome, StepOutcome::BuildSubmitted);
    assert_eq!(status(&ctx).phase, Some(Phase::Building));
    assert_eq!(ctx.cluster.created::<Job>().len(), 2);
}

#[tokio::test]
async fn rejected_credentials_park_in_auth_error_until_fixed() {
    let remote = FakeRemote::token_only("s3cret", vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 1);

    let s = step(&ctx).await;
    assert_eq!(s, Step { outcome: StepOutcome::AuthError, requeue: Requeue::After(Duration::from_secs(300)) });
    assert_eq!(status(&ctx).phase, Some(Phase::AuthError));
    assert!(ctx.cluster.created::<Job>().is_empty());

    ctx.cluster.seed(
        NS,
        &Secret {
            metadata: ObjectMeta { name: Some("keel-git-token".into()), ..Default::default() },
            data: Some(BTreeMap::from([("token".to_string(), ByteString(b"s3cret".to_vec()))])),
            ..Default::default()
        },
    );
    assert_eq!(step(&ctx).await.outcome, StepOutcome::BuildSubmitted);
    assert_eq!(status(&ctx).phase, Some(Phase::Building));
}

#[tokio::test]
async fn network_failure_during_build_marks_failed() {
    let remote = FakeRemote::new(vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 1);
    step(&ctx).await;
    assert_eq!(status(&ctx).phase, Some(Phase::Building));

    remote.fail_with(Some(TransportError::new(Stage::Connect, "connection refused")));
    let s = step(&ctx).await;
    assert_eq!(s, Step { outcome: StepOutcome::ResolveFailed, requeue: Requeue::After(Duration::from_secs(60)) });
    assert_eq!(status(&ctx).phase, Some(Phase::Failed));

    // a second network failure leaves a non-building phase unchanged
    step(&ctx).await;
    assert_eq!(status(&ctx).phase, Some(Phase::Failed));
}

#[tokio::test]
async fn write_failures_surface_as_step_errors() {
    let remote = FakeRemote::new(vec![RemoteRef::new("refs/heads/main", SHA)]);
    let ctx = context(&remote);
    seed_app(&ctx, 1);
    ctx.cluster.fail_writes(true);
    let app: KeelApp = ctx.cluster.object(NS, "demo").unwrap();
    assert!(run_step(&app, &ctx, &StepContext::new("demo", NS)).await.is_err());
    assert!(status(&ctx).phase.is_none());
}
