use futures_util::future::join_all;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use keel_operator::{
    build::{ensure_build, BuildState, JobParams},
    config::OperatorConfig,
    credentials::SourceSecrets,
    crd::BUILD_HISTORY_LIMIT,
    image::image_refs,
    logging::StepContext,
    reconciler::{run_step, Context, StepOutcome},
    test_support::{keel_app, spec, FakeCluster, FakeRemote},
    KeelApp,
};
use std::sync::Arc;

const NS: &str = "apps";

#[tokio::test]
async fn concurrent_submitters_create_one_job() {
    let cluster = FakeCluster::new();
    let cfg = OperatorConfig::default();
    let app = keel_app("demo", NS, spec("https://github.com/x/y", "x/y"));
    let commit = "abc1234def5678901234567890abcdef12345678";
    let images = image_refs(&app.spec.image_name, commit, &cfg.registry, false);
    let secrets = SourceSecrets::default();
    let params = JobParams { app: &app, commit, images: &images, secrets: &secrets, config: &cfg };
    let steps: Vec<StepContext> = (0..8).map(|_| StepContext::new("demo", NS)).collect();

    let results = join_all(steps.iter().map(|s| ensure_build(&cluster, s, &app, commit, &params))).await;
    let states: Vec<BuildState> = results.into_iter().map(|r| r.expect("ensure_build")).collect();

    assert_eq!(cluster.created::<Job>(), vec!["demo-build-abc1234".to_string()]);
    assert_eq!(states.iter().filter(|s| **s == BuildState::Submitted).count(), 1);
    assert_eq!(states.iter().filter(|s| **s == BuildState::Pending).count(), 7);
}

#[tokio::test]
async fn history_keeps_the_ten_most_recent_builds() {
    let remote = FakeRemote::new(vec![]);
    let ctx = Context { cluster: FakeCluster::new(), resolver: remote.resolver(), config: Arc::new(OperatorConfig::default()) };
    ctx.cluster.seed(NS, &keel_app("demo", NS, spec("https://github.com/x/y", "x/y")));

    let commits: Vec<String> = (0..12).map(|i| format!("{i:07x}{}", "0".repeat(33))).collect();
    for commit in &commits {
        remote.set_branch("main", commit);
        let app: KeelApp = ctx.cluster.object(NS, "demo").unwrap();
        assert_eq!(run_step(&app, &ctx, &StepContext::new("demo", NS)).await.unwrap().outcome, StepOutcome::BuildSubmitted);

        ctx.cluster.modify::<Job>(NS, &format!("demo-build-{}", &commit[..7]), |job| {
            job.status = Some(JobStatus {
                succeeded: Some(1),
                conditions: Some(vec![JobCondition { type_: "Complete".into(), status: "True".into(), ..Default::default() }]),
                ..Default::default()
            });
        });
        let app: KeelApp = ctx.cluster.object(NS, "demo").unwrap();
        assert_eq!(run_step(&app, &ctx, &StepContext::new("demo", NS)).await.unwrap().outcome, StepOutcome::BuildSucceeded);
    }

    let history = ctx.cluster.object::<KeelApp>(NS, "demo").unwrap().status.unwrap().build_history;
    assert_eq!(history.len(), BUILD_HISTORY_LIMIT);
    assert_eq!(history[0].commit_id, commits[11]);
    assert_eq!(history[9].commit_id, commits[2]);
}

