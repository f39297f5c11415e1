//! Where the receiver finds applications and how it pokes them.
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use keel_operator::crd::TRIGGER_ANNOTATION;
use keel_operator::KeelApp;
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, ResourceExt,
};

#[async_trait]
pub trait AppDirectory: Send + Sync + 'static {
    /// Every application in every namespace.
    async fn list(&self) -> anyhow::Result<Vec<KeelApp>>;
    /// Stamps the trigger annotation so the controller schedules a step.
    async fn trigger(&self, app: &KeelApp, at: DateTime<Utc>) -> anyhow::Result<()>;
}

pub fn trigger_value(at: DateTime<Utc>) -> String { at.to_rfc3339_opts(SecondsFormat::Secs, true) }

#[derive(Clone)]
pub struct KubeDirectory { client: Client }

impl KubeDirectory {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl AppDirectory for KubeDirectory {
    async fn list(&self) -> anyhow::Result<Vec<KeelApp>> {
        Ok(Api::<KeelApp>::all(self.client.clone()).list(&ListParams::default()).await?.items)
    }

    async fn trigger(&self, app: &KeelApp, at: DateTime<Utc>) -> anyhow::Result<()> {
        let ns = app.namespace().unwrap_or_default();
        let api: Api<KeelApp> = Api::namespaced(self.client.clone(), &ns);
        let patch = serde_json::json!({"metadata": {"annotations": {TRIGGER_ANNOTATION: trigger_value(at)}}});
        api.patch(&app.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}
