//! Brings the workload objects of one application to their desired shape with
//! the fewest writes: create when absent, replace only when a governed field
//! differs, leave everything else alone.
pub mod addons;
pub mod deployment;
pub mod ingress;
pub mod quantity;
pub mod service;
pub mod volumes;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::cluster::{Cluster, Managed};
use crate::config::OperatorConfig;
use crate::crd::KeelApp;
use crate::error::{Error, Result};
use crate::logging::StepContext;
use crate::telemetry::CONVERGE_WRITES_TOTAL;

pub const APP_LABEL: &str = "keel.dev/app";
pub const COMMIT_LABEL: &str = "keel.dev/commit";
pub const VOLUME_LABEL: &str = "keel.dev/volume";
pub const ADDON_LABEL: &str = "keel.dev/addon";
/// Pod selector label shared by the Deployment and Service.
pub const SELECTOR_LABEL: &str = "app";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Mutating API calls issued during this pass.
    pub writes: usize,
    pub ready_replicas: i32,
    pub desired_replicas: i32,
    pub service_type: Option<String>,
    pub ingress_host: Option<String>,
    pub app_url: String,
}

/// Everything the per-kind builders need to derive desired objects.
pub struct Desired<'a> {
    pub app: &'a KeelApp,
    pub name: String,
    pub namespace: String,
    pub image: &'a str,
    pub config: &'a OperatorConfig,
}

impl<'a> Desired<'a> {
    pub fn new(app: &'a KeelApp, image: &'a str, config: &'a OperatorConfig) -> Result<Self> {
        let namespace = app.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        Ok(Self { app, name: app.name_any(), namespace, image, config })
    }

    pub fn owner(&self) -> Result<OwnerReference> {
        self.app.controller_owner_ref(&()).ok_or(Error::MissingObjectKey("metadata.uid"))
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL.to_string(), self.name.clone()), (SELECTOR_LABEL.to_string(), self.name.clone())])
    }

    pub fn selector(&self) -> BTreeMap<String, String> { BTreeMap::from([(SELECTOR_LABEL.to_string(), self.name.clone())]) }
}

/// Result of [`ensure`]: the object as it now exists and whether a write happened.
pub struct Ensured<K> { pub object: K, pub written: bool }

/// Create-or-update with a caller supplied diff. `update` returns the object
/// to write (observed with governed fields replaced) or `None` when equal.
pub async fn ensure<C, K>(cluster: &C, step: &StepContext, ns: &str, desired: K, update: impl FnOnce(&K, &K) -> Option<K> + Send) -> Result<Ensured<K>>
where
    C: Cluster,
    K: Managed,
{
    let kind = K::kind(&()).into_owned();
    let name = desired.name_any();
    match cluster.get::<K>(ns, &name).await? {
        None => match cluster.create(ns, &desired).await {
            Ok(object) => {
                info!(parent: &step.span, %kind, %name, "converge.created");
                CONVERGE_WRITES_TOTAL.with_label_values(&[kind.as_str()]).inc();
                Ok(Ensured { object, written: true })
            }
            Err(Error::AlreadyExists { .. }) => {
                // lost a create race; the winner's object is authoritative for this pass
                let object = cluster.get::<K>(ns, &name).await?.ok_or(Error::Conflict { kind, name })?;
                Ok(Ensured { object, written: false })
            }
            Err(e) => Err(e),
        },
        Some(observed) => match update(&desired, &observed) {
            None => {
                debug!(parent: &step.span, %kind, %name, "converge.unchanged");
                Ok(Ensured { object: observed, written: false })
            }
            Some(mut next) => {
                next.meta_mut().resource_version = observed.meta().resource_version.clone();
                let object = cluster.replace(ns, &next).await?;
                info!(parent: &step.span, %kind, %name, "converge.updated");
                CONVERGE_WRITES_TOTAL.with_label_values(&[kind.as_str()]).inc();
                Ok(Ensured { object, written: true })
            }
        },
    }
}

/// Whether `meta` carries an owner reference to this application's uid.
pub fn owned_by(meta: &ObjectMeta, app: &KeelApp) -> bool {
    let Some(uid) = app.uid() else { return false };
    meta.owner_references.iter().flatten().any(|o| o.uid == uid)
}

/// Creates `desired` only when absent. Existing objects are never touched.
pub async fn ensure_exists<C: Cluster, K: Managed>(cluster: &C, step: &StepContext, ns: &str, desired: K) -> Result<Ensured<K>> {
    ensure(cluster, step, ns, desired, |_, _| None).await
}

pub async fn remove<C: Cluster, K: Managed>(cluster: &C, step: &StepContext, ns: &str, name: &str) -> Result<bool> {
    let kind = K::kind(&()).into_owned();
    if cluster.get::<K>(ns, name).await?.is_none() { return Ok(false); }
    cluster.delete::<K>(ns, name).await?;
    info!(parent: &step.span, %kind, %name, "converge.deleted");
    CONVERGE_WRITES_TOTAL.with_label_values(&[kind.as_str()]).inc();
    Ok(true)
}

/// Runs every kind in dependency order: addon secrets before the Deployment
/// that consumes them, the Service before the Ingress that routes to it.
pub async fn converge<C: Cluster>(cluster: &C, step: &StepContext, app: &KeelApp, image: &str, config: &OperatorConfig) -> Result<ConvergeReport> {
    let d = Desired::new(app, image, config)?;
    let mut writes = 0;

    writes += addons::converge(cluster, step, &d).await?;
    writes += volumes::converge(cluster, step, &d).await?;

    let dep = ensure(cluster, step, &d.namespace, deployment::desired(&d)?, deployment::update).await?;
    writes += usize::from(dep.written);

    let svc = ensure(cluster, step, &d.namespace, service::desired(&d)?, service::update).await?;
    writes += usize::from(svc.written);

    writes += ingress::converge(cluster, step, &d).await?;

    let report = ConvergeReport {
        writes,
        ready_replicas: dep.object.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
        desired_replicas: app.spec.desired_replicas(),
        service_type: svc.object.spec.as_ref().and_then(|s| s.type_.clone()),
        ingress_host: app.spec.ingresses.first().map(|r| r.host.clone()),
        app_url: app_url(app, &d.namespace),
    };
    debug!(parent: &step.span, writes = report.writes, ready = report.ready_replicas, "converge.done");
    Ok(report)
}

/// First ingress host (https when it terminates TLS), else the in-cluster service address.
pub fn app_url(app: &KeelApp, ns: &str) -> String {
    match app.spec.ingresses.first() {
        Some(rule) if rule.tls => format!("https://{}", rule.host),
        Some(rule) => format!("http://{}", rule.host),
        None => format!("http://{}.{ns}.svc.cluster.local", app.name_any()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::IngressRuleConfig;
    use crate::test_support::{keel_app, spec};

    #[test]
    fn app_url_prefers_first_ingress_host() {
        let mut s = spec("https://github.com/x/y", "x/y");
        let app = keel_app("demo", "apps", s.clone());
        assert_eq!(app_url(&app, "apps"), "http://demo.apps.svc.cluster.local");
        s.ingresses = vec![IngressRuleConfig { host: "demo.example.com".into(), path: None, service_port: 80, tls: true }];
        assert_eq!(app_url(&keel_app("demo", "apps", s), "apps"), "https://demo.example.com");
    }
}
