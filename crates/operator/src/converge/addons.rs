//! Backing services (databases, caches) declared on an application. Each
//! addon gets a Deployment, a Service, a data claim and a connection Secret
//! the application consumes through `envFrom`. All four are created once and
//! then left alone; undeclared addons are torn down.
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvFromSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
            PodSpec, PodTemplateSpec, ResourceRequirements, Secret, SecretEnvSource, Service, ServicePort, ServiceSpec, Volume,
            VolumeMount, VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::ResourceExt;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{ensure_exists, remove, Desired, ADDON_LABEL, APP_LABEL, SELECTOR_LABEL};
use crate::cluster::Cluster;
use crate::crd::{AddonConfig, AddonKind, AddonSize};
use crate::error::Result;
use crate::logging::StepContext;

/// Fixed per-kind parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddonProfile {
    pub image: &'static str,
    pub port: i32,
    /// Connection string key exposed to the application.
    pub url_key: &'static str,
    pub data_path: &'static str,
}

pub fn profile(kind: AddonKind) -> AddonProfile {
    match kind {
        AddonKind::Postgres => AddonProfile { image: "postgres:16-alpine", port: 5432, url_key: "DATABASE_URL", data_path: "/var/lib/postgresql/data" },
        AddonKind::Redis => AddonProfile { image: "redis:7-alpine", port: 6379, url_key: "REDIS_URL", data_path: "/data" },
    }
}

/// `(cpu limit, memory limit, storage)` per size.
pub fn size_profile(size: AddonSize) -> (&'static str, &'static str, &'static str) {
    match size {
        AddonSize::Small => ("250m", "256Mi", "1Gi"),
        AddonSize::Medium => ("500m", "512Mi", "5Gi"),
        AddonSize::Large => ("1", "1Gi", "10Gi"),
    }
}

pub fn addon_name(app: &str, addon: &str) -> String { format!("{app}-{addon}") }
pub fn connection_secret_name(app: &str, addon: &str) -> String { format!("{app}-{addon}-conn") }
fn data_claim_name(app: &str, addon: &str) -> String { format!("{app}-{addon}-data") }

fn meta(d: &Desired<'_>, addon: &AddonConfig, name: String) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(d.namespace.clone()),
        labels: Some(BTreeMap::from([
            (APP_LABEL.to_string(), d.name.clone()),
            (ADDON_LABEL.to_string(), addon.name.clone()),
            (SELECTOR_LABEL.to_string(), addon_name(&d.name, &addon.name)),
        ])),
        owner_references: Some(vec![d.owner()?]),
        ..Default::default()
    })
}

/// Credentials are generated here, so this must only be used for creation.
pub fn connection_secret(d: &Desired<'_>, addon: &AddonConfig) -> Result<Secret> {
    let host = addon_name(&d.name, &addon.name);
    let p = profile(addon.kind);
    let data: BTreeMap<String, String> = match addon.kind {
        AddonKind::Postgres => {
            let password = Uuid::new_v4().simple().to_string();
            let user = "app";
            BTreeMap::from([
                ("POSTGRES_USER".to_string(), user.to_string()),
                ("POSTGRES_PASSWORD".to_string(), password.clone()),
                ("POSTGRES_DB".to_string(), user.to_string()),
                (p.url_key.to_string(), format!("postgres://{user}:{password}@{host}:{}/{user}?sslmode=disable", p.port)),
            ])
        }
        AddonKind::Redis => BTreeMap::from([(p.url_key.to_string(), format!("redis://{host}:{}", p.port))]),
    };
    Ok(Secret { metadata: meta(d, addon, connection_secret_name(&d.name, &addon.name))?, string_data: Some(data), ..Default::default() })
}

pub fn deployment(d: &Desired<'_>, addon: &AddonConfig) -> Result<Deployment> {
    let name = addon_name(&d.name, &addon.name);
    let p = profile(addon.kind);
    let (cpu, memory, _) = size_profile(addon.size);
    let selector = BTreeMap::from([(SELECTOR_LABEL.to_string(), name.clone())]);
    let env_from = match addon.kind {
        AddonKind::Postgres => Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource { name: connection_secret_name(&d.name, &addon.name), optional: None }),
            ..Default::default()
        }]),
        AddonKind::Redis => None,
    };
    let container = Container {
        name: addon_kind_label(addon.kind).into(),
        image: Some(p.image.into()),
        ports: Some(vec![ContainerPort { container_port: p.port, ..Default::default() }]),
        env_from,
        volume_mounts: Some(vec![VolumeMount { name: "data".into(), mount_path: p.data_path.into(), sub_path: Some("data".into()), ..Default::default() }]),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([("cpu".into(), Quantity(cpu.into())), ("memory".into(), Quantity(memory.into()))])),
            ..Default::default()
        }),
        ..Default::default()
    };
    let meta = meta(d, addon, name.clone())?;
    Ok(Deployment {
        metadata: meta.clone(),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(k8s_openapi::api::apps::v1::DeploymentStrategy { type_: Some("Recreate".into()), rolling_update: None }),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: meta.labels, ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "data".into(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: data_claim_name(&d.name, &addon.name), read_only: None }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn service(d: &Desired<'_>, addon: &AddonConfig) -> Result<Service> {
    let name = addon_name(&d.name, &addon.name);
    let p = profile(addon.kind);
    Ok(Service {
        metadata: meta(d, addon, name.clone())?,
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(SELECTOR_LABEL.to_string(), name)])),
            ports: Some(vec![ServicePort { port: p.port, target_port: Some(IntOrString::Int(p.port)), ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn data_claim(d: &Desired<'_>, addon: &AddonConfig) -> Result<PersistentVolumeClaim> {
    let (_, _, storage) = size_profile(addon.size);
    Ok(PersistentVolumeClaim {
        metadata: meta(d, addon, data_claim_name(&d.name, &addon.name))?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(storage.into()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn addon_kind_label(kind: AddonKind) -> &'static str {
    match kind { AddonKind::Postgres => "postgres", AddonKind::Redis => "redis" }
}

pub async fn converge<C: Cluster>(cluster: &C, step: &StepContext, d: &Desired<'_>) -> Result<usize> {
    let ns = &d.namespace;
    let mut writes = 0;
    for addon in &d.app.spec.addons {
        // the password is minted only when the secret does not exist yet
        if cluster.get::<Secret>(ns, &connection_secret_name(&d.name, &addon.name)).await?.is_none() {
            writes += usize::from(ensure_exists(cluster, step, ns, connection_secret(d, addon)?).await?.written);
        }
        writes += usize::from(ensure_exists(cluster, step, ns, data_claim(d, addon)?).await?.written);
        writes += usize::from(ensure_exists(cluster, step, ns, deployment(d, addon)?).await?.written);
        writes += usize::from(ensure_exists(cluster, step, ns, service(d, addon)?).await?.written);
    }

    let selector = format!("{APP_LABEL}={},{ADDON_LABEL}", d.name);
    for dep in cluster.list::<Deployment>(ns, &selector).await? {
        let Some(addon) = dep.labels().get(ADDON_LABEL).cloned() else { continue };
        if d.app.spec.addons.iter().any(|a| a.name == addon) { continue; }
        let name = addon_name(&d.name, &addon);
        writes += usize::from(remove::<C, Deployment>(cluster, step, ns, &name).await?);
        writes += usize::from(remove::<C, Service>(cluster, step, ns, &name).await?);
        writes += usize::from(remove::<C, Secret>(cluster, step, ns, &connection_secret_name(&d.name, &addon)).await?);
        writes += usize::from(remove::<C, PersistentVolumeClaim>(cluster, step, ns, &data_claim_name(&d.name, &addon)).await?);
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::test_support::{keel_app, spec, FakeCluster};

    fn pg() -> AddonConfig { AddonConfig { kind: AddonKind::Postgres, name: "db".into(), size: AddonSize::Small } }

    #[test]
    fn postgres_connection_url_points_at_addon_service() {
        let mut s = spec("https://github.com/x/y", "x/y");
        s.addons = vec![pg()];
        let app = keel_app("demo", "apps", s);
        let cfg = OperatorConfig::default();
        let d = Desired::new(&app, "img", &cfg).unwrap();
        let secret = connection_secret(&d, &pg()).unwrap();
        let data = secret.string_data.unwrap();
        let url = &data["DATABASE_URL"];
        assert!(url.starts_with("postgres://app:"));
        assert!(url.contains("@demo-db:5432/app"));
        assert_eq!(secret.metadata.name.as_deref(), Some("demo-db-conn"));
    }

    #[tokio::test]
    async fn created_once_then_left_alone() {
        let cluster = FakeCluster::new();
        let mut s = spec("https://github.com/x/y", "x/y");
        s.addons = vec![pg()];
        let app = keel_app("demo", "apps", s);
        let cfg = OperatorConfig::default();
        let d = Desired::new(&app, "img", &cfg).unwrap();
        let step = StepContext::new("demo", "apps");
        assert_eq!(converge(&cluster, &step, &d).await.unwrap(), 4);
        let password = cluster.object::<Secret>("apps", "demo-db-conn").unwrap().string_data.unwrap()["POSTGRES_PASSWORD"].clone();
        assert_eq!(converge(&cluster, &step, &d).await.unwrap(), 0);
        let again = cluster.object::<Secret>("apps", "demo-db-conn").unwrap().string_data.unwrap()["POSTGRES_PASSWORD"].clone();
        assert_eq!(password, again);
    }

    #[tokio::test]
    async fn undeclared_addons_are_removed() {
        let cluster = FakeCluster::new();
        let mut s = spec("https://github.com/x/y", "x/y");
        s.addons = vec![pg(), AddonConfig { kind: AddonKind::Redis, name: "cache".into(), size: AddonSize::Medium }];
        let app = keel_app("demo", "apps", s.clone());
        let cfg = OperatorConfig::default();
        let step = StepContext::new("demo", "apps");
        converge(&cluster, &step, &Desired::new(&app, "img", &cfg).unwrap()).await.unwrap();

        s.addons.truncate(1);
        let app = keel_app("demo", "apps", s);
        assert_eq!(converge(&cluster, &step, &Desired::new(&app, "img", &cfg).unwrap()).await.unwrap(), 4);
        assert!(cluster.object::<Deployment>("apps", "demo-cache").is_none());
        assert!(cluster.object::<Deployment>("apps", "demo-db").is_some());
    }
}
