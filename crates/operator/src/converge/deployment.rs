use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Capabilities, Container, ContainerPort, EnvFromSource, EnvVar, HTTPGetAction, LocalObjectReference,
            PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
            SecretEnvSource, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use std::collections::BTreeMap;

use super::{addons, quantity, Desired};
use crate::crd::{HealthCheckConfig, KeelAppSpec};
use crate::error::{Error, Result};

pub const CONTAINER_NAME: &str = "app";
pub const DEFAULT_CONTAINER_PORT: i32 = 8080;
const RUN_AS: i64 = 1000;

pub fn secret_volume_name(secret: &str) -> String { format!("secret-{secret}") }

/// Rejects shapes the API server would refuse or silently collapse: port
/// numbers outside 1..=65535 and volume names used twice.
fn validate(spec: &KeelAppSpec) -> Result<()> {
    let valid = 1..=65535;
    if let Some(p) = spec.ports.iter().find(|p| !valid.contains(&p.port) || !valid.contains(&p.target_port)) {
        return Err(Error::Invalid(format!("port {}->{} out of range", p.port, p.target_port)));
    }
    if let Some(port) = spec.health_check.as_ref().and_then(|h| h.port).filter(|p| !valid.contains(p)) {
        return Err(Error::Invalid(format!("health check port {port} out of range")));
    }
    let mut names: Vec<String> = spec.volumes.iter().map(|v| v.name.clone()).collect();
    names.extend(spec.secret_mounts.iter().map(|m| secret_volume_name(&m.secret_name)));
    names.sort();
    if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::Invalid(format!("volume {} declared twice", w[0])));
    }
    Ok(())
}

pub fn desired(d: &Desired<'_>) -> Result<Deployment> {
    let spec = &d.app.spec;
    validate(spec)?;
    let ports: Vec<ContainerPort> = if spec.ports.is_empty() {
        vec![ContainerPort { name: Some("http".into()), container_port: DEFAULT_CONTAINER_PORT, protocol: Some("TCP".into()), ..Default::default() }]
    } else {
        spec.ports
            .iter()
            .map(|p| ContainerPort { name: p.name.clone(), container_port: p.target_port, protocol: Some(p.protocol.as_str().into()), ..Default::default() })
            .collect()
    };
    let check_port = spec.ports.first().map(|p| p.target_port).unwrap_or(DEFAULT_CONTAINER_PORT);

    let env: Vec<EnvVar> = spec.env.iter().map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() }).collect();
    let env_from: Vec<EnvFromSource> = spec
        .secret_refs
        .iter()
        .cloned()
        .chain(spec.addons.iter().map(|a| addons::connection_secret_name(&d.name, &a.name)))
        .map(|name| EnvFromSource { secret_ref: Some(SecretEnvSource { name, optional: None }), ..Default::default() })
        .collect();

    let mut mounts = Vec::new();
    let mut volumes = Vec::new();
    for v in &spec.volumes {
        mounts.push(VolumeMount { name: v.name.clone(), mount_path: v.mount_path.clone(), ..Default::default() });
        volumes.push(Volume {
            name: v.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: super::volumes::claim_name(&d.name, &v.name), read_only: None }),
            ..Default::default()
        });
    }
    for s in &spec.secret_mounts {
        let name = secret_volume_name(&s.secret_name);
        mounts.push(VolumeMount { name: name.clone(), mount_path: s.mount_path.clone(), read_only: Some(true), ..Default::default() });
        volumes.push(Volume { name, secret: Some(SecretVolumeSource { secret_name: Some(s.secret_name.clone()), ..Default::default() }), ..Default::default() });
    }

    let check = spec.health_check.as_ref().map(|hc| http_check(hc, check_port));
    let container = Container {
        name: CONTAINER_NAME.into(),
        image: Some(d.image.to_string()),
        ports: Some(ports),
        env: (!env.is_empty()).then_some(env),
        env_from: (!env_from.is_empty()).then_some(env_from),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        resources: Some(resources(&d.app.spec.resources)?),
        liveness_probe: check.clone(),
        readiness_probe: check,
        security_context: Some(container_security()),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(d.name.clone()),
            namespace: Some(d.namespace.clone()),
            labels: Some(d.labels()),
            owner_references: Some(vec![d.owner()?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.desired_replicas()),
            selector: LabelSelector { match_labels: Some(d.selector()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(d.labels()), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    security_context: Some(pod_security()),
                    image_pull_secrets: spec.registry_secret_ref.as_ref().map(|s| vec![LocalObjectReference { name: s.clone() }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Liveness and readiness share one HTTP health check.
fn http_check(hc: &HealthCheckConfig, default_port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction { path: Some(hc.path.clone()), port: IntOrString::Int(hc.port.unwrap_or(default_port)), ..Default::default() }),
        initial_delay_seconds: Some(hc.initial_delay.unwrap_or(10)),
        timeout_seconds: Some(hc.timeout.unwrap_or(5)),
        period_seconds: Some(10),
        ..Default::default()
    }
}

pub const DEFAULT_CPU: &str = "500m";
pub const DEFAULT_MEMORY: &str = "1Gi";

/// Limits as declared (or defaulted); requests at a quarter of the CPU and
/// half of the memory limit.
fn resources(cfg: &crate::crd::ResourceConfig) -> Result<ResourceRequirements> {
    let cpu = cfg.cpu.as_deref().unwrap_or(DEFAULT_CPU);
    let mem = cfg.memory.as_deref().unwrap_or(DEFAULT_MEMORY);
    let mut limits = BTreeMap::from([("cpu".to_string(), Quantity(cpu.into())), ("memory".to_string(), Quantity(mem.into()))]);
    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(quantity::scaled(cpu, 1, 4)?)),
        ("memory".to_string(), Quantity(quantity::scaled(mem, 1, 2)?)),
    ]);
    if let Some(storage) = &cfg.storage {
        quantity::parse_quantity(storage)?;
        limits.insert("ephemeral-storage".to_string(), Quantity(storage.clone()));
    }
    Ok(ResourceRequirements { limits: Some(limits), requests: Some(requests), ..Default::default() })
}

fn pod_security() -> PodSecurityContext {
    PodSecurityContext { run_as_non_root: Some(true), run_as_user: Some(RUN_AS), fs_group: Some(RUN_AS), ..Default::default() }
}

fn container_security() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(false),
        capabilities: Some(Capabilities { drop: Some(vec!["ALL".into()]), add: None }),
        ..Default::default()
    }
}

type CheckView = (Option<String>, String, Option<i32>, Option<i32>, Option<i32>);

/// The fields this reconciler owns, normalized so API-server defaulting and
/// equivalent quantity spellings do not register as drift.
#[derive(Debug, PartialEq)]
struct Governed {
    replicas: i32,
    image: Option<String>,
    ports: Vec<(i32, String, Option<String>)>,
    env: BTreeMap<String, Option<String>>,
    env_from: Vec<String>,
    mounts: Vec<(String, String, bool)>,
    volumes: Vec<(String, Option<String>, Option<String>)>,
    limits: BTreeMap<String, Option<i128>>,
    requests: BTreeMap<String, Option<i128>>,
    privilege_escalation: Option<bool>,
    read_only_root: Option<bool>,
    dropped_caps: Vec<String>,
    pod_security: (Option<bool>, Option<i64>, Option<i64>),
    liveness: Option<CheckView>,
    readiness: Option<CheckView>,
    pull_secrets: Vec<String>,
}

fn quantities(map: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<String, Option<i128>> {
    map.into_iter().flatten().map(|(k, q)| (k.clone(), quantity::parse_quantity(&q.0).ok())).collect()
}

fn check_view(p: Option<&Probe>) -> Option<CheckView> {
    let p = p?;
    let get = p.http_get.as_ref();
    let port = match get.map(|g| &g.port) {
        Some(IntOrString::Int(i)) => i.to_string(),
        Some(IntOrString::String(s)) => s.clone(),
        None => String::new(),
    };
    Some((get.and_then(|g| g.path.clone()), port, p.initial_delay_seconds, p.timeout_seconds, p.period_seconds))
}

fn app_container(pod: &PodSpec) -> Option<&Container> {
    pod.containers.iter().find(|c| c.name == CONTAINER_NAME).or_else(|| pod.containers.first())
}

fn governed(dep: &Deployment) -> Option<Governed> {
    let spec = dep.spec.as_ref()?;
    let pod = spec.template.spec.as_ref()?;
    let c = app_container(pod)?;

    let mut ports: Vec<_> = c.ports.iter().flatten().map(|p| (p.container_port, p.protocol.clone().unwrap_or_else(|| "TCP".into()), p.name.clone())).collect();
    ports.sort();
    let mut mounts: Vec<_> = c.volume_mounts.iter().flatten().map(|m| (m.name.clone(), m.mount_path.clone(), m.read_only.unwrap_or(false))).collect();
    mounts.sort();
    let mut volumes: Vec<_> = pod
        .volumes
        .iter()
        .flatten()
        .map(|v| (v.name.clone(), v.persistent_volume_claim.as_ref().map(|c| c.claim_name.clone()), v.secret.as_ref().and_then(|s| s.secret_name.clone())))
        .collect();
    volumes.sort();
    let sc = c.security_context.as_ref();
    let psc = pod.security_context.as_ref();

    Some(Governed {
        replicas: spec.replicas.unwrap_or(1),
        image: c.image.clone(),
        ports,
        // the API server drops empty values, so "" and absent are the same
        env: c.env.iter().flatten().map(|e| (e.name.clone(), e.value.clone().filter(|v| !v.is_empty()))).collect(),
        env_from: c.env_from.iter().flatten().filter_map(|e| e.secret_ref.as_ref().map(|s| s.name.clone())).collect(),
        mounts,
        volumes,
        limits: quantities(c.resources.as_ref().and_then(|r| r.limits.as_ref())),
        requests: quantities(c.resources.as_ref().and_then(|r| r.requests.as_ref())),
        privilege_escalation: sc.and_then(|s| s.allow_privilege_escalation),
        read_only_root: sc.and_then(|s| s.read_only_root_filesystem),
        dropped_caps: sc.and_then(|s| s.capabilities.as_ref()).and_then(|c| c.drop.clone()).unwrap_or_default(),
        pod_security: (psc.and_then(|p| p.run_as_non_root), psc.and_then(|p| p.run_as_user), psc.and_then(|p| p.fs_group)),
        liveness: check_view(c.liveness_probe.as_ref()),
        readiness: check_view(c.readiness_probe.as_ref()),
        pull_secrets: pod.image_pull_secrets.iter().flatten().map(|s| s.name.clone()).collect(),
    })
}

/// `None` when the observed Deployment already matches on every governed
/// field. Otherwise the observed object with those fields overwritten.
pub fn update(desired: &Deployment, observed: &Deployment) -> Option<Deployment> {
    let want = governed(desired);
    if want.is_some() && want == governed(observed) { return None; }

    let mut next = observed.clone();
    let (Some(dspec), Some(nspec)) = (desired.spec.as_ref(), next.spec.as_mut()) else {
        next.spec = desired.spec.clone();
        return Some(next);
    };
    nspec.replicas = dspec.replicas;
    let (Some(dpod), Some(npod)) = (dspec.template.spec.as_ref(), nspec.template.spec.as_mut()) else {
        nspec.template = dspec.template.clone();
        return Some(next);
    };
    npod.volumes = dpod.volumes.clone();
    npod.security_context = dpod.security_context.clone();
    npod.image_pull_secrets = dpod.image_pull_secrets.clone();

    let Some(dc) = app_container(dpod) else { return Some(next) };
    let idx = npod.containers.iter().position(|c| c.name == CONTAINER_NAME).or(if npod.containers.is_empty() { None } else { Some(0) });
    match idx {
        Some(i) => {
            let c = &mut npod.containers[i];
            c.image = dc.image.clone();
            c.ports = dc.ports.clone();
            c.env = dc.env.clone();
            c.env_from = dc.env_from.clone();
            c.volume_mounts = dc.volume_mounts.clone();
            c.resources = dc.resources.clone();
            c.liveness_probe = dc.liveness_probe.clone();
            c.readiness_probe = dc.readiness_probe.clone();
            c.security_context = dc.security_context.clone();
        }
        None => npod.containers.push(dc.clone()),
    }
    Some(next)
}
