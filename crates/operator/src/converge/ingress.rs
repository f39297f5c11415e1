use k8s_openapi::{
    api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec, IngressTLS,
        ServiceBackendPort,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::{ensure, owned_by, remove, Desired};
use crate::cluster::Cluster;
use crate::error::Result;
use crate::logging::StepContext;

pub const ISSUER_ANNOTATION: &str = "cert-manager.io/issuer";

/// cert-manager namespaced `Issuer`. Only existence is checked; fields stay opaque.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default)]
#[kube(group = "cert-manager.io", version = "v1", kind = "Issuer", namespaced, schema = "disabled")]
pub struct IssuerSpec {
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// `<app>-<host with dots as dashes>-tls`
pub fn tls_secret_name(app: &str, host: &str) -> String { format!("{app}-{}-tls", host.replace('.', "-")) }

/// `issuer` is the annotation value to set, already checked for existence.
pub fn desired(d: &Desired<'_>, issuer: Option<&str>) -> Result<Ingress> {
    let rules_cfg = &d.app.spec.ingresses;
    // one rule per host, paths in declaration order
    let mut by_host: Vec<(String, Vec<HTTPIngressPath>)> = Vec::new();
    for r in rules_cfg {
        let path = HTTPIngressPath {
            path: Some(r.path.clone().filter(|p| !p.is_empty()).unwrap_or_else(|| "/".into())),
            path_type: "Prefix".into(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend { name: d.name.clone(), port: Some(ServiceBackendPort { number: Some(r.service_port), name: None }) }),
                resource: None,
            },
        };
        match by_host.iter_mut().find(|(h, _)| *h == r.host) {
            Some((_, paths)) => paths.push(path),
            None => by_host.push((r.host.clone(), vec![path])),
        }
    }
    let rules = by_host
        .into_iter()
        .map(|(host, paths)| IngressRule { host: Some(host), http: Some(HTTPIngressRuleValue { paths }) })
        .collect();

    let mut tls_hosts: Vec<&str> = Vec::new();
    for r in rules_cfg.iter().filter(|r| r.tls) {
        if !tls_hosts.contains(&r.host.as_str()) { tls_hosts.push(&r.host); }
    }
    let tls: Vec<IngressTLS> = tls_hosts
        .into_iter()
        .map(|h| IngressTLS { hosts: Some(vec![h.to_string()]), secret_name: Some(tls_secret_name(&d.name, h)) })
        .collect();

    let annotations = issuer.map(|i| BTreeMap::from([(ISSUER_ANNOTATION.to_string(), i.to_string())]));
    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(d.name.clone()),
            namespace: Some(d.namespace.clone()),
            labels: Some(d.labels()),
            annotations,
            owner_references: Some(vec![d.owner()?]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(d.config.ingress_class.clone()),
            rules: Some(rules),
            tls: (!tls.is_empty()).then_some(tls),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn issuer_annotation(i: &Ingress) -> Option<String> {
    i.metadata.annotations.as_ref().and_then(|a| a.get(ISSUER_ANNOTATION).cloned())
}

fn governed(i: &Ingress) -> (Option<String>, Option<Vec<IngressRule>>, Option<Vec<IngressTLS>>, Option<String>) {
    let spec = i.spec.clone().unwrap_or_default();
    (spec.ingress_class_name, spec.rules, spec.tls.filter(|t| !t.is_empty()), issuer_annotation(i))
}

/// Spec fields and our issuer annotation are governed; other annotations are left as found.
pub fn update(desired: &Ingress, observed: &Ingress) -> Option<Ingress> {
    if governed(desired) == governed(observed) { return None; }
    let mut next = observed.clone();
    let want = desired.spec.clone().unwrap_or_default();
    let spec = next.spec.get_or_insert_with(IngressSpec::default);
    spec.ingress_class_name = want.ingress_class_name;
    spec.rules = want.rules;
    spec.tls = want.tls;
    match issuer_annotation(desired) {
        Some(v) => {
            next.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(ISSUER_ANNOTATION.into(), v);
        }
        None => {
            if let Some(a) = next.metadata.annotations.as_mut() { a.remove(ISSUER_ANNOTATION); }
        }
    }
    Some(next)
}

/// Ensures the Ingress, or deletes it when no rules are declared. Returns the write count.
pub async fn converge<C: Cluster>(cluster: &C, step: &StepContext, d: &Desired<'_>) -> Result<usize> {
    let spec = &d.app.spec;
    if spec.ingresses.is_empty() {
        let Some(existing) = cluster.get::<Ingress>(&d.namespace, &d.name).await? else { return Ok(0) };
        if !owned_by(&existing.metadata, d.app) {
            warn!(parent: &step.span, ingress=%d.name, "converge.ingress.not_owned");
            return Ok(0);
        }
        return Ok(usize::from(remove::<C, Ingress>(cluster, step, &d.namespace, &d.name).await?));
    }
    let mut issuer = None;
    if spec.ingresses.iter().any(|r| r.tls) {
        let name = spec.tls.issuer.clone().unwrap_or_else(|| d.config.default_issuer.clone());
        if cluster.get::<Issuer>(&d.namespace, &name).await?.is_some() {
            issuer = Some(name);
        } else {
            warn!(parent: &step.span, issuer=%name, "converge.ingress.issuer_missing");
        }
    }
    let written = ensure(cluster, step, &d.namespace, desired(d, issuer.as_deref())?, update).await?.written;
    Ok(usize::from(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::crd::IngressRuleConfig;
    use crate::test_support::{keel_app, spec, FakeCluster};

    fn rule(host: &str, path: Option<&str>, tls: bool) -> IngressRuleConfig {
        IngressRuleConfig { host: host.into(), path: path.map(Into::into), service_port: 80, tls }
    }

    fn build(rules: Vec<IngressRuleConfig>, issuer: Option<&str>) -> Ingress {
        let mut s = spec("https://github.com/x/y", "x/y");
        s.ingresses = rules;
        let app = keel_app("demo", "apps", s);
        let cfg = OperatorConfig::default();
        desired(&Desired::new(&app, "img", &cfg).unwrap(), issuer).unwrap()
    }

    #[test]
    fn groups_paths_by_host_and_names_tls_secrets() {
        let ing = build(vec![rule("a.example.com", None, true), rule("a.example.com", Some("/api"), true), rule("b.example.com", None, false)], Some("le"));
        let spec = ing.spec.clone().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rules = spec.rules.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].http.as_ref().unwrap().paths.len(), 2);
        let tls = spec.tls.unwrap();
        assert_eq!(tls.len(), 1);
        assert_eq!(tls[0].secret_name.as_deref(), Some("demo-a-example-com-tls"));
        assert_eq!(issuer_annotation(&ing).as_deref(), Some("le"));
    }

    #[test]
    fn foreign_annotations_survive_updates() {
        let want = build(vec![rule("a.example.com", None, false)], None);
        let mut seen = want.clone();
        seen.metadata.annotations = Some(BTreeMap::from([("nginx.ingress.kubernetes.io/proxy-body-size".into(), "8m".into())]));
        assert!(update(&want, &seen).is_none());

        let want = build(vec![rule("a.example.com", None, true)], Some("le"));
        let next = update(&want, &seen).unwrap();
        let annotations = next.metadata.annotations.unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[ISSUER_ANNOTATION], "le");
    }

    #[tokio::test]
    async fn removing_rules_deletes_only_an_owned_ingress() {
        let cfg = OperatorConfig::default();
        let step = StepContext::new("demo", "apps");
        let app = keel_app("demo", "apps", spec("https://github.com/x/y", "x/y"));
        let d = Desired::new(&app, "img", &cfg).unwrap();

        let cluster = FakeCluster::new();
        cluster.seed("apps", &Ingress { metadata: ObjectMeta { name: Some("demo".into()), ..Default::default() }, ..Default::default() });
        assert_eq!(converge(&cluster, &step, &d).await.unwrap(), 0);
        assert!(cluster.object::<Ingress>("apps", "demo").is_some());

        let owned = Ingress {
            metadata: ObjectMeta { name: Some("demo".into()), owner_references: Some(vec![d.owner().unwrap()]), ..Default::default() },
            ..Default::default()
        };
        cluster.seed("apps", &owned);
        assert_eq!(converge(&cluster, &step, &d).await.unwrap(), 1);
        assert!(cluster.object::<Ingress>("apps", "demo").is_none());
    }
}
