use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use std::collections::BTreeMap;

use super::{deployment::DEFAULT_CONTAINER_PORT, Desired};
use crate::error::Result;

pub const SERVICE_TYPE: &str = "ClusterIP";

pub fn desired(d: &Desired<'_>) -> Result<Service> {
    let ports = if d.app.spec.ports.is_empty() {
        vec![ServicePort { name: Some("http".into()), port: 80, target_port: Some(IntOrString::Int(DEFAULT_CONTAINER_PORT)), protocol: Some("TCP".into()), ..Default::default() }]
    } else {
        d.app
            .spec
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| ServicePort {
                name: Some(p.name.clone().unwrap_or_else(|| if i == 0 { "http".into() } else { format!("port-{i}") })),
                port: p.port,
                target_port: Some(IntOrString::Int(p.target_port)),
                protocol: Some(p.protocol.as_str().into()),
                ..Default::default()
            })
            .collect()
    };
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(d.name.clone()),
            namespace: Some(d.namespace.clone()),
            labels: Some(d.labels()),
            owner_references: Some(vec![d.owner()?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec { type_: Some(SERVICE_TYPE.into()), selector: Some(d.selector()), ports: Some(ports), ..Default::default() }),
        ..Default::default()
    })
}

#[derive(Debug, PartialEq)]
struct Governed {
    type_: String,
    selector: BTreeMap<String, String>,
    ports: Vec<(Option<String>, i32, String, String)>,
}

fn governed(svc: &Service) -> Governed {
    let spec = svc.spec.clone().unwrap_or_default();
    let mut ports: Vec<_> = spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| {
            let target = match p.target_port {
                Some(IntOrString::Int(i)) => i.to_string(),
                Some(IntOrString::String(s)) => s,
                // the API server defaults targetPort to port
                None => p.port.to_string(),
            };
            (p.name, p.port, target, p.protocol.unwrap_or_else(|| "TCP".into()))
        })
        .collect();
    ports.sort();
    Governed { type_: spec.type_.unwrap_or_else(|| SERVICE_TYPE.into()), selector: spec.selector.unwrap_or_default(), ports }
}

/// Replaces type, selector and ports; cluster IPs and node ports assigned by
/// the API server are kept.
pub fn update(desired: &Service, observed: &Service) -> Option<Service> {
    if governed(desired) == governed(observed) { return None; }
    let mut next = observed.clone();
    let want = desired.spec.clone().unwrap_or_default();
    let spec = next.spec.get_or_insert_with(ServiceSpec::default);
    spec.type_ = want.type_;
    spec.selector = want.selector;
    spec.ports = want.ports;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::test_support::{keel_app, spec};

    fn build() -> Service {
        let app = keel_app("demo", "apps", spec("https://github.com/x/y", "x/y"));
        let cfg = OperatorConfig::default();
        desired(&Desired::new(&app, "img", &cfg).unwrap()).unwrap()
    }

    #[test]
    fn defaults_to_http_80_to_8080() {
        let svc = build();
        let p = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!((p.port, p.target_port.clone()), (80, Some(IntOrString::Int(8080))));
    }

    #[test]
    fn server_assigned_fields_are_not_drift() {
        let want = build();
        let mut seen = want.clone();
        let spec = seen.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.0.0.12".into());
        spec.session_affinity = Some("None".into());
        assert!(update(&want, &seen).is_none());

        spec_mut(&mut seen).selector = Some(BTreeMap::from([("app".into(), "other".into())]));
        let next = update(&want, &seen).unwrap();
        assert_eq!(next.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("10.0.0.12"));
        assert_eq!(next.spec.unwrap().selector, want.spec.unwrap().selector);
    }

    fn spec_mut(svc: &mut Service) -> &mut ServiceSpec { svc.spec.as_mut().unwrap() }
}
