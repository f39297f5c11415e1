use keel_operator::crd::{AddonKind, SourceKind, UpdateKind};
use keel_operator::{KeelApp, KeelAppSpec, KeelAppStatus, Phase};
use kube::CustomResourceExt;
use serde_json::json;

#[test]
fn manifest_fields_use_camel_case_and_type_keys() {
    let spec: KeelAppSpec = serde_json::from_value(json!({
        "repoUrl": "git@github.com:x/y.git",
        "source": {"type": "tag", "value": "v1.2.0"},
        "imageName": "ghcr.io/x/y",
        "registrySecretRef": "ghcr-creds",
        "ports": [{"port": 80, "targetPort": 3000}],
        "healthCheck": {"path": "/healthz", "initialDelay": 5},
        "updateStrategy": {"type": "webhook"},
        "secretMounts": [{"secretName": "ca", "mountPath": "/etc/ca"}],
        "addons": [{"type": "redis", "name": "cache"}]
    }))
    .unwrap();

    assert_eq!(spec.source.kind, SourceKind::Tag);
    assert_eq!(spec.ports[0].target_port, 3000);
    assert_eq!(spec.health_check.as_ref().unwrap().initial_delay, Some(5));
    assert_eq!(spec.update_strategy.kind, UpdateKind::Webhook);
    assert_eq!(spec.update_strategy.interval, None);
    assert_eq!(spec.addons[0].kind, AddonKind::Redis);

    let out = serde_json::to_value(&spec).unwrap();
    assert_eq!(out["registrySecretRef"], "ghcr-creds");
    assert_eq!(out["ports"][0]["protocol"], "TCP");
    assert!(out.get("env").is_none(), "empty maps are omitted");
}

#[test]
fn status_serializes_phase_and_nulls() {
    let status = KeelAppStatus { phase: Some(Phase::AuthError), latest_build_id: Some("abc".into()), ..Default::default() };
    let v = serde_json::to_value(&status).unwrap();
    assert_eq!(v["phase"], "AuthError");
    assert_eq!(v["latestBuildId"], "abc");
    assert!(v["appUrl"].is_null());
    assert_eq!(v["buildHistory"], json!([]));
}

#[test]
fn generated_crd_describes_keel_apps() {
    let crd = KeelApp::crd();
    assert_eq!(crd.metadata.name.as_deref(), Some("keelapps.keel.dev"));
    assert_eq!(crd.spec.group, "keel.dev");
    assert_eq!(crd.spec.names.kind, "KeelApp");
    assert_eq!(crd.spec.scope, "Namespaced");
    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    let columns: Vec<&str> = version.additional_printer_columns.iter().flatten().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, ["Phase", "Commit", "Ready", "URL"]);
}
