//! Persistent volume claims for declared volumes. Claims are created once and
//! never resized; claims for volumes no longer declared are deleted.
use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements},
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{ensure_exists, quantity::parse_quantity, remove, Desired, APP_LABEL, VOLUME_LABEL};
use crate::cluster::Cluster;
use crate::crd::VolumeConfig;
use crate::error::Result;
use crate::logging::StepContext;

pub fn claim_name(app: &str, volume: &str) -> String { format!("{app}-{volume}") }

pub fn desired(d: &Desired<'_>, v: &VolumeConfig) -> Result<PersistentVolumeClaim> {
    parse_quantity(&v.size)?;
    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(&d.name, &v.name)),
            namespace: Some(d.namespace.clone()),
            labels: Some(BTreeMap::from([(APP_LABEL.to_string(), d.name.clone()), (VOLUME_LABEL.to_string(), v.name.clone())])),
            owner_references: Some(vec![d.owner()?]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: v.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(v.size.clone()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub async fn converge<C: Cluster>(cluster: &C, step: &StepContext, d: &Desired<'_>) -> Result<usize> {
    let mut writes = 0;
    for v in &d.app.spec.volumes {
        writes += usize::from(ensure_exists(cluster, step, &d.namespace, desired(d, v)?).await?.written);
    }
    let selector = format!("{APP_LABEL}={},{VOLUME_LABEL}", d.name);
    for pvc in cluster.list::<PersistentVolumeClaim>(&d.namespace, &selector).await? {
        let declared = pvc.labels().get(VOLUME_LABEL).is_some_and(|v| d.app.spec.volumes.iter().any(|c| &c.name == v));
        if !declared {
            writes += usize::from(remove::<C, PersistentVolumeClaim>(cluster, step, &d.namespace, &pvc.name_any()).await?);
        }
    }
    Ok(writes)
}
