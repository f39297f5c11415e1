//! Typed access to the orchestration API. Reconciliation code is generic over
//! [`Cluster`] so it runs unchanged against the API server or the in-memory
//! fake in [`crate::test_support`].
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

use crate::error::{Error, Result};

/// Namespaced kinds the reconciler reads or writes.
pub trait Managed:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Managed for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// `Ok(None)` when the object does not exist.
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>>;
    async fn list<K: Managed>(&self, ns: &str, label_selector: &str) -> Result<Vec<K>>;
    /// Fails with [`Error::AlreadyExists`] when the name is taken.
    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K>;
    /// Full replace guarded by the object's `resourceVersion`.
    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K>;
    /// Deleting an absent object is not an error.
    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<()>;
    async fn patch_status<K: Managed>(&self, ns: &str, name: &str, status: &serde_json::Value) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeCluster { client: Client }

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }
    pub fn client(&self) -> &Client { &self.client }
    fn api<K: Managed>(&self, ns: &str) -> Api<K> { Api::namespaced(self.client.clone(), ns) }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err { kube::Error::Api(ae) => Some(ae.code), _ => None }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(ns).get_opt(name).await?)
    }

    async fn list<K: Managed>(&self, ns: &str, label_selector: &str) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api::<K>(ns).list(&lp).await?.items)
    }

    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        match self.api::<K>(ns).create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            Err(e) if api_code(&e) == Some(409) => Err(Error::AlreadyExists { kind: K::kind(&()).into_owned(), name: obj.name_any() }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        match self.api::<K>(ns).replace(&name, &PostParams::default(), obj).await {
            Ok(updated) => Ok(updated),
            Err(e) if api_code(&e) == Some(409) => Err(Error::Conflict { kind: K::kind(&()).into_owned(), name }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<()> {
        match self.api::<K>(ns).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status<K: Managed>(&self, ns: &str, name: &str, status: &serde_json::Value) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(ns).patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}
