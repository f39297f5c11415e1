//! In-memory [`Cluster`] for unit and integration tests. Objects are stored as
//! JSON keyed by (kind, namespace, name); every mutating call is recorded so
//! tests can assert on write counts.
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::cluster::{Cluster, Managed};
use crate::crd::{KeelApp, KeelAppSpec};
use crate::error::{Error, Result};
use crate::revision::{Credential, RefLister, RemoteRef, RevisionResolver, Stage, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb { Create, Replace, Delete, PatchStatus }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation { pub verb: Verb, pub kind: String, pub name: String }

type Key = (String, String, String);

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<Key, serde_json::Value>>,
    mutations: Mutex<Vec<Mutation>>,
    next_version: Mutex<u64>,
    fail_writes: AtomicBool,
}

fn key<K: Managed>(ns: &str, name: &str) -> Key { (K::kind(&()).into_owned(), ns.to_string(), name.to_string()) }

fn labels_match(obj: &serde_json::Value, selector: &str) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels[k.trim()].as_str() == Some(v.trim()),
        None => !labels[term].is_null(),
    })
}

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    /// Makes every subsequent mutating call fail, simulating an API outage.
    pub fn fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    pub fn mutations(&self) -> Vec<Mutation> { self.mutations.lock().unwrap().clone() }

    pub fn mutation_count(&self) -> usize { self.mutations.lock().unwrap().len() }

    pub fn created<K: Managed>(&self) -> Vec<String> {
        let kind = K::kind(&()).into_owned();
        self.mutations().into_iter().filter(|m| m.verb == Verb::Create && m.kind == kind).map(|m| m.name).collect()
    }

    /// Stores an object without recording a mutation (pre-existing cluster state).
    pub fn seed<K: Managed>(&self, ns: &str, obj: &K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(obj).unwrap();
        value["metadata"]["namespace"] = serde_json::json!(ns);
        if value["metadata"]["resourceVersion"].is_null() { value["metadata"]["resourceVersion"] = serde_json::json!(self.bump()); }
        self.objects.lock().unwrap().insert(key::<K>(ns, &name), value);
    }

    /// Mutates a stored object the way another controller would (not recorded).
    pub fn modify<K: Managed>(&self, ns: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let slot = objects.get_mut(&key::<K>(ns, name)).expect("object to modify must exist");
        let mut obj: K = serde_json::from_value(slot.clone()).unwrap();
        f(&mut obj);
        *slot = serde_json::to_value(&obj).unwrap();
    }

    pub fn object<K: Managed>(&self, ns: &str, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(&key::<K>(ns, name)).map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    fn bump(&self) -> String {
        let mut v = self.next_version.lock().unwrap();
        *v += 1;
        v.to_string()
    }

    fn record<K: Managed>(&self, verb: Verb, name: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Invalid(format!("injected write failure on {}", K::kind(&()))));
        }
        self.mutations.lock().unwrap().push(Mutation { verb, kind: K::kind(&()).into_owned(), name: name.to_string() });
        Ok(())
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>> {
        // Yield so concurrent callers interleave between read and write.
        tokio::task::yield_now().await;
        Ok(self.object(ns, name))
    }

    async fn list<K: Managed>(&self, ns: &str, label_selector: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).into_owned();
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|((k, n, _), v)| *k == kind && n == ns && labels_match(v, label_selector))
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        let mut objects = self.objects.lock().unwrap();
        let k = key::<K>(ns, &name);
        if objects.contains_key(&k) {
            return Err(Error::AlreadyExists { kind: k.0, name });
        }
        self.record::<K>(Verb::Create, &name)?;
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["namespace"] = serde_json::json!(ns);
        value["metadata"]["resourceVersion"] = serde_json::json!(self.bump());
        if value["metadata"]["uid"].is_null() { value["metadata"]["uid"] = serde_json::json!(format!("uid-{name}")); }
        objects.insert(k, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        let mut objects = self.objects.lock().unwrap();
        let k = key::<K>(ns, &name);
        let Some(current) = objects.get(&k) else {
            return Err(Error::Invalid(format!("{} {name} not found", k.0)));
        };
        if current["metadata"]["resourceVersion"].as_str() != obj.meta().resource_version.as_deref() {
            return Err(Error::Conflict { kind: k.0, name });
        }
        self.record::<K>(Verb::Replace, &name)?;
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["resourceVersion"] = serde_json::json!(self.bump());
        objects.insert(k, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key::<K>(ns, name)) {
            self.record::<K>(Verb::Delete, name)?;
            objects.remove(&key::<K>(ns, name));
        }
        Ok(())
    }

    async fn patch_status<K: Managed>(&self, ns: &str, name: &str, status: &serde_json::Value) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let k = key::<K>(ns, name);
        let Some(current) = objects.get_mut(&k) else {
            return Err(Error::Invalid(format!("{} {name} not found", k.0)));
        };
        self.record::<K>(Verb::PatchStatus, name)?;
        current["status"] = status.clone();
        Ok(())
    }
}

/// A `KeelApp` with a uid so owner references can be built.
pub fn keel_app(name: &str, ns: &str, spec: KeelAppSpec) -> KeelApp {
    let mut app = KeelApp::new(name, spec);
    app.metadata = ObjectMeta {
        name: Some(name.into()),
        namespace: Some(ns.into()),
        uid: Some(format!("uid-{name}")),
        ..ObjectMeta::default()
    };
    app
}

pub fn spec(repo_url: &str, image_name: &str) -> KeelAppSpec {
    KeelAppSpec { repo_url: repo_url.into(), image_name: image_name.into(), ..KeelAppSpec::default() }
}

/// Remote serving a fixed advertisement. With a required token, SSH and
/// anonymous attempts are rejected the way a private HTTPS host would.
#[derive(Default)]
pub struct FakeRemote {
    refs: Mutex<Vec<RemoteRef>>,
    required_token: Option<String>,
    failure: Mutex<Option<TransportError>>,
    calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new(refs: Vec<RemoteRef>) -> Arc<Self> { Arc::new(Self { refs: Mutex::new(refs), ..Self::default() }) }

    pub fn token_only(token: &str, refs: Vec<RemoteRef>) -> Arc<Self> {
        Arc::new(Self { refs: Mutex::new(refs), required_token: Some(token.into()), ..Self::default() })
    }

    /// Points `refs/heads/<branch>` at `oid`, adding the ref if needed.
    pub fn set_branch(&self, branch: &str, oid: &str) {
        let name = format!("refs/heads/{branch}");
        let mut refs = self.refs.lock().unwrap();
        match refs.iter_mut().find(|r| r.name == name) {
            Some(r) => r.oid = oid.into(),
            None => refs.push(RemoteRef::new(name, oid)),
        }
    }

    /// Every subsequent listing fails with `err` until cleared with `None`.
    pub fn fail_with(&self, err: Option<TransportError>) { *self.failure.lock().unwrap() = err; }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    pub fn resolver(self: &Arc<Self>) -> RevisionResolver { RevisionResolver::new(self.clone(), vec!["github.com".into()], "oauth2") }
}

#[async_trait]
impl RefLister for FakeRemote {
    async fn list_refs(&self, _url: &str, credential: Credential<'_>) -> std::result::Result<Vec<RemoteRef>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() { return Err(err); }
        match (&self.required_token, credential) {
            (None, _) => Ok(self.refs.lock().unwrap().clone()),
            (Some(want), Credential::Token { token, .. }) if want.as_str() == token => Ok(self.refs.lock().unwrap().clone()),
            (Some(_), _) => Err(TransportError::new(Stage::Authenticate, "401 Unauthorized")),
        }
    }
}
