//! In-memory [`AppDirectory`] for unit and integration tests.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_operator::crd::TRIGGER_ANNOTATION;
use keel_operator::KeelApp;
use kube::ResourceExt;
use std::sync::Mutex;

use crate::directory::{trigger_value, AppDirectory};

/// Names passed to [`MemoryDirectory::fail_trigger_for`] reject triggers.
#[derive(Default)]
pub struct MemoryDirectory {
    apps: Mutex<Vec<KeelApp>>,
    failing: Mutex<Vec<String>>,
    unavailable: Mutex<bool>,
}

impl MemoryDirectory {
    pub fn new(apps: Vec<KeelApp>) -> Self { Self { apps: Mutex::new(apps), ..Self::default() } }

    pub fn fail_trigger_for(&self, name: &str) { self.failing.lock().unwrap().push(name.to_string()); }

    pub fn set_unavailable(&self, down: bool) { *self.unavailable.lock().unwrap() = down; }

    pub fn annotation(&self, ns: &str, name: &str) -> Option<String> {
        self.apps
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.name_any() == name && a.namespace().as_deref() == Some(ns))
            .and_then(|a| a.annotations().get(TRIGGER_ANNOTATION).cloned())
    }
}

#[async_trait]
impl AppDirectory for MemoryDirectory {
    async fn list(&self) -> anyhow::Result<Vec<KeelApp>> {
        if *self.unavailable.lock().unwrap() { anyhow::bail!("directory unavailable"); }
        Ok(self.apps.lock().unwrap().clone())
    }

    async fn trigger(&self, app: &KeelApp, at: DateTime<Utc>) -> anyhow::Result<()> {
        let name = app.name_any();
        if self.failing.lock().unwrap().contains(&name) { anyhow::bail!("patch rejected for {name}"); }
        let mut apps = self.apps.lock().unwrap();
        let stored = apps
            .iter_mut()
            .find(|a| a.name_any() == name && a.namespace() == app.namespace())
            .ok_or_else(|| anyhow::anyhow!("{name} not found"))?;
        stored.annotations_mut().insert(TRIGGER_ANNOTATION.to_string(), trigger_value(at));
        Ok(())
    }
}
