//! In-memory [`ClusterApi`] for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use kube::{api::ListParams, core::DynamicObject};
use rustc_hash::FxHashSet;

use crate::{ClusterApi, DiscoveredResource, ResourceTarget};

type Key = (String, Option<String>, String);

#[derive(Default)]
pub struct FakeCluster {
    pub discovered: Vec<DiscoveredResource>,
    pub openapi: serde_json::Value,
    pub fail_discovery: bool,
    /// Kinds whose list calls fail.
    pub failing_lists: FxHashSet<String>,
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
}

impl FakeCluster {
    pub fn new(discovered: Vec<DiscoveredResource>) -> Self {
        Self { discovered, openapi: serde_json::json!({ "definitions": {} }), ..Default::default() }
    }

    fn key(target: &ResourceTarget, name: &str) -> Key {
        (target.resource.api_version.clone() + "/" + &target.resource.kind, target.namespace.clone(), name.to_string())
    }

    /// Store `obj` under `target` as if it had been created on the server.
    pub fn insert(&self, target: &ResourceTarget, obj: DynamicObject) {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.objects.lock().unwrap().insert(Self::key(target, &name), obj);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches_selector(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else { return true };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => labels.contains_key(term),
    })
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn discover(&self) -> Result<Vec<DiscoveredResource>> {
        if self.fail_discovery {
            return Err(anyhow!("discovery endpoint unavailable"));
        }
        Ok(self.discovered.clone())
    }

    async fn openapi_schema(&self) -> Result<serde_json::Value> {
        Ok(self.openapi.clone())
    }

    async fn list(&self, target: &ResourceTarget, params: &ListParams) -> Result<Vec<DynamicObject>> {
        if self.failing_lists.contains(&target.resource.kind) {
            return Err(anyhow!("the server could not list {}", target.resource.plural));
        }
        let prefix = target.resource.api_version.clone() + "/" + &target.resource.kind;
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((kind, ns, _), _)| *kind == prefix && (target.namespace.is_none() || *ns == target.namespace))
            .filter(|(_, o)| matches_selector(o, params.label_selector.as_deref()))
            // Like the API server, list items carry no type meta.
            .map(|(_, o)| DynamicObject { types: None, ..o.clone() })
            .collect())
    }

    async fn get(&self, target: &ResourceTarget, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.objects.lock().unwrap().get(&Self::key(target, name)).cloned())
    }

    async fn create(&self, target: &ResourceTarget, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object has no name"))?;
        let mut objects = self.objects.lock().unwrap();
        let key = Self::key(target, &name);
        if objects.contains_key(&key) {
            return Err(anyhow!("{} {} already exists", target.resource.kind, name));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }

    async fn delete(&self, target: &ResourceTarget, name: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(&Self::key(target, name));
        Ok(())
    }
}
