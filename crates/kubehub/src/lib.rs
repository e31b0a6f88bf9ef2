//! Rampart kubehub: capability discovery and the cluster API seam.

#![forbid(unsafe_code)]

use anyhow::Result;
use kube::{
    api::ListParams,
    core::{ApiResource, DynamicObject},
};
use rampart_core::{Gvk, ResourceDescriptor};
use serde::{Deserialize, Serialize};

mod cluster;
#[cfg(feature = "fake")]
pub mod fake;
mod registry;

pub use cluster::KubeCluster;
pub use registry::{CapabilityError, CapabilityRegistry, ClassifySummary};

/// A resource kind as reported by server discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.group, &self.version, &self.kind)
    }
}

/// Where a dynamic call goes: a resource kind, optionally scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTarget {
    pub resource: ApiResource,
    pub namespace: Option<String>,
}

impl ResourceTarget {
    /// Route to `namespace` for namespaced kinds; cluster scope otherwise (namespace ignored).
    pub fn for_descriptor(descriptor: &ResourceDescriptor, namespace: &str) -> Self {
        Self {
            resource: descriptor.api_resource(),
            namespace: descriptor.namespaced.then(|| namespace.to_string()),
        }
    }
}

/// The operation was aborted because its cancellation scope ended.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Calls the upgrader makes against the Kubernetes API server.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Every served group/version/kind, including non-preferred versions.
    async fn discover(&self) -> Result<Vec<DiscoveredResource>>;

    /// The server's OpenAPI v2 document as JSON.
    async fn openapi_schema(&self) -> Result<serde_json::Value>;

    async fn list(&self, target: &ResourceTarget, params: &ListParams) -> Result<Vec<DynamicObject>>;

    async fn get(&self, target: &ResourceTarget, name: &str) -> Result<Option<DynamicObject>>;

    async fn create(&self, target: &ResourceTarget, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete by name; an already absent object is not an error.
    async fn delete(&self, target: &ResourceTarget, name: &str) -> Result<()>;
}
