//! Rampart upgrade context: everything one upgrade run needs to talk to the cluster.
//!
//! The context is created once per run. Creation discovers server capabilities, loads the
//! server's OpenAPI schema, sets up the optional coordinator channels and resolves the optional
//! owner. Any failure along the way aborts creation; there is no partially built context.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::future::try_join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ListParams;
use kube::core::{DynamicObject, TypeMeta};
use metrics::{counter, histogram};
use rampart_core::{
    kinds, Gvk, ManagedObject, ObjectRef, ProcessId, ProcessTracker, Purpose, ResourceDescriptor,
    UPGRADE_RESOURCE_LABEL_KEY, UPGRADE_RESOURCE_LABEL_VALUE,
};
use rampart_kubehub::{Cancelled, CapabilityError, CapabilityRegistry, ClusterApi, KubeCluster, ResourceTarget};
use rampart_schema::{DecodeError, SchemaValidator, ValidationError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod config;
pub mod coordinator;

pub use config::{TlsFiles, UpgraderConfig, DEFAULT_NAMESPACE};
pub use coordinator::{Coordinator, CoordinatorChannel};

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("creating Kubernetes API clients: {0:#}")]
    Client(anyhow::Error),
    #[error(transparent)]
    Discovery(CapabilityError),
    #[error("retrieving OpenAPI schema document from server: {0:#}")]
    OpenApi(anyhow::Error),
    #[error("instantiating TLS config: {0}")]
    Tls(String),
    #[error("coordinator: {0}")]
    Coordinator(String),
    #[error("server does not support resource type of supposed owner {0}")]
    OwnerUnsupported(ObjectRef),
    #[error("supposed owner {0} does not exist")]
    OwnerNotFound(ObjectRef),
    #[error("could not retrieve supposed owner {owner}: {cause:#}")]
    OwnerLookup { owner: ObjectRef, cause: anyhow::Error },
    #[error("the server does not support resource type {gvk} for purpose {purpose}")]
    Unsupported { gvk: Gvk, purpose: Purpose },
    #[error("listing relevant objects of type {kind}: {cause:#}")]
    List { kind: Gvk, cause: anyhow::Error },
    #[error("unpacking list of objects of type {kind}: {cause}")]
    Unpack { kind: Gvk, cause: DecodeError },
    #[error("no coordinator connection configured")]
    NotConfigured,
    #[error("upgrade context cancelled")]
    Cancelled,
    #[error("coordinator request: {0}")]
    Http(reqwest::Error),
    #[error("schema validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("object of kind {0} is not a Kubernetes API object: it has no name")]
    NotAnObject(String),
}

impl UpgradeError {
    fn list(kind: &Gvk, cause: anyhow::Error) -> Self {
        if cause.is::<Cancelled>() {
            return UpgradeError::Cancelled;
        }
        UpgradeError::List { kind: kind.clone(), cause }
    }
}

/// Dynamic access to one resource kind, scoped by [`UpgradeContext::dynamic_client_for`].
#[derive(Clone)]
pub struct ResourceClient {
    cluster: Arc<dyn ClusterApi>,
    target: ResourceTarget,
}

impl ResourceClient {
    pub fn target(&self) -> &ResourceTarget {
        &self.target
    }

    pub async fn list(&self, params: &ListParams) -> anyhow::Result<Vec<DynamicObject>> {
        self.cluster.list(&self.target, params).await
    }

    pub async fn get(&self, name: &str) -> anyhow::Result<Option<DynamicObject>> {
        self.cluster.get(&self.target, name).await
    }

    pub async fn create(&self, obj: &DynamicObject) -> anyhow::Result<DynamicObject> {
        self.cluster.create(&self.target, obj).await
    }

    pub async fn delete(&self, name: &str) -> anyhow::Result<()> {
        self.cluster.delete(&self.target, name).await
    }
}

pub struct UpgradeContext {
    config: UpgraderConfig,
    cancel: CancellationToken,
    cluster: Arc<dyn ClusterApi>,
    registry: CapabilityRegistry,
    validator: SchemaValidator,
    tracker: ProcessTracker,
    coordinator: Option<Coordinator>,
}

impl UpgradeContext {
    /// Build a context against the cluster described by `config.kube`. Every cluster call made
    /// through the context fails once `cancel` fires.
    pub async fn create(cancel: CancellationToken, config: UpgraderConfig) -> Result<Self, UpgradeError> {
        let cluster = KubeCluster::try_new(config.kube.clone(), cancel.clone()).map_err(UpgradeError::Client)?;
        Self::create_with_cluster(cancel, config, Arc::new(cluster)).await
    }

    /// Like [`create`](Self::create), with an already constructed cluster API.
    pub async fn create_with_cluster(
        cancel: CancellationToken,
        config: UpgraderConfig,
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<Self, UpgradeError> {
        if cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }

        let mut registry = CapabilityRegistry::discover(cluster.as_ref()).await.map_err(UpgradeError::Discovery)?;
        registry.classify(&kinds::ordered_bundle_kinds(), &kinds::state_kinds());

        let document = cluster.openapi_schema().await.map_err(UpgradeError::OpenApi)?;
        let validator = SchemaValidator::from_openapi(document)
            .map_err(|e| UpgradeError::OpenApi(anyhow::Error::new(e).context("parsing OpenAPI schema document")))?;

        let coordinator = match config.coordinator_endpoint.as_deref() {
            Some(endpoint) => Some(Coordinator::connect(endpoint, config.tls.as_ref(), cancel.clone())?),
            None => None,
        };

        let owner = match &config.owner {
            Some(owner) => Some(resolve_owner(cluster.as_ref(), &registry, owner, &config.namespace).await?),
            None => None,
        };

        let tracker = ProcessTracker::new(config.process_id.clone(), owner);
        info!(process = %config.process_id, cluster = %config.cluster_id, kinds = registry.len(), "upgrade context ready");
        Ok(Self { config, cancel, cluster, registry, validator, tracker, coordinator })
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.config.process_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn owner(&self) -> Option<&ObjectRef> {
        self.config.owner.as_ref()
    }

    /// The owner reference attached to process state, resolved at creation.
    pub fn owner_reference(&self) -> Option<&OwnerReference> {
        self.tracker.owner()
    }

    pub fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    /// Descriptor for `gvk` if it is supported and classified for every bit of `purpose`.
    pub fn lookup(&self, gvk: &Gvk, purpose: Purpose) -> Option<&ResourceDescriptor> {
        self.registry.lookup(gvk, purpose)
    }

    pub fn resources(&self) -> Vec<&ResourceDescriptor> {
        let mut out: Vec<_> = self.registry.resources().collect();
        out.sort_by(|a, b| a.gvk.cmp(&b.gvk));
        out
    }

    /// Accessor for `descriptor`'s kind; namespaced kinds are scoped to `namespace`.
    pub fn dynamic_client_for(&self, descriptor: &ResourceDescriptor, namespace: &str) -> ResourceClient {
        ResourceClient {
            cluster: Arc::clone(&self.cluster),
            target: ResourceTarget::for_descriptor(descriptor, namespace),
        }
    }

    pub fn dynamic_client_for_gvk(&self, gvk: &Gvk, purpose: Purpose, namespace: &str) -> Result<ResourceClient, UpgradeError> {
        let descriptor = self
            .registry
            .lookup(gvk, purpose)
            .ok_or_else(|| UpgradeError::Unsupported { gvk: gvk.clone(), purpose })?;
        Ok(self.dynamic_client_for(descriptor, namespace))
    }

    /// All live objects of every kind classified for any bit of `purpose`.
    ///
    /// Kinds are listed concurrently. The first kind to fail aborts the call; partial results
    /// are never returned.
    pub async fn list(&self, purpose: Purpose, params: &ListParams) -> Result<Vec<ManagedObject>, UpgradeError> {
        let started = std::time::Instant::now();
        let calls = self.registry.with_purpose(purpose).into_iter().map(|descriptor| async move {
            let client = self.dynamic_client_for(descriptor, &self.config.namespace);
            let items = client.list(params).await.map_err(|e| UpgradeError::list(&descriptor.gvk, e))?;
            debug!(kind = %descriptor.gvk, count = items.len(), "listed");
            items
                .into_iter()
                .map(|mut item| {
                    // List responses omit each item's apiVersion and kind.
                    if item.types.is_none() {
                        item.types = Some(TypeMeta { api_version: descriptor.gvk.api_version(), kind: descriptor.gvk.kind.clone() });
                    }
                    rampart_schema::unpack(item)
                        .map(ManagedObject::new)
                        .map_err(|cause| UpgradeError::Unpack { kind: descriptor.gvk.clone(), cause })
                })
                .collect::<Result<Vec<_>, _>>()
        });

        match try_join_all(calls).await {
            Ok(per_kind) => {
                histogram!("upgrade_list_ms", started.elapsed().as_secs_f64() * 1000.0);
                Ok(per_kind.into_iter().flatten().collect())
            }
            Err(e) => {
                counter!("upgrade_list_err", 1u64);
                Err(e)
            }
        }
    }

    /// Bundle objects carrying the current-bundle label.
    pub async fn list_current_objects(&self) -> Result<Vec<ManagedObject>, UpgradeError> {
        let params =
            ListParams::default().labels(&format!("{}={}", UPGRADE_RESOURCE_LABEL_KEY, UPGRADE_RESOURCE_LABEL_VALUE));
        self.list(Purpose::BUNDLE, &params).await
    }

    pub fn annotate_process_state_object(&self, obj: &mut ManagedObject) {
        self.tracker.annotate(obj);
    }

    pub fn is_process_state_object(&self, obj: &ManagedObject) -> bool {
        self.tracker.is_process_state(obj)
    }

    /// Decode `raw` (YAML or JSON), validate it against the server schema and require object
    /// metadata.
    pub fn parse_and_validate_object(&self, raw: &[u8]) -> Result<ManagedObject, UpgradeError> {
        let obj = rampart_schema::decode(raw)?;
        self.validator.validate(raw)?;
        let named = obj.meta().name.is_some() || obj.meta().generate_name.is_some();
        match obj.gvk() {
            Some(_) if named => {}
            Some(gvk) => return Err(UpgradeError::NotAnObject(gvk.to_string())),
            None => return Err(UpgradeError::NotAnObject("<unknown>".to_string())),
        }
        Ok(ManagedObject::new(obj))
    }

    pub fn coordinator(&self) -> Result<&Coordinator, UpgradeError> {
        self.coordinator.as_ref().ok_or(UpgradeError::NotConfigured)
    }

    /// Send an HTTP request to the coordinator. Relative URIs are resolved against the
    /// configured endpoint over HTTPS.
    pub async fn do_http_request(&self, req: http::Request<Vec<u8>>) -> Result<reqwest::Response, UpgradeError> {
        self.coordinator()?.execute(req).await
    }

    pub fn grpc_channel(&self) -> Result<CoordinatorChannel, UpgradeError> {
        Ok(self.coordinator()?.grpc())
    }
}

async fn resolve_owner(
    cluster: &dyn ClusterApi,
    registry: &CapabilityRegistry,
    owner: &ObjectRef,
    default_namespace: &str,
) -> Result<OwnerReference, UpgradeError> {
    let descriptor = registry
        .lookup(&owner.gvk, Purpose::NONE)
        .ok_or_else(|| UpgradeError::OwnerUnsupported(owner.clone()))?;
    let target = ResourceTarget::for_descriptor(descriptor, owner.namespace.as_deref().unwrap_or(default_namespace));
    let obj = cluster
        .get(&target, &owner.name)
        .await
        .map_err(|cause| UpgradeError::OwnerLookup { owner: owner.clone(), cause })?
        .ok_or_else(|| UpgradeError::OwnerNotFound(owner.clone()))?;
    let uid = obj.metadata.uid.ok_or_else(|| UpgradeError::OwnerLookup {
        owner: owner.clone(),
        cause: anyhow::anyhow!("object has no uid"),
    })?;
    info!(owner = %owner, uid = %uid, "resolved owner");
    Ok(OwnerReference {
        api_version: owner.gvk.api_version(),
        kind: owner.gvk.kind.clone(),
        name: owner.name.clone(),
        uid,
        ..Default::default()
    })
}
