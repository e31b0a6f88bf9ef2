//! Store-backed pipelines: one generic pipeline per persisted kind.

use std::marker::PhantomData;
use std::sync::Arc;

use rampart_persist::{Store, StoreExt};
use rampart_reconcile::{perform, CloseOnDrop, ObservedSource};
use rustc_hash::FxHashSet;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, warn};

use crate::event::{Deployment, Namespace, NetworkPolicy, ProcessIndicator, Resource, ResourceAction, Secret};
use crate::{Pipeline, PipelineError, SensorEnforcement, SensorEvent};

/// A resource kind that is persisted by id.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Store key for the kind.
    const KIND: &'static str;
    /// Human-readable plural, used in logs and reconcile errors.
    const PLURAL: &'static str;

    fn id(&self) -> &str;
    fn from_resource(resource: &Resource) -> Option<&Self>;
}

macro_rules! entity {
    ($ty:ident, $kind:literal, $plural:literal) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;

            fn id(&self) -> &str {
                &self.id
            }

            fn from_resource(resource: &Resource) -> Option<&Self> {
                match resource {
                    Resource::$ty(e) => Some(e),
                    _ => None,
                }
            }
        }
    };
}

entity!(Deployment, "deployment", "deployments");
entity!(ProcessIndicator, "processIndicator", "process indicators");
entity!(NetworkPolicy, "networkPolicy", "network policies");
entity!(Namespace, "namespace", "namespaces");
entity!(Secret, "secret", "secrets");

/// Applies create/update/remove for `E` against a [`Store`].
pub struct PersistPipeline<E: Entity> {
    store: Arc<dyn Store>,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Entity> PersistPipeline<E> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, _kind: PhantomData }
    }
}

impl<E: Entity> Clone for PersistPipeline<E> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.store))
    }
}

#[async_trait::async_trait]
impl<E: Entity> Pipeline for PersistPipeline<E> {
    async fn run(&self, event: &SensorEvent) -> Result<Option<SensorEnforcement>, PipelineError> {
        let entity = E::from_resource(&event.resource)
            .ok_or(PipelineError::WrongPayload { pipeline: E::KIND, got: event.resource.kind_name() })?;
        match event.action {
            ResourceAction::Create | ResourceAction::Update => {
                self.store.upsert(E::KIND, entity.id(), &event.cluster_id, entity).map_err(|e| {
                    error!(kind = E::KIND, id = entity.id(), error = %e, "upsert failed");
                    PipelineError::Store(e)
                })?;
            }
            ResourceAction::Remove => {
                let removed = self.store.remove(E::KIND, entity.id()).map_err(PipelineError::Store)?;
                if !removed {
                    debug!(kind = E::KIND, id = entity.id(), "remove of unknown id");
                }
            }
            ResourceAction::Unknown(code) => {
                warn!(kind = E::KIND, id = entity.id(), action = code, "unknown resource action; ignoring");
            }
        }
        Ok(None)
    }

    async fn reconcile(&self, cluster_id: &str, observed: Box<dyn ObservedSource>) -> Result<(), PipelineError> {
        // Closed even if the expected set cannot be read.
        let observed = CloseOnDrop::new(observed);
        let expected: FxHashSet<String> =
            self.store.ids_for_cluster(E::KIND, cluster_id).map_err(PipelineError::Store)?.into_iter().collect();
        let store = Arc::clone(&self.store);
        perform(&expected, observed, E::PLURAL, move |id| {
            let store = Arc::clone(&store);
            async move { store.remove(E::KIND, &id).map(|_| ()) }
        })
        .await?;
        Ok(())
    }
}
