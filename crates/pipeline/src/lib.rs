//! Rampart pipelines: route each sensor event to the handler for its resource kind.
//!
//! Pipelines are constructed independently and injected into the [`Dispatcher`]; it holds no
//! state of its own, so concurrent `dispatch` calls never interfere.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use rampart_reconcile::{ObservedSource, ReconcileError};
use thiserror::Error;
use tracing::{debug, warn};

pub mod event;
pub mod persist;

pub use event::{
    Container, Deployment, EnforcementAction, Namespace, NetworkPolicy, ProcessIndicator, ProcessSignal, Resource,
    ResourceAction, Secret, SensorEnforcement, SensorEvent,
};
pub use persist::{Entity, PersistPipeline};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unrecognized event {event_id}: no known resource payload")]
    UnrecognizedEvent { event_id: String },
    #[error("{pipeline} pipeline received a {got} payload")]
    WrongPayload { pipeline: &'static str, got: &'static str },
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("{} pipeline(s) failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<PipelineError>),
}

fn join_errors(errs: &[PipelineError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Handler for one resource kind.
#[async_trait::async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, event: &SensorEvent) -> Result<Option<SensorEnforcement>, PipelineError>;

    /// Prune entries for `cluster_id` that `observed` no longer reports, closing `observed`
    /// exactly once. Pipelines with no backing state have nothing to prune.
    async fn reconcile(&self, _cluster_id: &str, mut observed: Box<dyn ObservedSource>) -> Result<(), PipelineError> {
        observed.close();
        Ok(())
    }
}

/// Current identifiers per resource kind, as reported by a sensor after (re)connecting.
/// Keys are [`Resource::kind_name`] values.
pub type ObservedReport = BTreeMap<&'static str, Box<dyn ObservedSource>>;

pub struct Dispatcher {
    deployments: Arc<dyn Pipeline>,
    process_indicators: Arc<dyn Pipeline>,
    network_policies: Arc<dyn Pipeline>,
    namespaces: Arc<dyn Pipeline>,
    secrets: Arc<dyn Pipeline>,
}

impl Dispatcher {
    pub fn new(
        deployments: Arc<dyn Pipeline>,
        process_indicators: Arc<dyn Pipeline>,
        network_policies: Arc<dyn Pipeline>,
        namespaces: Arc<dyn Pipeline>,
        secrets: Arc<dyn Pipeline>,
    ) -> Self {
        Self { deployments, process_indicators, network_policies, namespaces, secrets }
    }

    fn pipeline_for(&self, resource: &Resource) -> Option<&Arc<dyn Pipeline>> {
        match resource {
            Resource::Deployment(_) => Some(&self.deployments),
            Resource::ProcessIndicator(_) => Some(&self.process_indicators),
            Resource::NetworkPolicy(_) => Some(&self.network_policies),
            Resource::Namespace(_) => Some(&self.namespaces),
            Resource::Secret(_) => Some(&self.secrets),
            Resource::Unknown => None,
        }
    }

    /// Route `event` to the pipeline for its kind and return that pipeline's result unchanged.
    pub async fn dispatch(&self, event: &SensorEvent) -> Result<Option<SensorEnforcement>, PipelineError> {
        let kind = event.resource.kind_name();
        let Some(pipeline) = self.pipeline_for(&event.resource) else {
            counter!("pipeline_unrecognized_total", 1u64);
            warn!(event = %event.id, cluster = %event.cluster_id, "unrecognized event");
            return Err(PipelineError::UnrecognizedEvent { event_id: event.id.clone() });
        };
        counter!("pipeline_events_total", 1u64, "kind" => kind);
        debug!(event = %event.id, kind, action = %event.action, "dispatch");
        pipeline.run(event).await
    }

    /// Reconcile every kind present in `observed` for `cluster_id`. Every kind is attempted;
    /// failures are collected.
    pub async fn reconcile_all(&self, cluster_id: &str, observed: ObservedReport) -> Result<(), PipelineError> {
        let mut errors = Vec::new();
        for (kind, mut source) in observed {
            let pipeline = match kind {
                "deployment" => &self.deployments,
                "processIndicator" => &self.process_indicators,
                "networkPolicy" => &self.network_policies,
                "namespace" => &self.namespaces,
                "secret" => &self.secrets,
                other => {
                    warn!(kind = other, "no pipeline to reconcile");
                    source.close();
                    continue;
                }
            };
            if let Err(e) = pipeline.reconcile(cluster_id, source).await {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(PipelineError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_error_lists_each_cause() {
        let e = PipelineError::Multiple(vec![
            PipelineError::UnrecognizedEvent { event_id: "a".into() },
            PipelineError::Store(anyhow::anyhow!("disk full")),
        ]);
        let msg = e.to_string();
        assert!(msg.starts_with("2 pipeline(s) failed"), "{}", msg);
        assert!(msg.contains("disk full"), "{}", msg);
    }
}
