//! Capability registry: which resource kinds the live server supports, and for what.

use rampart_core::{Gvk, Purpose, ResourceDescriptor};
use rustc_hash::FxHashMap;
use tracing::info;

use crate::{ClusterApi, DiscoveredResource};

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("retrieving Kubernetes resources from server: {0:#}")]
    Discovery(anyhow::Error),
    #[error("the server does not support resource type {gvk} for purpose {purpose}")]
    Unsupported { gvk: Gvk, purpose: Purpose },
}

/// How many of the expected kinds discovery actually found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifySummary {
    pub bundle_found: usize,
    pub bundle_total: usize,
    pub state_found: usize,
    pub state_total: usize,
}

/// Descriptors for every kind the server serves. Built once per run.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    resources: FxHashMap<Gvk, ResourceDescriptor>,
}

impl CapabilityRegistry {
    /// Query server discovery. There is no degraded mode: any discovery error is returned.
    pub async fn discover(cluster: &dyn ClusterApi) -> Result<Self, CapabilityError> {
        let started = std::time::Instant::now();
        let discovered = cluster.discover().await.map_err(CapabilityError::Discovery)?;
        metrics::histogram!("discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self::from_discovered(discovered))
    }

    pub fn from_discovered(discovered: impl IntoIterator<Item = DiscoveredResource>) -> Self {
        let resources = discovered
            .into_iter()
            .map(|d| {
                let gvk = d.gvk();
                let desc = ResourceDescriptor { gvk: gvk.clone(), plural: d.plural, namespaced: d.namespaced, purpose: Purpose::NONE };
                (gvk, desc)
            })
            .collect();
        Self { resources }
    }

    /// Mark discovered kinds with their purposes. Kinds absent from discovery are skipped.
    pub fn classify(&mut self, bundle_kinds: &[Gvk], state_kinds: &[Gvk]) -> ClassifySummary {
        let bundle_found = self.mark(bundle_kinds, Purpose::BUNDLE);
        info!("Server supports {} out of {} relevant bundle resource types", bundle_found, bundle_kinds.len());
        let state_found = self.mark(state_kinds, Purpose::STATE);
        info!("Server supports {} out of {} relevant state resource types", state_found, state_kinds.len());

        for gvk in bundle_kinds {
            if self.resources.contains_key(gvk) {
                info!("Resource type {} is SUPPORTED", gvk);
            } else {
                info!("Resource type {} is NOT SUPPORTED", gvk);
            }
        }

        ClassifySummary {
            bundle_found,
            bundle_total: bundle_kinds.len(),
            state_found,
            state_total: state_kinds.len(),
        }
    }

    fn mark(&mut self, kinds: &[Gvk], purpose: Purpose) -> usize {
        let mut found = 0;
        for gvk in kinds {
            if let Some(desc) = self.resources.get_mut(gvk) {
                desc.purpose |= purpose;
                found += 1;
            }
        }
        found
    }

    /// Descriptor for `gvk` if the server supports it and it was classified for every bit of
    /// `purpose`. Unsupported and wrong-purpose are both `None`.
    pub fn lookup(&self, gvk: &Gvk, purpose: Purpose) -> Option<&ResourceDescriptor> {
        self.resources.get(gvk).filter(|d| d.purpose.contains(purpose))
    }

    /// Like [`lookup`](Self::lookup), for callers that need the kind to exist.
    pub fn require(&self, gvk: &Gvk, purpose: Purpose) -> Result<&ResourceDescriptor, CapabilityError> {
        self.lookup(gvk, purpose)
            .ok_or_else(|| CapabilityError::Unsupported { gvk: gvk.clone(), purpose })
    }

    /// Descriptors whose purpose shares at least one bit with `purpose`.
    pub fn with_purpose(&self, purpose: Purpose) -> Vec<&ResourceDescriptor> {
        let mut out: Vec<_> = self.resources.values().filter(|d| d.purpose.intersects(purpose)).collect();
        out.sort_by(|a, b| a.gvk.cmp(&b.gvk));
        out
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
