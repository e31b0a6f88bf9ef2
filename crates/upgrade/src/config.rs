//! Inputs for one upgrade run.

use std::path::PathBuf;

use rampart_core::{ObjectRef, ProcessId};

/// Namespace the sensor bundle is installed into.
pub const DEFAULT_NAMESPACE: &str = "stackrox";

/// PEM files for mutual TLS with the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UpgraderConfig {
    pub process_id: ProcessId,
    pub cluster_id: String,
    pub namespace: String,
    /// `host:port` of the coordinator; coordinator calls fail with "not configured" without it.
    pub coordinator_endpoint: Option<String>,
    pub tls: Option<TlsFiles>,
    /// Object that process state is attached to for garbage collection.
    pub owner: Option<ObjectRef>,
    pub kube: kube::Config,
}

impl UpgraderConfig {
    pub fn new(process_id: ProcessId, cluster_id: impl Into<String>, kube: kube::Config) -> Self {
        Self {
            process_id,
            cluster_id: cluster_id.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            coordinator_endpoint: None,
            tls: None,
            owner: None,
            kube,
        }
    }
}
