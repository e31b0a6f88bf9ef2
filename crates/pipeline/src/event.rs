//! Sensor events as received from secured clusters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What happened to the resource. Codes follow the sensor wire protocol; codes this build does
/// not know are preserved as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ResourceAction {
    Create,
    Remove,
    Update,
    Unknown(i32),
}

impl From<i32> for ResourceAction {
    fn from(code: i32) -> Self {
        match code {
            0 => ResourceAction::Create,
            1 => ResourceAction::Remove,
            2 => ResourceAction::Update,
            other => ResourceAction::Unknown(other),
        }
    }
}

impl From<ResourceAction> for i32 {
    fn from(action: ResourceAction) -> Self {
        match action {
            ResourceAction::Create => 0,
            ResourceAction::Remove => 1,
            ResourceAction::Update => 2,
            ResourceAction::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAction::Create => f.write_str("CREATE_RESOURCE"),
            ResourceAction::Remove => f.write_str("REMOVE_RESOURCE"),
            ResourceAction::Update => f.write_str("UPDATE_RESOURCE"),
            ResourceAction::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub replicas: i64,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSignal {
    pub name: String,
    pub exec_file_path: String,
    #[serde(default)]
    pub args: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIndicator {
    pub id: String,
    pub deployment_id: String,
    pub pod_id: String,
    pub container_name: String,
    pub signal: ProcessSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Secret metadata. Values never leave the cluster; only the data keys are reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// The one resource an event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Resource {
    Deployment(Deployment),
    ProcessIndicator(ProcessIndicator),
    NetworkPolicy(NetworkPolicy),
    Namespace(Namespace),
    Secret(Secret),
    /// A kind this build does not know how to process.
    #[serde(other)]
    Unknown,
}

impl Resource {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Resource::Deployment(_) => "deployment",
            Resource::ProcessIndicator(_) => "processIndicator",
            Resource::NetworkPolicy(_) => "networkPolicy",
            Resource::Namespace(_) => "namespace",
            Resource::Secret(_) => "secret",
            Resource::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorEvent {
    pub id: String,
    pub cluster_id: String,
    pub action: ResourceAction,
    pub resource: Resource,
}

impl SensorEvent {
    pub fn new(cluster_id: &str, action: ResourceAction, resource: Resource) -> Self {
        let id = match &resource {
            Resource::Deployment(d) => d.id.clone(),
            Resource::ProcessIndicator(p) => p.id.clone(),
            Resource::NetworkPolicy(n) => n.id.clone(),
            Resource::Namespace(n) => n.id.clone(),
            Resource::Secret(s) => s.id.clone(),
            Resource::Unknown => String::new(),
        };
        Self { id, cluster_id: cluster_id.to_string(), action, resource }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    ScaleToZero,
    KillPod,
    FailBuild,
}

/// Directive sent back to the sensor as the outcome of processing an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorEnforcement {
    pub deployment_id: String,
    pub action: EnforcementAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_resource() {
        let ev: SensorEvent = serde_json::from_value(serde_json::json!({
            "id": "d1",
            "clusterId": "c1",
            "action": 1,
            "resource": { "kind": "deployment", "id": "d1", "name": "web", "namespace": "default" }
        }))
        .unwrap();
        assert_eq!(ev.action, ResourceAction::Remove);
        match ev.resource {
            Resource::Deployment(d) => assert_eq!(d.name, "web"),
            other => panic!("unexpected resource {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_and_action_are_preserved_not_rejected() {
        let ev: SensorEvent = serde_json::from_value(serde_json::json!({
            "id": "x",
            "clusterId": "c1",
            "action": 7,
            "resource": { "kind": "podDisruptionBudget", "id": "x", "minAvailable": 1 }
        }))
        .unwrap();
        assert_eq!(ev.action, ResourceAction::Unknown(7));
        assert_eq!(ev.resource, Resource::Unknown);
        assert_eq!(serde_json::to_value(ev.action).unwrap(), 7);
    }

    #[test]
    fn secret_type_field_is_renamed() {
        let s = Secret { id: "s".into(), name: "tls".into(), namespace: "ns".into(), type_: "kubernetes.io/tls".into(), files: vec!["tls.crt".into()] };
        let v = serde_json::to_value(Resource::Secret(s)).unwrap();
        assert_eq!(v["kind"], "secret");
        assert_eq!(v["type"], "kubernetes.io/tls");
    }
}
