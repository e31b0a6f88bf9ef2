//! Attribution of objects to an upgrade process.
//!
//! Provenance is carried as a typed field on [`ManagedObject`]. Labels and owner references are
//! only read or written when converting from and to a [`KubeObject`].

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

use crate::{KubeObject, UPGRADE_PROCESS_ID_LABEL_KEY};

/// Identifier of a single upgrade run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Provenance {
    /// Upgrade run the object is attributed to.
    pub process_id: Option<ProcessId>,
    /// Owner this process attaches to the object, if any.
    pub owner: Option<OwnerReference>,
}

/// A decoded object together with its upgrade provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedObject {
    object: KubeObject,
    provenance: Provenance,
}

impl ManagedObject {
    /// Wrap an object, reading its process attribution from the process-ID label.
    pub fn new(object: KubeObject) -> Self {
        let process_id = object
            .meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(UPGRADE_PROCESS_ID_LABEL_KEY))
            .map(ProcessId::new);
        Self { object, provenance: Provenance { process_id, owner: None } }
    }

    pub fn object(&self) -> &KubeObject {
        &self.object
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn provenance_mut(&mut self) -> &mut Provenance {
        &mut self.provenance
    }

    /// Materialize provenance onto the object's labels and owner references.
    ///
    /// Existing labels and owner references are kept; the owner is appended only if an equal
    /// reference (same uid, kind and name) is not already present.
    pub fn into_object(self) -> KubeObject {
        let Self { mut object, provenance } = self;
        let meta = object.meta_mut();
        if let Some(pid) = provenance.process_id {
            meta.labels
                .get_or_insert_with(Default::default)
                .insert(UPGRADE_PROCESS_ID_LABEL_KEY.to_string(), pid.0);
        }
        if let Some(owner) = provenance.owner {
            let refs = meta.owner_references.get_or_insert_with(Vec::new);
            let present = refs
                .iter()
                .any(|r| r.uid == owner.uid && r.kind == owner.kind && r.name == owner.name);
            if !present {
                refs.push(owner);
            }
        }
        object
    }
}

impl From<KubeObject> for ManagedObject {
    fn from(object: KubeObject) -> Self {
        Self::new(object)
    }
}

/// Attributes objects to one upgrade run.
#[derive(Debug, Clone)]
pub struct ProcessTracker {
    process_id: ProcessId,
    owner: Option<OwnerReference>,
}

impl ProcessTracker {
    pub fn new(process_id: ProcessId, owner: Option<OwnerReference>) -> Self {
        Self { process_id, owner }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn owner(&self) -> Option<&OwnerReference> {
        self.owner.as_ref()
    }

    /// Mark `obj` as state of this process. Idempotent.
    pub fn annotate(&self, obj: &mut ManagedObject) {
        obj.provenance.process_id = Some(self.process_id.clone());
        if let Some(owner) = &self.owner {
            obj.provenance.owner = Some(owner.clone());
        }
    }

    pub fn is_process_state(&self, obj: &ManagedObject) -> bool {
        obj.provenance.process_id.as_ref() == Some(&self.process_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Gvk, TypedObject};

    fn secret(labels: serde_json::Value, owners: serde_json::Value) -> KubeObject {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "upgrade-state", "labels": labels, "ownerReferences": owners }
        });
        TypedObject::decode(&Gvk::new("", "v1", "Secret"), v).unwrap().unwrap().into()
    }

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: "sensor".into(),
            uid: "1234".into(),
            ..Default::default()
        }
    }

    #[test]
    fn annotate_is_idempotent_and_additive() {
        let foreign = serde_json::json!([{ "apiVersion": "v1", "kind": "ConfigMap", "name": "other", "uid": "9" }]);
        let obj = secret(serde_json::json!({ "app": "sensor" }), foreign);
        let tracker = ProcessTracker::new(ProcessId::new("run-1"), Some(owner()));

        let mut managed = ManagedObject::new(obj);
        tracker.annotate(&mut managed);
        tracker.annotate(&mut managed);
        let once = managed.into_object();

        let mut again = ManagedObject::new(once.clone());
        tracker.annotate(&mut again);
        let twice = again.into_object();

        assert_eq!(once, twice);
        let labels = twice.meta().labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("sensor"));
        assert_eq!(labels.get(UPGRADE_PROCESS_ID_LABEL_KEY).map(String::as_str), Some("run-1"));
        let refs = twice.meta().owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "other");
        assert_eq!(refs[1].uid, "1234");
    }

    #[test]
    fn annotate_creates_missing_label_map() {
        let v = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" } });
        let obj: KubeObject = TypedObject::decode(&Gvk::new("", "v1", "ConfigMap"), v).unwrap().unwrap().into();
        let tracker = ProcessTracker::new(ProcessId::new("run-2"), None);
        let mut managed = ManagedObject::new(obj);
        tracker.annotate(&mut managed);
        let out = managed.into_object();
        assert_eq!(out.meta().labels.as_ref().map(|l| l.len()), Some(1));
        assert!(out.meta().owner_references.is_none());
    }

    #[test]
    fn process_state_predicate_reads_label() {
        let tracker = ProcessTracker::new(ProcessId::new("run-1"), None);
        let mine = ManagedObject::new(secret(
            serde_json::json!({ "upgrader.stackrox.io/process-id": "run-1" }),
            serde_json::json!([]),
        ));
        let other = ManagedObject::new(secret(
            serde_json::json!({ "upgrader.stackrox.io/process-id": "run-0" }),
            serde_json::json!([]),
        ));
        let bare = ManagedObject::new(secret(serde_json::json!({}), serde_json::json!([])));
        assert!(tracker.is_process_state(&mine));
        assert!(!tracker.is_process_state(&other));
        assert!(!tracker.is_process_state(&bare));
    }
}
