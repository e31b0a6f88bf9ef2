//! Rampart core types: resource kinds, purposes, decoded objects and upgrade provenance.

#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use kube::core::ApiResource;
use serde::{Deserialize, Serialize};

pub mod kinds;
pub mod object;
pub mod provenance;

pub use object::{KubeObject, TypedObject};
pub use provenance::{ManagedObject, ProcessId, ProcessTracker, Provenance};

/// Label whose value names the upgrade process that created an object.
pub const UPGRADE_PROCESS_ID_LABEL_KEY: &str = "upgrader.stackrox.io/process-id";
/// Label key/value pair marking objects that belong to the current bundle.
pub const UPGRADE_RESOURCE_LABEL_KEY: &str = "auto-upgrade.stackrox.io/component";
pub const UPGRADE_RESOURCE_LABEL_VALUE: &str = "sensor";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    GvkKey(String),
    #[error("invalid object reference: {0} (expect <gvk>:<namespace>/<name> or <gvk>:<name>)")]
    ObjectRef(String),
}

/// Group/version/kind of a Kubernetes resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// GVK of a statically typed k8s-openapi resource.
    pub fn of<K: k8s_openapi::Resource>() -> Self {
        Self::new(K::GROUP, K::VERSION, K::KIND)
    }

    /// Split an `apiVersion` string (`v1` or `apps/v1`) and kind into a GVK.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Compact key used on the command line and in logs: `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Gvk {
    type Err = ParseError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(group, version, kind))
            }
            _ => Err(ParseError::GvkKey(key.to_string())),
        }
    }
}

/// Roles a resource kind may serve during an upgrade run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Purpose(u8);

impl Purpose {
    pub const NONE: Purpose = Purpose(0);
    /// Part of the deployed manifest bundle.
    pub const BUNDLE: Purpose = Purpose(1 << 0);
    /// Holds metadata about the upgrade process itself.
    pub const STATE: Purpose = Purpose(1 << 1);

    pub fn contains(self, other: Purpose) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Purpose) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Purpose {
    type Output = Purpose;
    fn bitor(self, rhs: Purpose) -> Purpose {
        Purpose(self.0 | rhs.0)
    }
}

impl BitOrAssign for Purpose {
    fn bitor_assign(&mut self, rhs: Purpose) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Purpose {
    type Output = Purpose;
    fn bitand(self, rhs: Purpose) -> Purpose {
        Purpose(self.0 & rhs.0)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Purpose::BUNDLE) {
            names.push("bundle");
        }
        if self.contains(Purpose::STATE) {
            names.push("state");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// A resource kind served by the live API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub gvk: Gvk,
    /// Plural resource name used in API paths.
    pub plural: String,
    pub namespaced: bool,
    pub purpose: Purpose,
}

impl ResourceDescriptor {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.gvk.group.clone(),
            version: self.gvk.version.clone(),
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Reference to a single object by kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.gvk, ns, self.name),
            None => write!(f, "{}:{}", self.gvk, self.name),
        }
    }
}

impl FromStr for ObjectRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseError::ObjectRef(s.to_string());
        let (gvk, rest) = s.rsplit_once(':').ok_or_else(bad)?;
        let gvk: Gvk = gvk.parse()?;
        let (namespace, name) = match rest.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => (Some(ns.to_string()), name),
            Some(_) => return Err(bad()),
            None => (None, rest),
        };
        if name.is_empty() || name.contains('/') {
            return Err(bad());
        }
        Ok(Self { gvk, namespace, name: name.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_roundtrips_core_and_grouped() {
        let core: Gvk = "v1/Secret".parse().unwrap();
        assert_eq!(core, Gvk::new("", "v1", "Secret"));
        assert_eq!(core.key(), "v1/Secret");
        let apps: Gvk = "apps/v1/Deployment".parse().unwrap();
        assert_eq!(apps.api_version(), "apps/v1");
        assert!("Deployment".parse::<Gvk>().is_err());
        assert!("a/b/c/d".parse::<Gvk>().is_err());
    }

    #[test]
    fn gvk_of_typed_resource() {
        use k8s_openapi::api::apps::v1::Deployment;
        assert_eq!(Gvk::of::<Deployment>(), Gvk::new("apps", "v1", "Deployment"));
    }

    #[test]
    fn purpose_bits() {
        let both = Purpose::BUNDLE | Purpose::STATE;
        assert!(both.contains(Purpose::BUNDLE));
        assert!(both.contains(Purpose::STATE));
        assert!(!Purpose::BUNDLE.contains(both));
        assert!(Purpose::BUNDLE.intersects(both));
        assert!(!Purpose::NONE.intersects(both));
        assert_eq!(both.to_string(), "bundle|state");
        assert_eq!(Purpose::NONE.to_string(), "none");
    }

    #[test]
    fn object_ref_parses_namespaced_and_cluster_scoped() {
        let r: ObjectRef = "apps/v1/Deployment:stackrox/sensor".parse().unwrap();
        assert_eq!(r.gvk.kind, "Deployment");
        assert_eq!(r.namespace.as_deref(), Some("stackrox"));
        assert_eq!(r.name, "sensor");
        assert_eq!(r.to_string(), "apps/v1/Deployment:stackrox/sensor");

        let c: ObjectRef = "v1/Namespace:stackrox".parse().unwrap();
        assert_eq!(c.namespace, None);
        assert_eq!(c.name, "stackrox");

        assert!("v1/Namespace:".parse::<ObjectRef>().is_err());
        assert!("v1/Secret:/x".parse::<ObjectRef>().is_err());
        assert!("nonsense".parse::<ObjectRef>().is_err());
    }
}
