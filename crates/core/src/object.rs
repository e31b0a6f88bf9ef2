//! Decoded Kubernetes objects: statically typed where the scheme knows the kind, dynamic otherwise.

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde_json::Value as Json;

use crate::Gvk;

macro_rules! typed_scheme {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        /// Object of a kind registered in the typed scheme.
        #[derive(Debug, Clone, PartialEq)]
        pub enum TypedObject {
            $($variant(Box<$ty>),)+
        }

        impl TypedObject {
            /// Kinds known to the typed scheme.
            pub fn scheme() -> Vec<Gvk> {
                vec![$(Gvk::of::<$ty>()),+]
            }

            /// Decode `value` as the typed representation of `gvk`.
            /// Returns `None` when the scheme has no type for that kind.
            pub fn decode(gvk: &Gvk, value: Json) -> Option<Result<Self, serde_json::Error>> {
                $(
                    if *gvk == Gvk::of::<$ty>() {
                        return Some(serde_json::from_value::<$ty>(value).map(|o| TypedObject::$variant(Box::new(o))));
                    }
                )+
                None
            }

            pub fn gvk(&self) -> Gvk {
                match self {
                    $(TypedObject::$variant(_) => Gvk::of::<$ty>(),)+
                }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(TypedObject::$variant(o) => &o.metadata,)+
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(TypedObject::$variant(o) => &mut o.metadata,)+
                }
            }

            pub fn to_value(&self) -> serde_json::Result<Json> {
                match self {
                    $(TypedObject::$variant(o) => serde_json::to_value(o.as_ref()),)+
                }
            }
        }
    };
}

typed_scheme! {
    Namespace => Namespace,
    ServiceAccount => ServiceAccount,
    Secret => Secret,
    ConfigMap => ConfigMap,
    ClusterRole => ClusterRole,
    ClusterRoleBinding => ClusterRoleBinding,
    Role => Role,
    RoleBinding => RoleBinding,
    NetworkPolicy => NetworkPolicy,
    ValidatingWebhookConfiguration => ValidatingWebhookConfiguration,
    Service => Service,
    DaemonSet => DaemonSet,
    Deployment => Deployment,
}

/// A decoded Kubernetes API object.
#[derive(Debug, Clone, PartialEq)]
pub enum KubeObject {
    Typed(TypedObject),
    Dynamic(DynamicObject),
}

impl KubeObject {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            KubeObject::Typed(t) => t.meta(),
            KubeObject::Dynamic(d) => &d.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            KubeObject::Typed(t) => t.meta_mut(),
            KubeObject::Dynamic(d) => &mut d.metadata,
        }
    }

    /// Kind of the object; `None` for dynamic objects without type information.
    pub fn gvk(&self) -> Option<Gvk> {
        match self {
            KubeObject::Typed(t) => Some(t.gvk()),
            KubeObject::Dynamic(d) => d.types.as_ref().map(|tm| Gvk::from_api_version(&tm.api_version, &tm.kind)),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    pub fn is_typed(&self) -> bool {
        matches!(self, KubeObject::Typed(_))
    }

    pub fn to_value(&self) -> serde_json::Result<Json> {
        match self {
            KubeObject::Typed(t) => t.to_value(),
            KubeObject::Dynamic(d) => serde_json::to_value(d),
        }
    }
}

impl From<TypedObject> for KubeObject {
    fn from(t: TypedObject) -> Self {
        KubeObject::Typed(t)
    }
}

impl From<DynamicObject> for KubeObject {
    fn from(d: DynamicObject) -> Self {
        KubeObject::Dynamic(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_kind_typed() {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "stackrox" },
            "data": { "k": "v" }
        });
        let obj = TypedObject::decode(&gvk, v).unwrap().unwrap();
        assert_eq!(obj.gvk(), gvk);
        assert_eq!(obj.meta().name.as_deref(), Some("cfg"));
        let back = obj.to_value().unwrap();
        assert_eq!(back["data"]["k"], "v");
        assert_eq!(back["kind"], "ConfigMap");
    }

    #[test]
    fn unknown_kind_is_not_in_scheme() {
        let gvk = Gvk::new("policy", "v1beta1", "PodSecurityPolicy");
        assert!(TypedObject::decode(&gvk, serde_json::json!({})).is_none());
        assert!(!TypedObject::scheme().contains(&gvk));
    }

    #[test]
    fn dynamic_object_reports_gvk_from_type_meta() {
        let d: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "security.openshift.io/v1",
            "kind": "SecurityContextConstraints",
            "metadata": { "name": "scc" }
        }))
        .unwrap();
        let obj = KubeObject::from(d);
        assert_eq!(obj.gvk(), Some(Gvk::new("security.openshift.io", "v1", "SecurityContextConstraints")));
        assert_eq!(obj.name(), Some("scc"));
        assert!(!obj.is_typed());
    }
}
