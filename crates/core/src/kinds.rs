//! Resource kinds the upgrader knows about.

use crate::Gvk;

const BUNDLE_KINDS: &[(&str, &str, &str)] = &[
    ("", "v1", "Namespace"),
    ("", "v1", "ServiceAccount"),
    ("", "v1", "Secret"),
    ("", "v1", "ConfigMap"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
    ("rbac.authorization.k8s.io", "v1", "Role"),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding"),
    ("networking.k8s.io", "v1", "NetworkPolicy"),
    ("policy", "v1beta1", "PodSecurityPolicy"),
    ("security.openshift.io", "v1", "SecurityContextConstraints"),
    ("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration"),
    ("", "v1", "Service"),
    ("apps", "v1", "DaemonSet"),
    ("apps", "v1", "Deployment"),
];

const STATE_KINDS: &[(&str, &str, &str)] = &[("", "v1", "Secret"), ("", "v1", "ConfigMap")];

/// Kinds making up the sensor bundle, in apply order.
pub fn ordered_bundle_kinds() -> Vec<Gvk> {
    BUNDLE_KINDS.iter().map(|(g, v, k)| Gvk::new(g, v, k)).collect()
}

/// Kinds used to persist upgrade process state.
pub fn state_kinds() -> Vec<Gvk> {
    STATE_KINDS.iter().map(|(g, v, k)| Gvk::new(g, v, k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_order_puts_namespace_first_and_workloads_last() {
        let kinds = ordered_bundle_kinds();
        assert_eq!(kinds.first().map(|g| g.kind.as_str()), Some("Namespace"));
        assert_eq!(kinds.last().map(|g| g.kind.as_str()), Some("Deployment"));
        assert!(state_kinds().iter().all(|s| kinds.contains(s)));
    }
}
