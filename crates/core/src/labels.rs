//! Label, annotation, finalizer and API group constants shared by all
//! reconcilers, plus helpers over object metadata.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::GroupVersionKind;

// Claim metadata written onto resource templates and bindings.

/// Permanent ID of the namespaced policy that claims the object.
pub const PP_PERMANENT_ID_LABEL: &str = "propagationpolicy.meridian.io/permanent-id";
pub const PP_NAMESPACE_ANNOTATION: &str = "propagationpolicy.meridian.io/namespace";
pub const PP_NAME_ANNOTATION: &str = "propagationpolicy.meridian.io/name";

/// Permanent ID of the cluster-scoped policy that claims the object.
pub const CPP_PERMANENT_ID_LABEL: &str = "clusterpropagationpolicy.meridian.io/permanent-id";
pub const CPP_NAME_ANNOTATION: &str = "clusterpropagationpolicy.meridian.io/name";

/// Templates carrying this label belong to another component and are never claimed.
pub const CLAIMED_BY_LABEL: &str = "resourcetemplate.meridian.io/claimed-by";

// Finalizers.

pub const PP_FINALIZER: &str = "meridian.io/propagation-policy-controller";
pub const CPP_FINALIZER: &str = "meridian.io/cluster-propagation-policy-controller";
pub const BINDING_FINALIZER: &str = "meridian.io/binding-controller";
pub const CLUSTER_BINDING_FINALIZER: &str = "meridian.io/cluster-resource-binding-controller";

// API groups.

pub const POLICY_GROUP: &str = "policy.meridian.io";
pub const POLICY_VERSION: &str = "v1alpha1";
pub const WORK_GROUP: &str = "work.meridian.io";
pub const WORK_VERSION: &str = "v1alpha2";

pub const PROPAGATION_POLICY_KIND: &str = "PropagationPolicy";
pub const CLUSTER_PROPAGATION_POLICY_KIND: &str = "ClusterPropagationPolicy";
pub const OVERRIDE_POLICY_KIND: &str = "OverridePolicy";
pub const CLUSTER_OVERRIDE_POLICY_KIND: &str = "ClusterOverridePolicy";
pub const RESOURCE_BINDING_KIND: &str = "ResourceBinding";
pub const CLUSTER_RESOURCE_BINDING_KIND: &str = "ClusterResourceBinding";

// Namespaces reserved for the control plane.

pub const SYSTEM_NAMESPACE: &str = "meridian-system";
pub const CLUSTER_NAMESPACE: &str = "meridian-cluster";
pub const EXECUTION_SPACE_PREFIX: &str = "meridian-es-";

pub fn propagation_policy_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(POLICY_GROUP, POLICY_VERSION, PROPAGATION_POLICY_KIND)
}

pub fn cluster_propagation_policy_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(POLICY_GROUP, POLICY_VERSION, CLUSTER_PROPAGATION_POLICY_KIND)
}

pub fn override_policy_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(POLICY_GROUP, POLICY_VERSION, OVERRIDE_POLICY_KIND)
}

pub fn cluster_override_policy_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(POLICY_GROUP, POLICY_VERSION, CLUSTER_OVERRIDE_POLICY_KIND)
}

pub fn resource_binding_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(WORK_GROUP, WORK_VERSION, RESOURCE_BINDING_KIND)
}

pub fn cluster_resource_binding_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(WORK_GROUP, WORK_VERSION, CLUSTER_RESOURCE_BINDING_KIND)
}

pub fn priority_class_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("scheduling.k8s.io", "v1", "PriorityClass")
}

/// Namespaces owned by the control plane; templates there are never propagated.
pub fn is_reserved_namespace(ns: &str) -> bool {
    ns == SYSTEM_NAMESPACE || ns == CLUSTER_NAMESPACE || ns.starts_with(EXECUTION_SPACE_PREFIX)
}

/// Name of the binding generated for a template: `lowercase(name-kind)`.
pub fn binding_name(kind: &str, name: &str) -> String {
    format!("{}-{}", name, kind).to_lowercase()
}

pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref().and_then(|m| m.get(key)).map(String::as_str)
}

pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref().and_then(|m| m.get(key)).map(String::as_str)
}

pub fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
}

pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
}

/// Remove the given label keys; returns whether anything changed.
pub fn remove_labels(meta: &mut ObjectMeta, keys: &[&str]) -> bool {
    remove_keys(&mut meta.labels, keys)
}

pub fn remove_annotations(meta: &mut ObjectMeta, keys: &[&str]) -> bool {
    remove_keys(&mut meta.annotations, keys)
}

fn remove_keys(map: &mut Option<BTreeMap<String, String>>, keys: &[&str]) -> bool {
    let Some(m) = map.as_mut() else { return false };
    let before = m.len();
    for k in keys {
        m.remove(*k);
    }
    let changed = m.len() != before;
    if m.is_empty() {
        *map = None;
    }
    changed
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
}

/// Add a finalizer if absent; returns whether it was added.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
    true
}

/// Remove a finalizer if present; returns whether it was removed.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(list) = meta.finalizers.as_mut() else { return false };
    let before = list.len();
    list.retain(|f| f != finalizer);
    let removed = list.len() != before;
    if list.is_empty() {
        meta.finalizers = None;
    }
    removed
}
