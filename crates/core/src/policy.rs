//! Typed views over propagation policies decoded from dynamic objects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::error::DetectorError;
use crate::keys::NamespacedKey;
use crate::labels::{self, label};

/// Whether a policy is namespaced or cluster-scoped. Both share one shape
/// and differ only in claim metadata keys and which templates they may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyScope {
    Namespaced,
    Cluster,
}

impl PolicyScope {
    pub fn gvk(self) -> GroupVersionKind {
        match self {
            PolicyScope::Namespaced => labels::propagation_policy_gvk(),
            PolicyScope::Cluster => labels::cluster_propagation_policy_gvk(),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            PolicyScope::Namespaced => labels::PROPAGATION_POLICY_KIND,
            PolicyScope::Cluster => labels::CLUSTER_PROPAGATION_POLICY_KIND,
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            labels::PROPAGATION_POLICY_KIND => Some(PolicyScope::Namespaced),
            labels::CLUSTER_PROPAGATION_POLICY_KIND => Some(PolicyScope::Cluster),
            _ => None,
        }
    }

    /// Label holding the permanent ID of the claiming policy.
    pub fn id_label(self) -> &'static str {
        match self {
            PolicyScope::Namespaced => labels::PP_PERMANENT_ID_LABEL,
            PolicyScope::Cluster => labels::CPP_PERMANENT_ID_LABEL,
        }
    }

    pub fn claim_annotations(self) -> &'static [&'static str] {
        match self {
            PolicyScope::Namespaced => &[labels::PP_NAMESPACE_ANNOTATION, labels::PP_NAME_ANNOTATION],
            PolicyScope::Cluster => &[labels::CPP_NAME_ANNOTATION],
        }
    }

    pub fn finalizer(self) -> &'static str {
        match self {
            PolicyScope::Namespaced => labels::PP_FINALIZER,
            PolicyScope::Cluster => labels::CPP_FINALIZER,
        }
    }

    /// Permanent ID this scope has stamped on `meta`, if any.
    pub fn claimed_id(self, meta: &ObjectMeta) -> Option<&str> {
        label(meta, self.id_label()).filter(|s| !s.is_empty())
    }

    /// Whether `meta` is claimed by exactly `policy_id` under this scope.
    pub fn is_claimed_by(self, meta: &ObjectMeta, policy_id: &str) -> bool {
        self.claimed_id(meta) == Some(policy_id)
    }

    /// Strip this scope's claim label and annotations; returns whether anything changed.
    pub fn strip_claim(self, meta: &mut ObjectMeta) -> bool {
        let l = labels::remove_labels(meta, &[self.id_label()]);
        let a = labels::remove_annotations(meta, self.claim_annotations());
        l || a
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreemptionBehavior {
    Always,
    #[default]
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationPreference {
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityClassSource {
    KubePriorityClass,
    PodPriorityClass,
    FederatedPriorityClass,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePriorityConfig {
    pub priority_class_source: PriorityClassSource,
    #[serde(default)]
    pub priority_class_name: String,
}

/// A predicate over resource templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

impl ResourceSelector {
    pub fn gvk(&self) -> Result<GroupVersionKind, DetectorError> {
        crate::keys::gvk_from_api_version(&self.api_version, &self.kind)
    }
}

/// The subset of a propagation policy spec this engine reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropagationSpec {
    pub resource_selectors: Vec<ResourceSelector>,
    pub priority: Option<i32>,
    pub preemption: PreemptionBehavior,
    pub activation_preference: Option<ActivationPreference>,
    pub propagate_deps: bool,
    pub scheduler_name: Option<String>,
    pub placement: Option<serde_json::Value>,
    pub failover: Option<serde_json::Value>,
    pub conflict_resolution: Option<String>,
    pub preserve_resources_on_deletion: Option<bool>,
    pub suspension: Option<serde_json::Value>,
    pub schedule_priority: Option<SchedulePriorityConfig>,
    pub dependent_overrides: Vec<String>,
}

/// A decoded policy of either scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub scope: PolicyScope,
    pub meta: ObjectMeta,
    pub spec: PropagationSpec,
}

impl Policy {
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, DetectorError> {
        let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
        let scope = PolicyScope::from_kind(kind)
            .ok_or_else(|| DetectorError::Selector(format!("not a propagation policy kind: {:?}", kind)))?;
        let spec = match obj.data.get("spec") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
            _ => PropagationSpec::default(),
        };
        Ok(Self { scope, meta: obj.metadata.clone(), spec })
    }

    pub fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        match self.scope {
            PolicyScope::Namespaced => self.meta.namespace.as_deref(),
            PolicyScope::Cluster => None,
        }
    }

    pub fn key(&self) -> NamespacedKey {
        NamespacedKey::new(self.namespace(), self.name())
    }

    pub fn permanent_id(&self) -> Option<&str> {
        label(&self.meta, self.scope.id_label()).filter(|s| !s.is_empty())
    }

    pub fn explicit_priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }

    pub fn is_deleting(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    pub fn preemption_enabled(&self) -> bool {
        self.spec.preemption == PreemptionBehavior::Always
    }

    pub fn lazy_activation(&self) -> bool {
        self.spec.activation_preference == Some(ActivationPreference::Lazy)
    }

    /// Write this policy's claim label and annotations onto `meta`.
    pub fn stamp_claim(&self, meta: &mut ObjectMeta, policy_id: &str) {
        labels::set_label(meta, self.scope.id_label(), policy_id);
        match self.scope {
            PolicyScope::Namespaced => {
                labels::set_annotation(meta, labels::PP_NAMESPACE_ANNOTATION, self.namespace().unwrap_or_default());
                labels::set_annotation(meta, labels::PP_NAME_ANNOTATION, self.name());
            }
            PolicyScope::Cluster => labels::set_annotation(meta, labels::CPP_NAME_ANNOTATION, self.name()),
        }
    }

    /// Human readable `Kind(namespace/name)`.
    pub fn describe(&self) -> String {
        format!("{}({})", self.scope.kind(), self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pp(spec: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "policy.meridian.io/v1alpha1",
            "kind": "PropagationPolicy",
            "metadata": {
                "name": "p1",
                "namespace": "default",
                "labels": { (labels::PP_PERMANENT_ID_LABEL): "id-1" }
            },
            "spec": spec,
        }))
        .expect("policy object")
    }

    #[test]
    fn decodes_spec_with_defaults() {
        let p = Policy::from_dynamic(&pp(json!({
            "resourceSelectors": [{ "apiVersion": "apps/v1", "kind": "Deployment", "namespace": "default" }],
            "priority": 10,
            "preemption": "Always",
            "activationPreference": "Lazy",
            "placement": { "clusterAffinity": { "clusterNames": ["m1"] } }
        })))
        .expect("decode");
        assert_eq!(p.scope, PolicyScope::Namespaced);
        assert_eq!(p.explicit_priority(), 10);
        assert!(p.preemption_enabled());
        assert!(p.lazy_activation());
        assert_eq!(p.permanent_id(), Some("id-1"));
        assert_eq!(p.key().to_string(), "default/p1");
        assert_eq!(p.spec.resource_selectors[0].kind, "Deployment");
        assert!(p.spec.dependent_overrides.is_empty());
    }

    #[test]
    fn missing_spec_defaults_to_priority_zero() {
        let mut obj = pp(json!({}));
        obj.data = json!({});
        let p = Policy::from_dynamic(&obj).expect("decode");
        assert_eq!(p.explicit_priority(), 0);
        assert!(!p.preemption_enabled());
    }

    #[test]
    fn unknown_priority_source_decodes_as_unknown() {
        let p = Policy::from_dynamic(&pp(json!({
            "schedulePriority": { "priorityClassSource": "Bogus", "priorityClassName": "x" }
        })))
        .expect("decode");
        assert_eq!(p.spec.schedule_priority.map(|s| s.priority_class_source), Some(PriorityClassSource::Unknown));
    }

    #[test]
    fn claim_stamp_and_strip() {
        let p = Policy::from_dynamic(&pp(json!({}))).expect("decode");
        let mut meta = ObjectMeta::default();
        p.stamp_claim(&mut meta, "id-1");
        assert!(PolicyScope::Namespaced.is_claimed_by(&meta, "id-1"));
        assert_eq!(labels::annotation(&meta, labels::PP_NAME_ANNOTATION), Some("p1"));
        assert!(!PolicyScope::Cluster.strip_claim(&mut meta));
        assert!(PolicyScope::Namespaced.strip_claim(&mut meta));
        assert!(meta.labels.is_none() && meta.annotations.is_none());
    }
}
