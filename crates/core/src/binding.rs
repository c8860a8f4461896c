//! Binding spec as written by the detector, and the merge rule that keeps
//! scheduler-owned fields intact.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DetectorError;
use crate::labels;

/// Reference from a binding back to its resource template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_node_affinity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Value>>,
}

/// Per-replica scheduling requirements derived from a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_claim: Option<NodeClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_request: Option<BTreeMap<String, Quantity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePriority {
    pub priority: i32,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Fields of a binding spec owned by the detector.
///
/// Anything else under `spec` (notably `clusters`) belongs to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    pub resource: ObjectReference,
    #[serde(default, skip_serializing_if = "is_false")]
    pub propagate_deps: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_requirements: Option<ReplicaRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_resources_on_deletion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_priority: Option<SchedulePriority>,
}

/// Spec keys replaced wholesale on every sync. `suspension` is merged separately.
pub const OWNED_SPEC_FIELDS: &[&str] = &[
    "resource",
    "propagateDeps",
    "schedulerName",
    "placement",
    "replicas",
    "replicaRequirements",
    "failover",
    "conflictResolution",
    "preserveResourcesOnDeletion",
    "schedulePriority",
];

/// Scheduler-controlled part of `spec.suspension`.
const SCHEDULING_SUSPENSION: &str = "scheduling";

impl BindingSpec {
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, DetectorError> {
        let spec = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| DetectorError::Selector(format!("binding {:?} has no spec", obj.metadata.name)))?;
        Ok(serde_json::from_value(spec)?)
    }

    pub fn to_map(&self) -> Result<Map<String, Value>, DetectorError> {
        match serde_json::to_value(self)? {
            Value::Object(m) => Ok(m),
            other => Err(DetectorError::Selector(format!("binding spec encoded as non-object: {}", other))),
        }
    }
}

/// Overlay the detector-owned fields of `desired` onto `existing`.
///
/// Owned fields absent from `desired` are removed. `suspension` is replaced
/// except for its scheduler-owned `scheduling` flag, which is carried over.
/// Every other key of `existing` is left untouched.
pub fn merge_owned_spec(existing: &mut Map<String, Value>, desired: &Map<String, Value>) {
    for field in OWNED_SPEC_FIELDS {
        match desired.get(*field) {
            Some(v) => {
                existing.insert((*field).to_string(), v.clone());
            }
            None => {
                existing.remove(*field);
            }
        }
    }
    if let Some(Value::Object(want)) = desired.get("suspension") {
        let scheduling = existing.get("suspension").and_then(|s| s.get(SCHEDULING_SUSPENSION)).cloned();
        let mut merged = want.clone();
        merged.remove(SCHEDULING_SUSPENSION);
        if let Some(s) = scheduling {
            merged.insert(SCHEDULING_SUSPENSION.to_string(), s);
        }
        existing.insert("suspension".to_string(), Value::Object(merged));
    }
}

/// Merge string maps; entries from `desired` win on key collision.
pub fn merge_string_maps(
    existing: Option<BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut out = existing.unwrap_or_default();
    if let Some(d) = desired {
        out.extend(d.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Union of finalizer lists, existing order first, without duplicates.
pub fn merge_finalizers(existing: Option<Vec<String>>, desired: Option<&Vec<String>>) -> Option<Vec<String>> {
    let mut out = existing.unwrap_or_default();
    for f in desired.into_iter().flatten() {
        if !out.contains(f) {
            out.push(f.clone());
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Binding kind for a template: namespaced templates get a `ResourceBinding`.
pub fn binding_gvk_for(namespaced: bool) -> GroupVersionKind {
    if namespaced { labels::resource_binding_gvk() } else { labels::cluster_resource_binding_gvk() }
}

pub fn binding_finalizer_for(namespaced: bool) -> &'static str {
    if namespaced { labels::BINDING_FINALIZER } else { labels::CLUSTER_BINDING_FINALIZER }
}
