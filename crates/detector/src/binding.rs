//! Binding synthesis and create-or-update.

use std::time::Instant;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use meridian_core::binding::{
    binding_finalizer_for, binding_gvk_for, merge_finalizers, merge_owned_spec, merge_string_maps, BindingSpec,
    ObjectReference, SchedulePriority,
};
use meridian_core::policy::{PriorityClassSource, PropagationSpec};
use meridian_core::{labels, ClusterWideKey, DetectorError, Policy, PolicyScope, ResourceKey};
use meridian_kubehub::{create_or_update, ObjectStore, OperationResult};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::claim::claim_policy_for_object;
use crate::interpreter::InterpreterOperation;
use crate::retry::retry_on_conflict;
use crate::ResourceDetector;

fn controller_reference(template: &DynamicObject, key: &ClusterWideKey) -> OwnerReference {
    OwnerReference {
        api_version: key.api_version(),
        kind: key.kind.clone(),
        name: key.name.clone(),
        uid: template.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references.iter().flatten().find(|r| r.controller == Some(true))
}

fn spec_map(obj: &DynamicObject) -> Map<String, Value> {
    match obj.data.get("spec") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    }
}

/// Fold the desired binding into the live one.
///
/// Labels, annotations and finalizers are unions; owner references and the
/// detector-owned spec fields are replaced. A binding controlled by a
/// different template UID is left for garbage collection.
pub fn merge_binding(
    existing: &mut DynamicObject,
    desired: &DynamicObject,
    template_uid: &str,
    scope: PolicyScope,
) -> Result<(), DetectorError> {
    if let Some(owner) = controller_of(&existing.metadata) {
        if owner.uid != template_uid {
            return Err(DetectorError::StaleOwner {
                binding: existing.metadata.name.clone().unwrap_or_default(),
                owner_uid: owner.uid.clone(),
                template_uid: template_uid.to_string(),
            });
        }
    }
    existing.metadata.annotations =
        merge_string_maps(existing.metadata.annotations.take(), desired.metadata.annotations.as_ref());
    existing.metadata.labels = merge_string_maps(existing.metadata.labels.take(), desired.metadata.labels.as_ref());
    existing.metadata.finalizers =
        merge_finalizers(existing.metadata.finalizers.take(), desired.metadata.finalizers.as_ref());
    existing.metadata.owner_references = desired.metadata.owner_references.clone();

    let mut spec = spec_map(existing);
    merge_owned_spec(&mut spec, &spec_map(desired));
    match existing.data.as_object_mut() {
        Some(data) => {
            data.insert("spec".to_string(), Value::Object(spec));
        }
        None => existing.data = Value::Object(Map::from_iter([("spec".to_string(), Value::Object(spec))])),
    }

    if scope == PolicyScope::Namespaced {
        PolicyScope::Cluster.strip_claim(&mut existing.metadata);
    }
    Ok(())
}

/// Create or update the binding for `template`, retrying on conflicts.
pub async fn sync_binding(
    store: &dyn ObjectStore,
    template: &DynamicObject,
    gvk: &GroupVersionKind,
    desired: &DynamicObject,
    scope: PolicyScope,
) -> Result<OperationResult, DetectorError> {
    let template_uid = template.metadata.uid.as_deref().unwrap_or_default();
    retry_on_conflict(move || async move {
        let (result, _) =
            create_or_update(store, gvk, desired, |existing| merge_binding(existing, desired, template_uid, scope)).await?;
        Ok(result)
    })
    .await
}

impl ResourceDetector {
    /// Desired binding for `template` governed by `policy`.
    pub async fn build_binding(
        &self,
        template: &DynamicObject,
        policy: &Policy,
        policy_id: &str,
    ) -> Result<(GroupVersionKind, DynamicObject), DetectorError> {
        let key = ClusterWideKey::from_object(template)?;
        let namespaced = key.namespace().is_some();
        let gvk = binding_gvk_for(namespaced);

        let mut meta = ObjectMeta {
            name: Some(labels::binding_name(&key.kind, &key.name)),
            namespace: key.namespace().map(str::to_string),
            owner_references: Some(vec![controller_reference(template, &key)]),
            finalizers: Some(vec![binding_finalizer_for(namespaced).to_string()]),
            ..Default::default()
        };
        policy.stamp_claim(&mut meta, policy_id);

        let mut spec = binding_spec(&key, template, &policy.spec);
        let template_gvk = key.gvk();
        if self.interpreter.hook_enabled(&template_gvk, InterpreterOperation::InterpretReplica) {
            let (replicas, requirements) = self.interpreter.get_replicas(template)?;
            spec.replicas = Some(replicas);
            spec.replica_requirements = requirements;
        }
        spec.schedule_priority = self.schedule_priority(&policy.spec).await?;

        let binding = DynamicObject {
            types: Some(TypeMeta { api_version: format!("{}/{}", gvk.group, gvk.version), kind: gvk.kind.clone() }),
            metadata: meta,
            data: Value::Object(Map::from_iter([("spec".to_string(), Value::Object(spec.to_map()?))])),
        };
        Ok((gvk, binding))
    }

    async fn schedule_priority(&self, spec: &PropagationSpec) -> Result<Option<SchedulePriority>, DetectorError> {
        if !self.config.priority_based_scheduling {
            return Ok(None);
        }
        let Some(sp) = spec.schedule_priority.as_ref() else { return Ok(None) };
        match sp.priority_class_source {
            PriorityClassSource::KubePriorityClass => {
                let pc = self.store.get(&labels::priority_class_gvk(), None, &sp.priority_class_name).await?;
                let value = pc
                    .data
                    .get("value")
                    .and_then(Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| DetectorError::Selector(format!("priority class {} has no valid value", sp.priority_class_name)))?;
                Ok(Some(SchedulePriority { priority: value }))
            }
            other => Err(DetectorError::Unsupported(format!("priority class source {:?}", other))),
        }
    }

    /// Claim `template` for `policy` and bring its binding up to date.
    ///
    /// Changes made by the system itself only refresh the claim when the
    /// policy activates lazily.
    pub async fn apply_policy(
        &self,
        template: &DynamicObject,
        item: &ResourceKey,
        policy: &Policy,
    ) -> Result<Option<OperationResult>, DetectorError> {
        let start = Instant::now();
        let result = self.apply_policy_inner(template, item, policy).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("detector_apply_policy_total", 1u64, "result" => outcome);
        metrics::histogram!("detector_apply_policy_duration_seconds", start.elapsed().as_secs_f64(), "result" => outcome);
        if let Err(e) = &result {
            warn!(resource = %item.key, policy = %policy.describe(), error = %e, "apply policy failed");
        }
        result
    }

    async fn apply_policy_inner(
        &self,
        template: &DynamicObject,
        item: &ResourceKey,
        policy: &Policy,
    ) -> Result<Option<OperationResult>, DetectorError> {
        info!(resource = %item.key, policy = %policy.describe(), "applying policy");
        let (policy_id, template) = claim_policy_for_object(self.store.as_ref(), template, policy).await?;

        if item.change_by_system && policy.lazy_activation() {
            info!(resource = %item.key, policy = %policy.describe(), "skip binding refresh: system change under lazy activation");
            return Ok(None);
        }

        let (gvk, desired) = self.build_binding(&template, policy, &policy_id).await?;
        let result = sync_binding(self.store.as_ref(), &template, &gvk, &desired, policy.scope).await?;
        let name = desired.metadata.name.as_deref().unwrap_or_default();
        match result {
            OperationResult::Created => info!(kind = %gvk.kind, namespace = ?desired.metadata.namespace, name, "binding created"),
            OperationResult::Updated => info!(kind = %gvk.kind, namespace = ?desired.metadata.namespace, name, "binding updated"),
            OperationResult::Unchanged => debug!(kind = %gvk.kind, name, "binding up to date"),
        }
        Ok(Some(result))
    }
}

fn binding_spec(key: &ClusterWideKey, template: &DynamicObject, spec: &PropagationSpec) -> BindingSpec {
    BindingSpec {
        resource: ObjectReference {
            api_version: key.api_version(),
            kind: key.kind.clone(),
            namespace: key.namespace().map(str::to_string),
            name: key.name.clone(),
            uid: template.metadata.uid.clone(),
            resource_version: template.metadata.resource_version.clone(),
        },
        propagate_deps: spec.propagate_deps,
        scheduler_name: spec.scheduler_name.clone(),
        placement: Some(spec.placement.clone().unwrap_or_else(|| json!({}))),
        replicas: None,
        replica_requirements: None,
        failover: spec.failover.clone(),
        conflict_resolution: spec.conflict_resolution.clone(),
        preserve_resources_on_deletion: spec.preserve_resources_on_deletion,
        suspension: spec.suspension.clone(),
        schedule_priority: None,
    }
}
