//! Claim metadata on templates and bindings.

use anyhow::anyhow;
use kube::core::{DynamicObject, GroupVersionKind};
use meridian_core::binding::BindingSpec;
use meridian_core::{labels, ClusterWideKey, DetectorError, Policy, PolicyScope, StoreError};
use meridian_kubehub::ObjectStore;
use tracing::{debug, info};

use crate::retry::retry_on_conflict;

/// Stamp `policy`'s claim on `template`, writing only when something changes.
///
/// A namespaced claim also drops any cluster-scoped claim. Templates carrying
/// the claimed-by label belong to another controller and are refused.
/// Returns the policy's permanent ID and the (possibly updated) template.
pub async fn claim_policy_for_object(
    store: &dyn ObjectStore,
    template: &DynamicObject,
    policy: &Policy,
) -> Result<(String, DynamicObject), DetectorError> {
    let key = ClusterWideKey::from_object(template)?;
    if let Some(owner) = labels::label(&template.metadata, labels::CLAIMED_BY_LABEL) {
        return Err(DetectorError::ClaimedElsewhere { resource: key.to_string(), claimed_by: owner.to_string() });
    }
    let policy_id = policy
        .permanent_id()
        .ok_or_else(|| anyhow!("{} has no permanent id yet", policy.describe()))?
        .to_string();

    let foreign_cluster_claim =
        policy.scope == PolicyScope::Namespaced && PolicyScope::Cluster.claimed_id(&template.metadata).is_some();
    if policy.scope.is_claimed_by(&template.metadata, &policy_id) && !foreign_cluster_claim {
        return Ok((policy_id, template.clone()));
    }

    let mut claimed = template.clone();
    if policy.scope == PolicyScope::Namespaced {
        PolicyScope::Cluster.strip_claim(&mut claimed.metadata);
    }
    policy.stamp_claim(&mut claimed.metadata, &policy_id);
    let updated = store.update(&key.gvk(), &claimed).await?;
    info!(resource = %key, policy = %policy.describe(), "claimed resource template");
    metrics::counter!("detector_claims_total", 1u64, "scope" => policy.scope.kind());
    Ok((policy_id, updated))
}

/// Remove `scope`'s claim from the named object if it still carries
/// `policy_id`. Re-reads on conflict. Returns whether a write happened.
pub async fn cleanup_claim(
    store: &dyn ObjectStore,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
    scope: PolicyScope,
    policy_id: &str,
) -> Result<bool, DetectorError> {
    let changed = retry_on_conflict(move || async move {
        let mut obj = match store.get(gvk, namespace, name).await {
            Ok(o) => o,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !scope.is_claimed_by(&obj.metadata, policy_id) {
            return Ok(false);
        }
        scope.strip_claim(&mut obj.metadata);
        store.update(gvk, &obj).await?;
        Ok(true)
    })
    .await?;
    if changed {
        debug!(kind = %gvk.kind, namespace = namespace.unwrap_or_default(), name, policy_id, "claim metadata removed");
        metrics::counter!("detector_claim_cleanups_total", 1u64, "scope" => scope.kind());
    }
    Ok(changed)
}

/// Unclaim the template a binding points at, then the binding itself.
/// The binding is left alone when the template step fails.
pub async fn cleanup_binding_claims(
    store: &dyn ObjectStore,
    binding_gvk: &GroupVersionKind,
    binding: &DynamicObject,
    scope: PolicyScope,
    policy_id: &str,
) -> Result<ClusterWideKey, DetectorError> {
    let spec = BindingSpec::from_dynamic(binding)?;
    let template = ClusterWideKey::from_reference(&spec.resource)?;
    cleanup_claim(store, &template.gvk(), template.namespace(), &template.name, scope, policy_id).await?;
    let name = binding.metadata.name.as_deref().unwrap_or_default();
    cleanup_claim(store, binding_gvk, binding.metadata.namespace.as_deref(), name, scope, policy_id).await?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kubehub::MemStore;
    use serde_json::json;

    fn deploy() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "default" }
        }))
        .expect("deploy")
    }

    fn policy(kind: &str, namespace: Option<&str>, id: &str) -> Policy {
        let scope = PolicyScope::from_kind(kind).expect("scope");
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "policy.meridian.io/v1alpha1", "kind": kind,
            "metadata": { "name": "p", "namespace": namespace, "labels": { (scope.id_label()): id } },
            "spec": {}
        }))
        .expect("policy");
        Policy::from_dynamic(&obj).expect("decode")
    }

    #[tokio::test]
    async fn claim_is_idempotent() {
        let store = MemStore::new("m");
        let t = store.apply(deploy()).expect("apply");
        let pp = policy("PropagationPolicy", Some("default"), "pp-1");
        let (id, claimed) = claim_policy_for_object(&store, &t, &pp).await.expect("claim");
        assert_eq!(id, "pp-1");
        assert_eq!(store.writes(), 1);
        claim_policy_for_object(&store, &claimed, &pp).await.expect("again");
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn namespaced_claim_replaces_cluster_claim() {
        let store = MemStore::new("m");
        let t = store.apply(deploy()).expect("apply");
        let cpp = policy("ClusterPropagationPolicy", None, "cpp-1");
        let (_, t) = claim_policy_for_object(&store, &t, &cpp).await.expect("cpp claim");
        let pp = policy("PropagationPolicy", Some("default"), "pp-1");
        let (_, t) = claim_policy_for_object(&store, &t, &pp).await.expect("pp claim");
        assert!(PolicyScope::Namespaced.is_claimed_by(&t.metadata, "pp-1"));
        assert!(PolicyScope::Cluster.claimed_id(&t.metadata).is_none());
        assert!(labels::annotation(&t.metadata, labels::CPP_NAME_ANNOTATION).is_none());
    }

    #[tokio::test]
    async fn claimed_by_label_is_refused() {
        let store = MemStore::new("m");
        let mut d = deploy();
        labels::set_label(&mut d.metadata, labels::CLAIMED_BY_LABEL, "other");
        let t = store.apply(d).expect("apply");
        let err = claim_policy_for_object(&store, &t, &policy("PropagationPolicy", Some("default"), "x")).await.unwrap_err();
        assert!(matches!(err, DetectorError::ClaimedElsewhere { .. }));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn cleanup_only_touches_matching_claim_and_survives_conflicts() {
        let store = MemStore::new("m");
        let t = store.apply(deploy()).expect("apply");
        let pp = policy("PropagationPolicy", Some("default"), "pp-1");
        claim_policy_for_object(&store, &t, &pp).await.expect("claim");
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");

        let other = cleanup_claim(&store, &gvk, Some("default"), "web", PolicyScope::Namespaced, "pp-2").await.expect("noop");
        assert!(!other);

        store.fail_next_updates(2);
        let changed = cleanup_claim(&store, &gvk, Some("default"), "web", PolicyScope::Namespaced, "pp-1").await.expect("cleanup");
        assert!(changed);
        let live = store.peek(&gvk, Some("default"), "web").expect("live");
        assert!(PolicyScope::Namespaced.claimed_id(&live.metadata).is_none());

        let missing = cleanup_claim(&store, &gvk, Some("default"), "gone", PolicyScope::Namespaced, "pp-1").await.expect("missing");
        assert!(!missing);
    }
}
