//! Policy preemption: a preempting policy takes templates away from
//! lower-priority claimants.

use kube::core::DynamicObject;
use meridian_core::binding::binding_gvk_for;
use meridian_core::error::aggregate;
use meridian_core::selector::resource_matches;
use meridian_core::{labels, ClusterWideKey, DetectorError, NamespacedKey, Policy, PolicyScope, StoreError};
use tracing::{debug, info, warn};

use crate::claim::{claim_policy_for_object, cleanup_claim};
use crate::{PolicyQueueKey, ResourceDetector};

impl ResourceDetector {
    /// Preempt every template selected by `policy` that is claimed by a
    /// weaker policy.
    pub(crate) async fn handle_preemption(&self, policy: &Policy) -> Result<(), DetectorError> {
        info!(policy = %policy.describe(), priority = policy.explicit_priority(), "running preemption");
        let mut errs: Vec<DetectorError> = Vec::new();
        for rs in &policy.spec.resource_selectors {
            let gvk = match rs.gvk() {
                Ok(g) => g,
                Err(e) => {
                    warn!(policy = %policy.describe(), error = %e, "skipping malformed resource selector");
                    continue;
                }
            };
            let selector_ns = rs.namespace.as_deref().filter(|s| !s.is_empty());
            let namespace = match policy.scope {
                PolicyScope::Namespaced => {
                    if selector_ns.is_some() && selector_ns != policy.namespace() {
                        continue;
                    }
                    policy.namespace()
                }
                PolicyScope::Cluster => selector_ns,
            };
            let templates = match self.store.list(&gvk, namespace, None).await {
                Ok(t) => t,
                Err(StoreError::UnknownKind(_)) => continue,
                Err(e) => {
                    errs.push(e.into());
                    continue;
                }
            };
            for template in templates {
                match resource_matches(&template, rs) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(policy = %policy.describe(), error = %e, "skipping malformed resource selector");
                        break;
                    }
                }
                if labels::label(&template.metadata, labels::CLAIMED_BY_LABEL).is_some() || !self.event_filter(&template) {
                    continue;
                }
                if let Err(e) = self.preempt_template(policy, &template).await {
                    errs.push(e);
                }
            }
        }
        aggregate(errs)
    }

    async fn preempt_template(&self, policy: &Policy, template: &DynamicObject) -> Result<(), DetectorError> {
        let own_id = policy.permanent_id().unwrap_or_default();
        let meta = &template.metadata;
        let (old_scope, old_id) = match (PolicyScope::Namespaced.claimed_id(meta), PolicyScope::Cluster.claimed_id(meta)) {
            (Some(id), _) => (PolicyScope::Namespaced, id),
            (None, Some(id)) => (PolicyScope::Cluster, id),
            (None, None) => return Ok(()),
        };
        if old_scope == policy.scope && old_id == own_id {
            return Ok(());
        }
        // a namespaced policy always outranks a cluster-scoped one
        match (policy.scope, old_scope) {
            (PolicyScope::Cluster, PolicyScope::Namespaced) => return Ok(()),
            (PolicyScope::Namespaced, PolicyScope::Cluster) => {}
            _ => {
                if let Some(current) = self.claiming_policy(template, old_scope, old_id).await? {
                    if current.explicit_priority() >= policy.explicit_priority() {
                        debug!(
                            policy = %policy.describe(),
                            holder = %current.describe(),
                            "claimant has equal or higher priority, not preempting"
                        );
                        return Ok(());
                    }
                }
            }
        }
        self.preempt(template, policy, old_scope, old_id).await
    }

    /// The live policy behind a claim, if it still exists under that ID.
    async fn claiming_policy(
        &self,
        template: &DynamicObject,
        scope: PolicyScope,
        policy_id: &str,
    ) -> Result<Option<Policy>, DetectorError> {
        let meta = &template.metadata;
        let (namespace, name) = match scope {
            PolicyScope::Namespaced => (
                labels::annotation(meta, labels::PP_NAMESPACE_ANNOTATION),
                labels::annotation(meta, labels::PP_NAME_ANNOTATION),
            ),
            PolicyScope::Cluster => (None, labels::annotation(meta, labels::CPP_NAME_ANNOTATION)),
        };
        let Some(name) = name.filter(|n| !n.is_empty()) else { return Ok(None) };
        match self.store.get(&scope.gvk(), namespace, name).await {
            Ok(obj) => {
                let p = Policy::from_dynamic(&obj)?;
                Ok((p.permanent_id() == Some(policy_id)).then_some(p))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a template from its current claimant to `policy`: unclaim the
    /// binding, re-claim the template, then requeue it.
    async fn preempt(
        &self,
        template: &DynamicObject,
        policy: &Policy,
        old_scope: PolicyScope,
        old_id: &str,
    ) -> Result<(), DetectorError> {
        let key = ClusterWideKey::from_object(template)?;
        let binding_gvk = binding_gvk_for(key.namespace().is_some());
        let binding = labels::binding_name(&key.kind, &key.name);
        cleanup_claim(self.store.as_ref(), &binding_gvk, key.namespace(), &binding, old_scope, old_id).await?;
        // the new claim overwrites a same-scope claim; a namespaced claim also drops a cluster one
        claim_policy_for_object(self.store.as_ref(), template, policy).await?;
        info!(resource = %key, policy = %policy.describe(), from = old_id, "preempted resource template");
        metrics::counter!("detector_preemptions_total", 1u64, "scope" => policy.scope.kind());
        self.enqueue_for_policy_change(key, policy);
        Ok(())
    }

    /// Give preempting policies whose priority lies in
    /// `(new_priority, old_priority]` a chance to take over, highest first.
    pub(crate) async fn handle_deprioritized_policy(
        &self,
        scope: PolicyScope,
        key: &NamespacedKey,
        old_priority: i32,
        new_priority: i32,
    ) -> Result<(), DetectorError> {
        info!(kind = scope.kind(), policy = %key, old_priority, new_priority, "policy deprioritized");
        let namespace = match scope {
            PolicyScope::Namespaced => key.namespace(),
            PolicyScope::Cluster => None,
        };
        let mut candidates: Vec<Policy> = self
            .list_policies(scope, namespace)
            .await?
            .into_iter()
            .filter(|p| !p.is_deleting() && p.preemption_enabled())
            .filter(|p| p.explicit_priority() > new_priority && p.explicit_priority() <= old_priority)
            .collect();
        candidates.sort_by(|a, b| b.explicit_priority().cmp(&a.explicit_priority()).then_with(|| a.name().cmp(b.name())));
        let worker = self.policy_worker(scope);
        for p in candidates {
            debug!(policy = %p.describe(), "requeue preempting policy");
            worker.add(PolicyQueueKey::Reconcile(p.key()));
        }
        Ok(())
    }
}
