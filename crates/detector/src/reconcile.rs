//! Worker entry points for templates and policies.

use std::time::Instant;

use kube::core::{DynamicObject, GroupVersionKind};
use meridian_core::binding::{binding_gvk_for, BindingSpec};
use meridian_core::error::aggregate;
use meridian_core::{labels, ClusterWideKey, DetectorError, Policy, PolicyScope, ResourceKey, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::claim::{cleanup_binding_claims, cleanup_claim};
use crate::matcher::{implicit_priority, select_policy};
use crate::retry::retry_on_conflict;
use crate::{PolicyQueueKey, ResourceDetector};

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}

/// Whether any of the policy's selectors matches `obj`.
pub fn policy_selects(obj: &DynamicObject, policy: &Policy) -> bool {
    implicit_priority(obj, policy) != meridian_core::selector::ImplicitPriority::Mismatch
}

impl ResourceDetector {
    /// Reconcile one resource template.
    pub async fn reconcile_resource(&self, item: ResourceKey) -> Result<(), DetectorError> {
        let key = &item.key;
        debug!(resource = %key, by_system = item.change_by_system, "reconciling resource template");
        let template = match self.store.get(&key.gvk(), key.namespace(), &key.name).await {
            Ok(o) => o,
            Err(StoreError::NotFound(_)) => {
                self.waiting.remove(key);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if labels::label(&template.metadata, labels::CLAIMED_BY_LABEL).is_some() {
            debug!(resource = %key, "template is claimed by another controller");
            self.waiting.remove(key);
            return Ok(());
        }
        self.propagate_resource(&template, &item).await
    }

    async fn propagate_resource(&self, template: &DynamicObject, item: &ResourceKey) -> Result<(), DetectorError> {
        let meta = &template.metadata;
        if let Some(id) = PolicyScope::Namespaced.claimed_id(meta) {
            let ns = non_empty(labels::annotation(meta, labels::PP_NAMESPACE_ANNOTATION));
            let name = non_empty(labels::annotation(meta, labels::PP_NAME_ANNOTATION));
            if let (Some(ns), Some(name)) = (ns, name) {
                return self.apply_claimed_policy(template, item, PolicyScope::Namespaced, Some(ns), name, id).await;
            }
        }
        if let Some(id) = PolicyScope::Cluster.claimed_id(meta) {
            if let Some(name) = non_empty(labels::annotation(meta, labels::CPP_NAME_ANNOTATION)) {
                return self.apply_claimed_policy(template, item, PolicyScope::Cluster, None, name, id).await;
            }
        }

        let start = Instant::now();
        for scope in [PolicyScope::Namespaced, PolicyScope::Cluster] {
            if let Some(policy) = self.look_for_matched_policy(template, &item.key, scope).await? {
                self.ensure_dependent_overrides(&policy).await?;
                self.waiting.remove(&item.key);
                metrics::histogram!("detector_find_matched_policy_duration_seconds", start.elapsed().as_secs_f64());
                return self.apply_policy(template, item, &policy).await.map(|_| ());
            }
        }

        if self.waiting.contains(&item.key) {
            debug!(resource = %item.key, "no matching policy");
            return Ok(());
        }
        // first miss: the template and its policy may have arrived together
        self.waiting.add(item.key.clone());
        self.processor.add_rate_limited(item.clone());
        Ok(())
    }

    /// Template already carries a claim: reuse that policy if it still exists.
    async fn apply_claimed_policy(
        &self,
        template: &DynamicObject,
        item: &ResourceKey,
        scope: PolicyScope,
        namespace: Option<&str>,
        name: &str,
        claimed_id: &str,
    ) -> Result<(), DetectorError> {
        let policy = match self.store.get(&scope.gvk(), namespace, name).await {
            Ok(obj) => Some(Policy::from_dynamic(&obj)?),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let policy = match policy {
            Some(p) if p.permanent_id() == Some(claimed_id) => p,
            _ => {
                info!(resource = %item.key, policy = name, "claiming policy is gone, releasing claim");
                self.release_claim(&item.key, scope, claimed_id).await?;
                self.processor.add(ResourceKey::system(item.key.clone()));
                return Ok(());
            }
        };
        if policy.is_deleting() {
            debug!(resource = %item.key, policy = %policy.describe(), "claiming policy is being deleted");
            return Ok(());
        }
        // same kind served by several groups: only the selected one propagates
        if !policy_selects(template, &policy) {
            debug!(resource = %item.key, policy = %policy.describe(), "claiming policy no longer selects template");
            return Ok(());
        }
        self.ensure_dependent_overrides(&policy).await?;
        self.apply_policy(template, item, &policy).await.map(|_| ())
    }

    /// Strip `scope`'s claim from a template and then from its binding.
    async fn release_claim(&self, key: &ClusterWideKey, scope: PolicyScope, policy_id: &str) -> Result<(), DetectorError> {
        let store = self.store.as_ref();
        cleanup_claim(store, &key.gvk(), key.namespace(), &key.name, scope, policy_id).await?;
        let binding_gvk = binding_gvk_for(key.namespace().is_some());
        let binding = labels::binding_name(&key.kind, &key.name);
        cleanup_claim(store, &binding_gvk, key.namespace(), &binding, scope, policy_id).await?;
        Ok(())
    }

    /// Decoded policies of `scope` visible from `namespace`. Undecodable ones are skipped.
    pub(crate) async fn list_policies(&self, scope: PolicyScope, namespace: Option<&str>) -> Result<Vec<Policy>, DetectorError> {
        let objs = self.store.list(&scope.gvk(), namespace, None).await?;
        Ok(objs
            .iter()
            .filter_map(|o| match Policy::from_dynamic(o) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(kind = scope.kind(), name = ?o.metadata.name, error = %e, "skipping undecodable policy");
                    None
                }
            })
            .collect())
    }

    /// Highest-priority policy of `scope` matching the template. Cluster
    /// templates are never matched by namespaced policies.
    pub async fn look_for_matched_policy(
        &self,
        template: &DynamicObject,
        key: &ClusterWideKey,
        scope: PolicyScope,
    ) -> Result<Option<Policy>, DetectorError> {
        let namespace = match scope {
            PolicyScope::Namespaced => match key.namespace() {
                Some(ns) => Some(ns),
                None => return Ok(None),
            },
            PolicyScope::Cluster => None,
        };
        let candidates = self.list_policies(scope, namespace).await?;
        let chosen = select_policy(template, candidates);
        if let Some(p) = &chosen {
            debug!(resource = %key, policy = %p.describe(), "matched policy");
        }
        Ok(chosen)
    }

    /// Fail with a retryable error until every dependent override policy exists.
    pub(crate) async fn ensure_dependent_overrides(&self, policy: &Policy) -> Result<(), DetectorError> {
        if policy.spec.dependent_overrides.is_empty() {
            return Ok(());
        }
        let gvk = match policy.scope {
            PolicyScope::Namespaced => labels::override_policy_gvk(),
            PolicyScope::Cluster => labels::cluster_override_policy_gvk(),
        };
        let mut missing = Vec::new();
        for name in &policy.spec.dependent_overrides {
            match self.store.get(&gvk, policy.namespace(), name).await {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => missing.push(name.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        info!(policy = %policy.describe(), ?missing, "waiting for dependent overrides");
        Err(DetectorError::DependentOverridesMissing { policy: policy.describe(), missing })
    }

    /// Requeue a template after a policy change. Lazily activated policies
    /// only refresh claims, so the key is marked as a system change.
    pub(crate) fn enqueue_for_policy_change(&self, key: ClusterWideKey, policy: &Policy) {
        let item = if policy.lazy_activation() { ResourceKey::system(key) } else { ResourceKey::user(key) };
        self.processor.add(item);
    }

    /// Reconcile one policy queue item.
    pub async fn reconcile_policy(&self, scope: PolicyScope, item: PolicyQueueKey) -> Result<(), DetectorError> {
        let key = match item {
            PolicyQueueKey::Deprioritized { key, old_priority, new_priority } => {
                return self.handle_deprioritized_policy(scope, &key, old_priority, new_priority).await;
            }
            PolicyQueueKey::Reconcile(key) => key,
        };
        debug!(kind = scope.kind(), policy = %key, "reconciling policy");
        let obj = match self.store.get(&scope.gvk(), key.namespace(), &key.name).await {
            Ok(o) => o,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let policy = Policy::from_dynamic(&obj)?;
        if policy.is_deleting() {
            self.handle_policy_deletion(&policy).await?;
            return self.remove_policy_finalizer(&policy).await;
        }
        self.handle_policy_creation_or_update(policy).await
    }

    /// Make sure the policy has a permanent ID and carries its finalizer.
    async fn ensure_policy_identity(&self, policy: Policy) -> Result<Policy, DetectorError> {
        let scope = policy.scope;
        if policy.permanent_id().is_some() && labels::has_finalizer(&policy.meta, scope.finalizer()) {
            return Ok(policy);
        }
        let store = self.store.as_ref();
        let gvk = &scope.gvk();
        let key = &policy.key();
        let updated = retry_on_conflict(move || async move {
            let mut obj = store.get(gvk, key.namespace(), &key.name).await?;
            let mut changed = false;
            if non_empty(labels::label(&obj.metadata, scope.id_label())).is_none() {
                labels::set_label(&mut obj.metadata, scope.id_label(), &Uuid::new_v4().to_string());
                changed = true;
            }
            changed |= labels::add_finalizer(&mut obj.metadata, scope.finalizer());
            if changed {
                obj = store.update(gvk, &obj).await?;
            }
            Ok(obj)
        })
        .await?;
        let policy = Policy::from_dynamic(&updated)?;
        info!(policy = %policy.describe(), id = policy.permanent_id().unwrap_or_default(), "policy identity ensured");
        Ok(policy)
    }

    /// Bindings carrying `policy_id`: namespaced policies see their own
    /// namespace, cluster policies see every namespace plus cluster bindings.
    pub(crate) async fn list_claimed_bindings(
        &self,
        scope: PolicyScope,
        policy_id: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<(GroupVersionKind, DynamicObject)>, DetectorError> {
        let selector = format!("{}={}", scope.id_label(), policy_id);
        let mut out = Vec::new();
        let rb = labels::resource_binding_gvk();
        for b in self.store.list(&rb, namespace, Some(&selector)).await? {
            out.push((rb.clone(), b));
        }
        if scope == PolicyScope::Cluster {
            let crb = labels::cluster_resource_binding_gvk();
            for b in self.store.list(&crb, None, Some(&selector)).await? {
                out.push((crb.clone(), b));
            }
        }
        Ok(out)
    }

    async fn handle_policy_creation_or_update(&self, policy: Policy) -> Result<(), DetectorError> {
        let policy = self.ensure_policy_identity(policy).await?;
        let Some(policy_id) = policy.permanent_id().map(str::to_string) else {
            return Err(DetectorError::Other(anyhow::anyhow!("{} has no permanent id", policy.describe())));
        };
        let store = self.store.as_ref();
        let mut errs: Vec<DetectorError> = Vec::new();

        for (gvk, binding) in self.list_claimed_bindings(policy.scope, &policy_id, policy.namespace()).await? {
            let template_key = match BindingSpec::from_dynamic(&binding).and_then(|s| ClusterWideKey::from_reference(&s.resource)) {
                Ok(k) => k,
                Err(e) => {
                    warn!(binding = ?binding.metadata.name, error = %e, "binding has no usable resource reference");
                    continue;
                }
            };
            let template = match store.get(&template_key.gvk(), template_key.namespace(), &template_key.name).await {
                Ok(t) => t,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    errs.push(e.into());
                    continue;
                }
            };
            if policy_selects(&template, &policy) {
                self.enqueue_for_policy_change(template_key, &policy);
                continue;
            }
            info!(resource = %template_key, policy = %policy.describe(), "template no longer selected, releasing");
            match cleanup_binding_claims(store, &gvk, &binding, policy.scope, &policy_id).await {
                Ok(k) => self.processor.add(ResourceKey::system(k)),
                Err(e) => errs.push(e),
            }
        }

        let matched = self.waiting.get_matching(store, &policy.spec.resource_selectors, policy.namespace()).await;
        if !matched.is_empty() {
            self.ensure_dependent_overrides(&policy).await?;
            for key in matched {
                self.waiting.remove(&key);
                self.enqueue_for_policy_change(key, &policy);
            }
        }

        if self.config.policy_preemption && policy.preemption_enabled() {
            if let Err(e) = self.handle_preemption(&policy).await {
                errs.push(e);
            }
        }
        aggregate(errs)
    }
}
