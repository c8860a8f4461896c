//! Releasing everything a deleted policy claimed.

use std::collections::BTreeSet;

use meridian_core::error::aggregate;
use meridian_core::{labels, ClusterWideKey, DetectorError, Policy, PolicyScope, ResourceKey, StoreError};
use tracing::{debug, info, warn};

use crate::claim::{cleanup_binding_claims, cleanup_claim};
use crate::retry::retry_on_conflict;
use crate::ResourceDetector;

impl ResourceDetector {
    /// Strip the policy's claim from the templates its selectors cover and
    /// from every binding labelled with its permanent ID, then requeue the
    /// released templates so they can match again.
    pub async fn handle_policy_deletion(&self, policy: &Policy) -> Result<(), DetectorError> {
        let Some(policy_id) = policy.permanent_id() else {
            debug!(policy = %policy.describe(), "deleted policy never claimed anything");
            return Ok(());
        };
        info!(policy = %policy.describe(), id = policy_id, "releasing claims of deleted policy");
        let scope = policy.scope;
        let store = self.store.as_ref();
        let claimed = format!("{}={}", scope.id_label(), policy_id);
        let mut released: BTreeSet<ClusterWideKey> = BTreeSet::new();
        let mut errs: Vec<DetectorError> = Vec::new();

        for rs in &policy.spec.resource_selectors {
            let gvk = match rs.gvk() {
                Ok(g) => g,
                Err(e) => {
                    warn!(policy = %policy.describe(), error = %e, "skipping malformed resource selector");
                    continue;
                }
            };
            let namespace = match scope {
                PolicyScope::Namespaced => policy.namespace(),
                PolicyScope::Cluster => rs.namespace.as_deref().filter(|s| !s.is_empty()),
            };
            let templates = match store.list(&gvk, namespace, Some(&claimed)).await {
                Ok(t) => t,
                Err(StoreError::UnknownKind(_)) => continue,
                Err(e) => {
                    errs.push(e.into());
                    continue;
                }
            };
            for t in templates {
                let key = match ClusterWideKey::from_object(&t) {
                    Ok(k) => k,
                    Err(e) => {
                        errs.push(e);
                        continue;
                    }
                };
                match cleanup_claim(store, &gvk, key.namespace(), &key.name, scope, policy_id).await {
                    Ok(_) => {
                        released.insert(key);
                    }
                    Err(e) => errs.push(e),
                }
            }
        }

        for (gvk, binding) in self.list_claimed_bindings(scope, policy_id, policy.namespace()).await? {
            match cleanup_binding_claims(store, &gvk, &binding, scope, policy_id).await {
                Ok(key) => {
                    released.insert(key);
                }
                Err(e) => {
                    warn!(binding = ?binding.metadata.name, error = %e, "failed to release binding claim");
                    errs.push(e);
                }
            }
        }

        metrics::counter!("detector_released_templates_total", released.len() as u64, "scope" => scope.kind());
        for key in released {
            self.processor.add(ResourceKey::system(key));
        }
        aggregate(errs)
    }

    /// Drop the policy's finalizer so the deletion can complete.
    pub(crate) async fn remove_policy_finalizer(&self, policy: &Policy) -> Result<(), DetectorError> {
        let store = self.store.as_ref();
        let scope = policy.scope;
        let gvk = &scope.gvk();
        let key = &policy.key();
        retry_on_conflict(move || async move {
            let mut obj = match store.get(gvk, key.namespace(), &key.name).await {
                Ok(o) => o,
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if labels::remove_finalizer(&mut obj.metadata, scope.finalizer()) {
                store.update(gvk, &obj).await?;
                debug!(kind = scope.kind(), policy = %key, "finalizer removed");
            }
            Ok(())
        })
        .await
    }
}
