//! Templates that matched no policy on their last reconciliation.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use meridian_core::{selector::resource_matches, ClusterWideKey, ResourceSelector};
use meridian_kubehub::ObjectStore;
use tracing::{debug, warn};

#[derive(Default)]
pub struct WaitingList {
    keys: RwLock<HashSet<ClusterWideKey>>,
}

impl WaitingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: ClusterWideKey) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let added = keys.insert(key);
        metrics::gauge!("detector_waiting_objects", keys.len() as f64);
        added
    }

    pub fn remove(&self, key: &ClusterWideKey) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let removed = keys.remove(key);
        metrics::gauge!("detector_waiting_objects", keys.len() as f64);
        removed
    }

    pub fn contains(&self, key: &ClusterWideKey) -> bool {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ClusterWideKey> {
        let mut out: Vec<_> = self.keys.read().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect();
        out.sort();
        out
    }

    /// Waiting keys whose current object matches any of `selectors`.
    ///
    /// With `namespace` set, only keys in that namespace are considered.
    /// Objects are fetched after the lock is released; vanished ones are skipped.
    pub async fn get_matching(
        &self,
        store: &dyn ObjectStore,
        selectors: &[ResourceSelector],
        namespace: Option<&str>,
    ) -> Vec<ClusterWideKey> {
        let mut out = Vec::new();
        for key in self.snapshot() {
            if let Some(ns) = namespace {
                if key.namespace != ns {
                    continue;
                }
            }
            let obj = match store.get(&key.gvk(), key.namespace(), &key.name).await {
                Ok(o) => o,
                Err(e) => {
                    debug!(key = %key, error = %e, "waiting object unavailable");
                    continue;
                }
            };
            let matched = selectors.iter().any(|rs| match resource_matches(&obj, rs) {
                Ok(m) => m,
                Err(e) => {
                    warn!(key = %key, error = %e, "malformed resource selector");
                    false
                }
            });
            if matched {
                out.push(key);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kubehub::MemStore;
    use serde_json::json;

    fn deploy(ns: &str, name: &str) -> kube::core::DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": name, "namespace": ns }
        }))
        .expect("deploy")
    }

    #[tokio::test]
    async fn matching_respects_namespace_and_skips_missing() {
        let store = MemStore::new("m");
        let web = ClusterWideKey::from_object(&store.apply(deploy("default", "web")).expect("apply")).expect("key");
        let other = ClusterWideKey::from_object(&store.apply(deploy("prod", "api")).expect("apply")).expect("key");
        let gone = ClusterWideKey { name: "gone".into(), ..web.clone() };

        let waiting = WaitingList::new();
        assert!(waiting.add(web.clone()));
        assert!(!waiting.add(web.clone()));
        waiting.add(other.clone());
        waiting.add(gone);
        assert_eq!(waiting.len(), 3);

        let all = vec![ResourceSelector { api_version: "apps/v1".into(), kind: "Deployment".into(), ..Default::default() }];
        assert_eq!(waiting.get_matching(&store, &all, Some("default")).await, vec![web.clone()]);
        assert_eq!(waiting.get_matching(&store, &all, None).await.len(), 2);

        assert!(waiting.remove(&web));
        assert!(!waiting.contains(&web));
    }
}
