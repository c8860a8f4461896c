//! Event handlers. They classify and enqueue; all work happens in the workers.

use kube::core::DynamicObject;
use meridian_core::eventfilter::{change_by_system, specification_changed};
use meridian_core::keys::split_api_version;
use meridian_core::{labels, ClusterWideKey, NamespacedKey, ObjectEvent, Policy, PolicyScope, ResourceKey};
use tracing::{debug, trace, warn};

use crate::{PolicyQueueKey, ResourceDetector};

/// Generated by the API server in `kube-system`; never propagated.
const EXTENSION_APISERVER_AUTH: &str = "extension-apiserver-authentication";

fn policy_scope_of(obj: &DynamicObject) -> Option<PolicyScope> {
    let types = obj.types.as_ref()?;
    if split_api_version(&types.api_version).0 != labels::POLICY_GROUP {
        return None;
    }
    PolicyScope::from_kind(&types.kind)
}

impl ResourceDetector {
    pub fn handle_event(&self, ev: ObjectEvent) {
        if let Some(scope) = policy_scope_of(ev.object()) {
            self.on_policy_event(scope, ev);
            return;
        }
        match ev {
            ObjectEvent::Added(obj) | ObjectEvent::Deleted(obj) => self.on_template_add(&obj),
            ObjectEvent::Updated { old, new } => self.on_template_update(&old, &new),
        }
    }

    /// Whether `obj` is a candidate resource template at all.
    pub fn event_filter(&self, obj: &DynamicObject) -> bool {
        let key = match ClusterWideKey::from_object(obj) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "dropping event for object without identity");
                return false;
            }
        };
        if let Some(ns) = key.namespace() {
            if self.skipped_namespaces.iter().any(|re| re.is_match(ns)) {
                return false;
            }
            if ns == "kube-system" && key.kind == "ConfigMap" && key.name == EXTENSION_APISERVER_AUTH {
                return false;
            }
            if labels::is_reserved_namespace(ns) {
                return false;
            }
        }
        !self.skipped_resources.is_skipped(&key.gvk())
    }

    fn on_template_add(&self, obj: &DynamicObject) {
        if !self.event_filter(obj) {
            metrics::counter!("detector_events_total", 1u64, "outcome" => "filtered");
            return;
        }
        if let Ok(key) = ClusterWideKey::from_object(obj) {
            trace!(resource = %key, "enqueue template");
            metrics::counter!("detector_events_total", 1u64, "outcome" => "enqueued");
            self.processor.enqueue(ResourceKey::user(key));
        }
    }

    fn on_template_update(&self, old: &DynamicObject, new: &DynamicObject) {
        if !self.event_filter(new) {
            metrics::counter!("detector_events_total", 1u64, "outcome" => "filtered");
            return;
        }
        let Ok(key) = ClusterWideKey::from_object(new) else { return };
        if !specification_changed(old, new) {
            trace!(resource = %key, "ignoring update without specification change");
            metrics::counter!("detector_events_total", 1u64, "outcome" => "unchanged");
            return;
        }
        let by_system = change_by_system(old, new, &self.config.field_manager);
        metrics::counter!("detector_events_total", 1u64, "outcome" => "enqueued");
        self.processor.enqueue(ResourceKey { key, change_by_system: by_system });
    }

    fn on_policy_event(&self, scope: PolicyScope, ev: ObjectEvent) {
        let worker = self.policy_worker(scope);
        match &ev {
            ObjectEvent::Added(obj) | ObjectEvent::Deleted(obj) => {
                if let Some(key) = policy_key(obj) {
                    worker.enqueue(PolicyQueueKey::Reconcile(key));
                }
            }
            ObjectEvent::Updated { old, new } => {
                let Some(key) = policy_key(new) else { return };
                worker.enqueue(PolicyQueueKey::Reconcile(key.clone()));
                if !self.config.policy_preemption {
                    return;
                }
                let (Ok(old), Ok(new)) = (Policy::from_dynamic(old), Policy::from_dynamic(new)) else {
                    debug!(policy = %key, "cannot decode policy update for priority comparison");
                    return;
                };
                if new.explicit_priority() < old.explicit_priority() {
                    worker.enqueue(PolicyQueueKey::Deprioritized {
                        key,
                        old_priority: old.explicit_priority(),
                        new_priority: new.explicit_priority(),
                    });
                }
            }
        }
    }
}

fn policy_key(obj: &DynamicObject) -> Option<NamespacedKey> {
    let name = obj.metadata.name.as_deref()?;
    Some(NamespacedKey::new(obj.metadata.namespace.as_deref(), name))
}
