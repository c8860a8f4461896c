//! Update-event classification: did the specification change, and who changed it.

use kube::core::DynamicObject;

/// Strip server-populated fields that never carry user intent.
fn strip_noisy(obj: &DynamicObject) -> DynamicObject {
    let mut out = obj.clone();
    out.metadata.managed_fields = None;
    out.metadata.resource_version = None;
    out.metadata.generation = None;
    if let Some(data) = out.data.as_object_mut() {
        data.remove("status");
    }
    out
}

/// Whether anything besides status and bookkeeping metadata differs.
///
/// Labels and annotations count, so claim metadata changes are observed.
pub fn specification_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    let (a, b) = (strip_noisy(old), strip_noisy(new));
    a.types != b.types || a.metadata != b.metadata || a.data != b.data
}

/// Whether the change between `old` and `new` was made by `system_manager`.
///
/// True when the managed-field entries line up one-to-one and every entry
/// that differs belongs to the system's field manager.
pub fn change_by_system(old: &DynamicObject, new: &DynamicObject, system_manager: &str) -> bool {
    let empty = Vec::new();
    let old_fields = old.metadata.managed_fields.as_ref().unwrap_or(&empty);
    let new_fields = new.metadata.managed_fields.as_ref().unwrap_or(&empty);
    if old_fields.len() != new_fields.len() {
        return false;
    }
    old_fields.iter().zip(new_fields.iter()).all(|(o, n)| {
        if o.manager != n.manager {
            return false;
        }
        n.manager.as_deref() == Some(system_manager) || o == n
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).expect("object")
    }

    fn base(rv: &str, replicas: i64, managers: serde_json::Value) -> DynamicObject {
        obj(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "default", "resourceVersion": rv, "managedFields": managers },
            "spec": { "replicas": replicas },
            "status": { "readyReplicas": 0 }
        }))
    }

    #[test]
    fn status_and_bookkeeping_are_ignored() {
        let a = base("1", 2, json!([]));
        let mut b = base("2", 2, json!([{ "manager": "kubectl", "operation": "Update" }]));
        b.data["status"] = json!({ "readyReplicas": 2 });
        b.metadata.generation = Some(7);
        assert!(!specification_changed(&a, &b));
        let c = base("3", 3, json!([]));
        assert!(specification_changed(&a, &c));
    }

    #[test]
    fn label_change_counts() {
        let a = base("1", 2, json!([]));
        let mut b = a.clone();
        b.metadata.labels = Some([("k".to_string(), "v".to_string())].into());
        assert!(specification_changed(&a, &b));
    }

    #[test]
    fn system_changes_detected_from_managed_fields() {
        let user = json!({ "manager": "kubectl", "operation": "Update", "time": "2024-01-01T00:00:00Z" });
        let sys_old = json!({ "manager": "meridian-controller-manager", "operation": "Update", "time": "2024-01-01T00:00:00Z" });
        let sys_new = json!({ "manager": "meridian-controller-manager", "operation": "Update", "time": "2024-01-02T00:00:00Z" });
        let user_new = json!({ "manager": "kubectl", "operation": "Update", "time": "2024-01-03T00:00:00Z" });

        let a = base("1", 1, json!([user.clone(), sys_old.clone()]));
        let b = base("2", 1, json!([user.clone(), sys_new.clone()]));
        assert!(change_by_system(&a, &b, "meridian-controller-manager"));

        let c = base("3", 1, json!([user_new, sys_new]));
        assert!(!change_by_system(&b, &c, "meridian-controller-manager"));

        let d = base("4", 1, json!([user]));
        assert!(!change_by_system(&a, &d, "meridian-controller-manager"));
    }
}
