#![forbid(unsafe_code)]

use kube::core::{DynamicObject, GroupVersionKind};
use meridian_core::{ObjectEvent, StoreError};
use meridian_kubehub::{create_or_update, MemStore, ObjectStore, OperationResult};
use serde_json::json;

fn cm_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

fn cm(name: &str, labels: serde_json::Value) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "default", "labels": labels },
        "data": { "k": "v" }
    }))
    .expect("object")
}

#[tokio::test]
async fn stale_resource_version_conflicts() {
    let store = MemStore::new("meridian-controller-manager");
    let created = store.create(&cm_gvk(), &cm("a", json!({}))).await.expect("create");
    let mut first = created.clone();
    first.data["data"]["k"] = json!("v2");
    store.update(&cm_gvk(), &first).await.expect("first update");

    let mut stale = created;
    stale.data["data"]["k"] = json!("v3");
    let err = store.update(&cm_gvk(), &stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(store.writes(), 2);
}

#[tokio::test]
async fn list_filters_by_namespace_and_labels() {
    let store = MemStore::new("meridian-controller-manager");
    store.apply(cm("a", json!({ "team": "x" }))).expect("a");
    store.apply(cm("b", json!({ "team": "y" }))).expect("b");
    let all = store.list(&cm_gvk(), None, None).await.expect("list");
    assert_eq!(all.len(), 2);
    let x = store.list(&cm_gvk(), Some("default"), Some("team=x")).await.expect("list");
    assert_eq!(x.len(), 1);
    assert_eq!(x[0].metadata.name.as_deref(), Some("a"));
    let other_ns = store.list(&cm_gvk(), Some("prod"), None).await.expect("list");
    assert!(other_ns.is_empty());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn finalizers_defer_deletion() {
    let store = MemStore::new("meridian-controller-manager");
    let mut obj = cm("a", json!({}));
    obj.metadata.finalizers = Some(vec!["example.io/hold".into()]);
    store.apply(obj).expect("apply");
    store.delete(&cm_gvk(), Some("default"), "a").expect("delete");

    let mut marked = store.get(&cm_gvk(), Some("default"), "a").await.expect("still present");
    assert!(marked.metadata.deletion_timestamp.is_some());
    marked.metadata.finalizers = None;
    store.update(&cm_gvk(), &marked).await.expect("drop finalizer");
    let gone = store.get(&cm_gvk(), Some("default"), "a").await.unwrap_err();
    assert!(matches!(gone, StoreError::NotFound(_)));
}

#[tokio::test]
async fn events_carry_before_and_after() {
    let store = MemStore::new("meridian-controller-manager");
    let mut rx = store.subscribe();
    let created = store.create(&cm_gvk(), &cm("a", json!({}))).await.expect("create");
    let mut next = created.clone();
    next.metadata.labels = Some([("k".to_string(), "v".to_string())].into());
    store.update(&cm_gvk(), &next).await.expect("update");
    store.delete(&cm_gvk(), Some("default"), "a").expect("delete");

    assert!(matches!(rx.recv().await, Some(ObjectEvent::Added(_))));
    match rx.recv().await {
        Some(ObjectEvent::Updated { old, new }) => {
            assert!(old.metadata.labels.is_none());
            assert!(new.metadata.labels.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(rx.recv().await, Some(ObjectEvent::Deleted(_))));
}

#[tokio::test]
async fn create_or_update_reports_outcome() {
    let store = MemStore::new("meridian-controller-manager");
    let desired = cm("a", json!({ "owner": "me" }));
    let set_data = |o: &mut DynamicObject| -> Result<(), StoreError> {
        o.data["data"] = json!({ "k": "v" });
        Ok(())
    };

    let (r, _) = create_or_update(&store, &cm_gvk(), &desired, set_data).await.expect("create");
    assert_eq!(r, OperationResult::Created);
    let (r, _) = create_or_update(&store, &cm_gvk(), &desired, set_data).await.expect("noop");
    assert_eq!(r, OperationResult::Unchanged);
    assert_eq!(store.writes(), 1);

    let (r, obj) = create_or_update(&store, &cm_gvk(), &desired, |o: &mut DynamicObject| -> Result<(), StoreError> {
        o.data["data"] = json!({ "k": "changed" });
        Ok(())
    })
    .await
    .expect("update");
    assert_eq!(r, OperationResult::Updated);
    assert_eq!(obj.data["data"]["k"], json!("changed"));
}

#[tokio::test]
async fn cluster_scoped_kinds_ignore_namespace() {
    let store = MemStore::new("meridian-controller-manager");
    let ns_gvk = GroupVersionKind::gvk("", "v1", "Namespace");
    let ns: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "prod" }
    }))
    .expect("ns");
    store.apply(ns).expect("apply");
    assert!(!store.is_namespaced(&ns_gvk));
    let got = store.get(&ns_gvk, Some("ignored"), "prod").await.expect("get");
    assert!(got.metadata.namespace.is_none());
}
