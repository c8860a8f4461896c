//! In-memory [`ObjectStore`] with optimistic concurrency, label selection,
//! finalizer-aware deletion and an event feed. Used by tests and demos.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry, Time};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use meridian_core::{
    keys::gvk_key,
    labels,
    selector::{parse_label_query, LabelRequirement},
    ObjectEvent, StoreError,
};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ObjectStore;

/// Field manager stamped on writes made through [`MemStore::apply`].
pub const USER_MANAGER: &str = "kubectl";

type ObjKey = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjKey, DynamicObject>,
    cluster_scoped: HashSet<String>,
    resource_version: u64,
    writes: u64,
    fail_updates: u32,
    subscribers: Vec<mpsc::UnboundedSender<ObjectEvent>>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn emit(&mut self, ev: ObjectEvent) {
        self.subscribers.retain(|s| s.send(ev.clone()).is_ok());
    }

    fn key(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ObjKey {
        let k = gvk_key(gvk);
        let ns = if self.cluster_scoped.contains(&k) { String::new() } else { namespace.unwrap_or_default().to_string() };
        (k, ns, name.to_string())
    }
}

pub struct MemStore {
    inner: Mutex<Inner>,
    manager: String,
}

impl MemStore {
    /// `manager` is the field manager stamped on writes made through [`ObjectStore`].
    pub fn new(manager: impl Into<String>) -> Self {
        let mut inner = Inner::default();
        for gvk in [
            labels::cluster_propagation_policy_gvk(),
            labels::cluster_override_policy_gvk(),
            labels::cluster_resource_binding_gvk(),
            labels::priority_class_gvk(),
            GroupVersionKind::gvk("", "v1", "Namespace"),
            GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        ] {
            inner.cluster_scoped.insert(gvk_key(&gvk));
        }
        Self { inner: Mutex::new(inner), manager: manager.into() }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_cluster_scoped(&self, gvk: &GroupVersionKind) {
        self.lock().cluster_scoped.insert(gvk_key(gvk));
    }

    pub fn is_namespaced(&self, gvk: &GroupVersionKind) -> bool {
        !self.lock().cluster_scoped.contains(&gvk_key(gvk))
    }

    /// Writes made through [`ObjectStore::create`] and [`ObjectStore::update`].
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Make the next `n` trait updates fail with a conflict.
    pub fn fail_next_updates(&self, n: u32) {
        self.lock().fail_updates = n;
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ObjectEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Create or replace an object as a user would, ignoring resourceVersion.
    /// Not counted in [`MemStore::writes`].
    pub fn apply(&self, obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let gvk = gvk_of(&obj)?;
        let name = name_of(&obj)?.to_string();
        let mut inner = self.lock();
        let key = inner.key(&gvk, obj.metadata.namespace.as_deref(), &name);
        let existing = inner.objects.get(&key).cloned();
        let rv = inner.next_rv();
        let mut obj = obj;
        if key.1.is_empty() {
            obj.metadata.namespace = None;
        }
        obj.metadata.resource_version = Some(rv.clone());
        stamp_manager(&mut obj, USER_MANAGER, &rv);
        match existing {
            Some(old) => {
                obj.metadata.uid = old.metadata.uid.clone();
                obj.metadata.deletion_timestamp = old.metadata.deletion_timestamp.clone();
                inner.objects.insert(key, obj.clone());
                inner.emit(ObjectEvent::Updated { old, new: obj.clone() });
            }
            None => {
                if obj.metadata.uid.is_none() {
                    obj.metadata.uid = Some(Uuid::new_v4().to_string());
                }
                inner.objects.insert(key, obj.clone());
                inner.emit(ObjectEvent::Added(obj.clone()));
            }
        }
        Ok(obj)
    }

    /// Delete an object. With finalizers present it is only marked for
    /// deletion; the last finalizer removal through `update` removes it.
    pub fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = inner.key(gvk, namespace, name);
        let Some(old) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(format!("{} {}", key.0, name)));
        };
        if old.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false) {
            if old.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            let mut new = old.clone();
            new.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
            new.metadata.resource_version = Some(inner.next_rv());
            inner.objects.insert(key, new.clone());
            inner.emit(ObjectEvent::Updated { old, new });
        } else {
            inner.objects.remove(&key);
            inner.emit(ObjectEvent::Deleted(old));
        }
        Ok(())
    }

    /// Snapshot read without going through the async trait.
    pub fn peek(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let inner = self.lock();
        let key = inner.key(gvk, namespace, name);
        inner.objects.get(&key).cloned()
    }
}

fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, StoreError> {
    let types = obj.types.as_ref().ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
    meridian_core::keys::gvk_from_api_version(&types.api_version, &types.kind)
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

fn name_of(obj: &DynamicObject) -> Result<&str, StoreError> {
    obj.metadata.name.as_deref().ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))
}

fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) }
}

/// Record a write by `manager`, replacing its previous entry in place.
fn stamp_manager(obj: &mut DynamicObject, manager: &str, rv: &str) {
    let entry = ManagedFieldsEntry {
        manager: Some(manager.to_string()),
        operation: Some("Update".to_string()),
        fields_type: Some("FieldsV1".to_string()),
        fields_v1: Some(FieldsV1(json!({ "f:resourceVersion": rv }))),
        ..Default::default()
    };
    let fields = obj.metadata.managed_fields.get_or_insert_with(Vec::new);
    match fields.iter_mut().find(|f| f.manager.as_deref() == Some(manager)) {
        Some(f) => *f = entry,
        None => fields.push(entry),
    }
}

fn labels_match(obj: &DynamicObject, reqs: &[LabelRequirement]) -> bool {
    let empty = BTreeMap::new();
    let labels = obj.metadata.labels.as_ref().unwrap_or(&empty);
    reqs.iter().all(|r| r.matches(labels))
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let inner = self.lock();
        let key = inner.key(gvk, namespace, name);
        inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", key.0, key.1, name)))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let reqs = match label_selector {
            Some(q) => parse_label_query(q).map_err(|e| StoreError::Invalid(e.to_string()))?,
            None => Vec::new(),
        };
        let k = gvk_key(gvk);
        let inner = self.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|((g, ns, _), _)| *g == k && namespace.map(|want| want == ns).unwrap_or(true))
            .filter(|(_, o)| labels_match(o, &reqs))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = name_of(obj)?.to_string();
        let mut inner = self.lock();
        let key = inner.key(gvk, obj.metadata.namespace.as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} {}/{} already exists", key.0, key.1, name)));
        }
        let mut obj = obj.clone();
        obj.types = Some(TypeMeta { api_version: api_version_of(gvk), kind: gvk.kind.clone() });
        if key.1.is_empty() {
            obj.metadata.namespace = None;
        }
        let rv = inner.next_rv();
        obj.metadata.resource_version = Some(rv.clone());
        obj.metadata.uid = Some(Uuid::new_v4().to_string());
        stamp_manager(&mut obj, &self.manager, &rv);
        inner.writes += 1;
        inner.objects.insert(key, obj.clone());
        inner.emit(ObjectEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = name_of(obj)?.to_string();
        let mut inner = self.lock();
        let key = inner.key(gvk, obj.metadata.namespace.as_deref(), &name);
        let Some(old) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(format!("{} {}/{}", key.0, key.1, name)));
        };
        if inner.fail_updates > 0 {
            inner.fail_updates -= 1;
            return Err(StoreError::Conflict(format!("{} {}/{}: injected conflict", key.0, key.1, name)));
        }
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if old.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{} {}/{}: resourceVersion {} is stale",
                    key.0, key.1, name, rv
                )));
            }
        }
        let mut new = obj.clone();
        new.types = old.types.clone();
        new.metadata.uid = old.metadata.uid.clone();
        new.metadata.deletion_timestamp = old.metadata.deletion_timestamp.clone();
        if key.1.is_empty() {
            new.metadata.namespace = None;
        }
        let rv = inner.next_rv();
        new.metadata.resource_version = Some(rv.clone());
        stamp_manager(&mut new, &self.manager, &rv);
        inner.writes += 1;
        let finalized = new.metadata.deletion_timestamp.is_some()
            && new.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true);
        if finalized {
            inner.objects.remove(&key);
            inner.emit(ObjectEvent::Deleted(new.clone()));
        } else {
            inner.objects.insert(key, new.clone());
            inner.emit(ObjectEvent::Updated { old, new: new.clone() });
        }
        Ok(new)
    }
}
