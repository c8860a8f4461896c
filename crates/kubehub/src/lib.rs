//! Meridian kubehub: the object store seam, its kube-rs implementation,
//! discovery and watcher wiring, and an in-memory store for tests.

#![forbid(unsafe_code)]

pub mod kubestore;
pub mod mem;
pub mod watch;

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use meridian_core::StoreError;
use serde::{Deserialize, Serialize};

pub use kubestore::KubeStore;
pub use mem::MemStore;
pub use watch::{discover, watch_resources, DiscoveredResource};

/// Get/list/create/update over dynamic objects, keyed by a runtime GVK.
///
/// `update` is optimistic: a stale `metadata.resourceVersion` yields
/// [`StoreError::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Fetch the object named by `desired`; create it when absent, otherwise run
/// `mutate` on the live copy and write it back only if it changed.
///
/// `mutate` also runs on `desired` before creation so both paths apply the
/// same rules.
pub async fn create_or_update<F, E>(
    store: &dyn ObjectStore,
    gvk: &GroupVersionKind,
    desired: &DynamicObject,
    mut mutate: F,
) -> Result<(OperationResult, DynamicObject), E>
where
    F: FnMut(&mut DynamicObject) -> Result<(), E>,
    E: From<StoreError>,
{
    let name = desired
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("create_or_update requires metadata.name".into()))?;
    let namespace = desired.metadata.namespace.as_deref();
    match store.get(gvk, namespace, name).await {
        Err(StoreError::NotFound(_)) => {
            let mut obj = desired.clone();
            mutate(&mut obj)?;
            let created = store.create(gvk, &obj).await?;
            metrics::counter!("store_create_or_update_total", 1u64, "result" => "created");
            Ok((OperationResult::Created, created))
        }
        Err(e) => Err(e.into()),
        Ok(existing) => {
            let before = to_json(&existing)?;
            let mut obj = existing;
            mutate(&mut obj)?;
            if to_json(&obj)? == before {
                metrics::counter!("store_create_or_update_total", 1u64, "result" => "unchanged");
                return Ok((OperationResult::Unchanged, obj));
            }
            let updated = store.update(gvk, &obj).await?;
            metrics::counter!("store_create_or_update_total", 1u64, "result" => "updated");
            Ok((OperationResult::Updated, updated))
        }
    }
}

fn to_json(obj: &DynamicObject) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(format!("serializing DynamicObject: {}", e)))
}
