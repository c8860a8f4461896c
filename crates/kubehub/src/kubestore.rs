//! kube-rs backed [`ObjectStore`] with cached discovery.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use meridian_core::{keys::gvk_key, StoreError};
use tokio::sync::RwLock;
use tracing::debug;

use crate::ObjectStore;

/// Minimum spacing between discovery runs triggered by unknown kinds.
const DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// GVK key to API resource and namespaced flag, plus when it was last rebuilt.
/// Kinds absent from the last discovery stay unknown until the interval passes.
#[derive(Default)]
struct DiscoveryCache {
    resources: HashMap<String, (ApiResource, bool)>,
    refreshed_at: Option<Instant>,
}

impl DiscoveryCache {
    fn get(&self, key: &str) -> Option<(ApiResource, bool)> {
        self.resources.get(key).cloned()
    }

    fn refresh_due(&self, now: Instant) -> bool {
        self.refreshed_at.map(|t| now.saturating_duration_since(t) >= DISCOVERY_REFRESH_INTERVAL).unwrap_or(true)
    }

    fn replace(&mut self, resources: HashMap<String, (ApiResource, bool)>, now: Instant) {
        self.resources = resources;
        self.refreshed_at = Some(now);
    }
}

pub struct KubeStore {
    client: Client,
    field_manager: String,
    discovery: RwLock<DiscoveryCache>,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), discovery: RwLock::new(DiscoveryCache::default()) }
    }

    pub async fn try_default(field_manager: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve a GVK to its API resource. A miss reruns discovery at most
    /// once per refresh interval; otherwise the kind is reported unknown.
    pub async fn api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), StoreError> {
        let key = gvk_key(gvk);
        {
            let cache = self.discovery.read().await;
            if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
            if !cache.refresh_due(Instant::now()) {
                return Err(StoreError::UnknownKind(key));
            }
        }
        let mut cache = self.discovery.write().await;
        // another caller may have refreshed while we waited for the lock
        if cache.refresh_due(Instant::now()) {
            let discovery = Discovery::new(self.client.clone()).run().await.map_err(map_err)?;
            let mut resources = HashMap::new();
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let k = gvk_key(&GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind));
                    resources.insert(k, (ar, namespaced));
                }
            }
            debug!(kinds = resources.len(), "discovery cache refreshed");
            cache.replace(resources, Instant::now());
        }
        cache.get(&key).ok_or(StoreError::UnknownKind(key))
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.api_resource(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn post_params(&self) -> PostParams {
        PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

fn map_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => StoreError::Invalid(ae.message),
        other => StoreError::Other(anyhow!(other)),
    }
}

fn name_of(obj: &DynamicObject) -> Result<&str, StoreError> {
    obj.metadata.name.as_deref().ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        self.api(gvk, namespace).await?.get(name).await.map_err(map_err)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self.api(gvk, namespace).await?.list(&lp).await.map_err(map_err)?;
        Ok(list.items)
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        name_of(obj)?;
        let api = self.api(gvk, obj.metadata.namespace.as_deref()).await?;
        api.create(&self.post_params(), obj).await.map_err(map_err)
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = name_of(obj)?;
        let api = self.api(gvk, obj.metadata.namespace.as_deref()).await?;
        api.replace(name, &self.post_params(), obj).await.map_err(map_err)
    }
}
