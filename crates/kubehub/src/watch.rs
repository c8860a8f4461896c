//! Discovery of watchable kinds and list+watch into [`ObjectEvent`]s.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{verbs, Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use meridian_core::{keys::gvk_key, ObjectEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn gvk_key(&self) -> String {
        gvk_key(&self.gvk())
    }
}

/// Discover served kinds that support list, watch and delete.
pub async fn discover(client: Client) -> Result<Vec<(DiscoveredResource, ApiResource)>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if !(caps.supports_operation(verbs::LIST)
                && caps.supports_operation(verbs::WATCH)
                && caps.supports_operation(verbs::DELETE))
            {
                continue;
            }
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            let dr = DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced,
            };
            out.push((dr, ar));
        }
    }
    out.sort_by(|(a, _), (b, _)| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Remembers the last applied state per object so watch events can carry
/// before/after pairs.
#[derive(Default)]
struct LastSeen {
    objects: HashMap<(String, String), DynamicObject>,
}

impl LastSeen {
    fn key(obj: &DynamicObject) -> (String, String) {
        (obj.metadata.namespace.clone().unwrap_or_default(), obj.metadata.name.clone().unwrap_or_default())
    }

    fn applied(&mut self, obj: DynamicObject) -> ObjectEvent {
        match self.objects.insert(Self::key(&obj), obj.clone()) {
            Some(old) => ObjectEvent::Updated { old, new: obj },
            None => ObjectEvent::Added(obj),
        }
    }

    fn deleted(&mut self, obj: DynamicObject) -> ObjectEvent {
        self.objects.remove(&Self::key(&obj));
        ObjectEvent::Deleted(obj)
    }

    /// Replace the cache with a relisted set, emitting deletes for objects that vanished.
    fn restarted(&mut self, list: Vec<DynamicObject>) -> Vec<ObjectEvent> {
        let fresh: HashSet<_> = list.iter().map(Self::key).collect();
        let gone: Vec<_> = self.objects.keys().filter(|k| !fresh.contains(*k)).cloned().collect();
        let mut out = Vec::with_capacity(list.len() + gone.len());
        for k in gone {
            if let Some(old) = self.objects.remove(&k) {
                out.push(ObjectEvent::Deleted(old));
            }
        }
        for obj in list {
            out.push(self.applied(obj));
        }
        out
    }
}

/// Tag objects with their apiVersion/kind; list responses may omit them.
fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(kube::core::TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj
}

/// List+watch one kind cluster-wide until cancelled, sending events into `tx`.
pub async fn watch_kind(client: Client, ar: ApiResource, tx: mpsc::Sender<ObjectEvent>, token: CancellationToken) -> Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut seen = LastSeen::default();
    let key = gvk_key(&GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind));
    info!(gvk = %key, "watcher started");
    loop {
        let ev = tokio::select! {
            _ = token.cancelled() => break,
            ev = stream.try_next() => ev?,
        };
        let Some(ev) = ev else { break };
        let events = match ev {
            Event::Applied(o) => vec![seen.applied(with_types(o, &ar))],
            Event::Deleted(o) => vec![seen.deleted(with_types(o, &ar))],
            Event::Restarted(list) => {
                debug!(gvk = %key, count = list.len(), "watch restart");
                seen.restarted(list.into_iter().map(|o| with_types(o, &ar)).collect())
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                debug!(gvk = %key, "event channel closed");
                return Ok(());
            }
        }
    }
    info!(gvk = %key, "watcher stopped");
    Ok(())
}

/// Periodically rediscover watchable kinds and start one watcher per new
/// kind accepted by `accept`. Returns when `token` is cancelled.
pub async fn watch_resources<F>(
    client: Client,
    tx: mpsc::Sender<ObjectEvent>,
    token: CancellationToken,
    period: Duration,
    accept: F,
) where
    F: Fn(&GroupVersionKind) -> bool + Send + Sync + 'static,
{
    let mut started: HashSet<String> = HashSet::new();
    loop {
        match discover(client.clone()).await {
            Ok(resources) => {
                for (dr, ar) in resources {
                    let key = dr.gvk_key();
                    if started.contains(&key) || !accept(&dr.gvk()) {
                        continue;
                    }
                    started.insert(key.clone());
                    let (client, tx, token) = (client.clone(), tx.clone(), token.child_token());
                    tokio::spawn(async move {
                        if let Err(e) = watch_kind(client, ar, tx, token).await {
                            warn!(gvk = %key, error = %e, "watcher failed");
                        }
                    });
                }
                metrics::gauge!("detector_watched_kinds", started.len() as f64);
            }
            Err(e) => warn!(error = %e, "resource discovery failed"),
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
    info!("resource discovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, rv: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default", "resourceVersion": rv }
        }))
        .expect("object")
    }

    #[test]
    fn last_seen_pairs_updates() {
        let mut seen = LastSeen::default();
        assert!(matches!(seen.applied(cm("a", "1")), ObjectEvent::Added(_)));
        match seen.applied(cm("a", "2")) {
            ObjectEvent::Updated { old, new } => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(seen.deleted(cm("a", "3")), ObjectEvent::Deleted(_)));
        assert!(seen.objects.is_empty());
    }

    #[test]
    fn restart_emits_deletes_for_vanished() {
        let mut seen = LastSeen::default();
        seen.applied(cm("a", "1"));
        seen.applied(cm("b", "1"));
        let events = seen.restarted(vec![cm("b", "2"), cm("c", "1")]);
        let deleted: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ObjectEvent::Deleted(o) => o.metadata.name.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["a".to_string()]);
        assert_eq!(events.len(), 3);
    }
}
