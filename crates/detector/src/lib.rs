//! Meridian resource detector.
//!
//! Observes resource templates and propagation policies, decides which
//! policy governs each template, stamps claim metadata and keeps one binding
//! per claimed template in sync. Three work queues drive it: one for
//! templates and one per policy scope.

#![forbid(unsafe_code)]

pub mod binding;
pub mod claim;
pub mod cleanup;
pub mod config;
pub mod handlers;
pub mod interpreter;
pub mod matcher;
pub mod preemption;
pub mod reconcile;
pub mod retry;
pub mod waiting;

use std::fmt;
use std::sync::Arc;

use meridian_core::{DetectorError, NamespacedKey, ObjectEvent, PolicyScope, ResourceKey};
use meridian_kubehub::ObjectStore;
use meridian_queue::AsyncWorker;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{DetectorConfig, SkippedResourceConfig};
pub use interpreter::{DefaultInterpreter, InterpreterOperation, ReplicaInterpreter};
pub use waiting::WaitingList;

/// Queue payload for the policy workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyQueueKey {
    Reconcile(NamespacedKey),
    /// The policy's explicit priority dropped; lower-priority preempting
    /// policies get a chance to take over its templates.
    Deprioritized { key: NamespacedKey, old_priority: i32, new_priority: i32 },
}

impl fmt::Display for PolicyQueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyQueueKey::Reconcile(k) => write!(f, "{}", k),
            PolicyQueueKey::Deprioritized { key, old_priority, new_priority } => {
                write!(f, "{} (deprioritized {} -> {})", key, old_priority, new_priority)
            }
        }
    }
}

pub struct ResourceDetector {
    store: Arc<dyn ObjectStore>,
    interpreter: Arc<dyn ReplicaInterpreter>,
    config: DetectorConfig,
    skipped_namespaces: Vec<Regex>,
    skipped_resources: SkippedResourceConfig,
    waiting: WaitingList,
    processor: AsyncWorker<ResourceKey>,
    policy_worker: AsyncWorker<PolicyQueueKey>,
    cluster_policy_worker: AsyncWorker<PolicyQueueKey>,
}

impl ResourceDetector {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        interpreter: Arc<dyn ReplicaInterpreter>,
        config: DetectorConfig,
    ) -> Result<Arc<Self>, DetectorError> {
        let skipped_namespaces = config
            .skipped_namespaces
            .iter()
            .map(|p| {
                Regex::new(&format!("^{}$", p))
                    .map_err(|e| DetectorError::Selector(format!("skipped namespace pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let skipped_resources = SkippedResourceConfig::parse(&config.skipped_resources)?;
        Ok(Arc::new(Self {
            store,
            interpreter,
            skipped_namespaces,
            skipped_resources,
            waiting: WaitingList::new(),
            processor: AsyncWorker::new("resource-detector", config.rate_limiter),
            policy_worker: AsyncWorker::new("propagation-policy-reconciler", config.rate_limiter),
            cluster_policy_worker: AsyncWorker::new("cluster-propagation-policy-reconciler", config.rate_limiter),
            config,
        }))
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn waiting(&self) -> &WaitingList {
        &self.waiting
    }

    pub fn processor(&self) -> &AsyncWorker<ResourceKey> {
        &self.processor
    }

    pub fn policy_worker(&self, scope: PolicyScope) -> &AsyncWorker<PolicyQueueKey> {
        match scope {
            PolicyScope::Namespaced => &self.policy_worker,
            PolicyScope::Cluster => &self.cluster_policy_worker,
        }
    }

    /// Spawn the template worker pool and one pool per policy scope.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            templates = self.config.concurrent_resource_template_syncs,
            policies = self.config.concurrent_policy_syncs,
            cluster_policies = self.config.concurrent_cluster_policy_syncs,
            "starting resource detector"
        );
        let mut handles = Vec::with_capacity(3);

        let this = Arc::clone(self);
        let workers = self.config.concurrent_resource_template_syncs;
        let processor = self.processor.clone();
        let t = token.clone();
        handles.push(tokio::spawn(async move {
            processor
                .run(t, workers, move |key: ResourceKey| {
                    let this = Arc::clone(&this);
                    async move { this.reconcile_resource(key).await }
                })
                .await
        }));

        for (scope, workers) in [
            (PolicyScope::Namespaced, self.config.concurrent_policy_syncs),
            (PolicyScope::Cluster, self.config.concurrent_cluster_policy_syncs),
        ] {
            let this = Arc::clone(self);
            let worker = self.policy_worker(scope).clone();
            let t = token.clone();
            handles.push(tokio::spawn(async move {
                worker
                    .run(t, workers, move |key: PolicyQueueKey| {
                        let this = Arc::clone(&this);
                        async move { this.reconcile_policy(scope, key).await }
                    })
                    .await
            }));
        }
        handles
    }

    /// Feed observed events into the handlers until cancelled or the channel closes.
    pub async fn ingest(&self, mut rx: mpsc::Receiver<ObjectEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => break,
                },
            }
        }
        info!("event ingestion stopped");
    }
}
