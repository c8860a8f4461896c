//! Meridian work queues: deduplicating, rate-limited FIFO queues drained by
//! bounded worker pools.
//!
//! A key is processed by at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding a key that is in flight marks it dirty
//! and it is redelivered once the in-flight run completes.

#![forbid(unsafe_code)]

pub mod ratelimit;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use meridian_core::DetectorError;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use ratelimit::{RateLimiter, RateLimiterConfig};

/// Errors that tell the queue whether to redeliver the failed key.
pub trait Retryable {
    fn retryable(&self) -> bool;
}

impl Retryable for DetectorError {
    fn retryable(&self) -> bool {
        DetectorError::retryable(self)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
}

/// FIFO with dedup-while-queued and dedup-while-in-flight.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State { queue: VecDeque::new(), dirty: FxHashSet::default(), processing: FxHashSet::default() }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if !st.dirty.insert(key.clone()) {
            return;
        }
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        let depth = st.queue.len();
        drop(st);
        metrics::gauge!("workqueue_depth", depth as f64, "name" => self.name.clone());
        self.notify.notify_one();
    }

    /// Queued keys, excluding those in flight.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys queued or in flight.
    pub fn pending(&self) -> usize {
        let st = self.lock();
        st.queue.len() + st.processing.len()
    }

    fn try_pop(&self) -> Option<K> {
        let mut st = self.lock();
        let key = st.queue.pop_front()?;
        st.dirty.remove(&key);
        st.processing.insert(key.clone());
        Some(key)
    }

    /// Wait for the next key. Returns `None` once `token` is cancelled.
    pub async fn get(&self, token: &CancellationToken) -> Option<K> {
        loop {
            if token.is_cancelled() {
                return None;
            }
            if let Some(key) = self.try_pop() {
                return Some(key);
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Mark `key` finished; a key re-added while in flight is queued again.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }
}

struct WorkerInner<K> {
    queue: WorkQueue<K>,
    limiter: Mutex<RateLimiter<K>>,
}

/// A named work queue plus its rate limiter, drained by [`AsyncWorker::run`].
pub struct AsyncWorker<K> {
    inner: Arc<WorkerInner<K>>,
}

impl<K> Clone for AsyncWorker<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K> AsyncWorker<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, cfg: RateLimiterConfig) -> Self {
        Self { inner: Arc::new(WorkerInner { queue: WorkQueue::new(name), limiter: Mutex::new(RateLimiter::new(cfg)) }) }
    }

    pub fn name(&self) -> &str {
        self.inner.queue.name()
    }

    /// Queue a key derived from an observed event.
    pub fn enqueue(&self, key: K) {
        self.inner.queue.add(key);
    }

    /// Explicitly requeue a key.
    pub fn add(&self, key: K) {
        self.inner.queue.add(key);
    }

    /// Requeue after the rate limiter's delay for this key.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter().when(&key);
        debug!(queue = %self.name(), key = %key, delay_ms = delay.as_millis() as u64, "requeue after backoff");
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.add(key);
        });
    }

    pub fn forget(&self, key: &K) {
        self.limiter().forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter().num_requeues(key)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Keys queued or being processed.
    pub fn pending(&self) -> usize {
        self.inner.queue.pending()
    }

    fn limiter(&self) -> MutexGuard<'_, RateLimiter<K>> {
        self.inner.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain the queue with `workers` concurrent tasks calling `reconcile`
    /// until `token` is cancelled. Retryable failures are requeued with
    /// backoff; others are dropped until the key is added again.
    pub async fn run<F, Fut, E>(&self, token: CancellationToken, workers: usize, reconcile: F)
    where
        F: Fn(K) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Retryable + fmt::Display + Send + 'static,
    {
        let workers = workers.max(1);
        info!(queue = %self.name(), workers, "workers started");
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let this = self.clone();
            let token = token.clone();
            let reconcile = reconcile.clone();
            handles.push(tokio::spawn(async move { this.work(token, reconcile).await }));
        }
        for h in futures::future::join_all(handles).await {
            if let Err(e) = h {
                warn!(queue = %self.name(), error = %e, "worker task failed");
            }
        }
        info!(queue = %self.name(), "workers stopped");
    }

    async fn work<F, Fut, E>(&self, token: CancellationToken, reconcile: F)
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Retryable + fmt::Display,
    {
        while let Some(key) = self.inner.queue.get(&token).await {
            let start = Instant::now();
            let result = tokio::select! {
                _ = token.cancelled() => {
                    self.inner.queue.done(&key);
                    break;
                }
                r = reconcile(key.clone()) => r,
            };
            metrics::histogram!("reconcile_duration_seconds", start.elapsed().as_secs_f64(), "queue" => self.name().to_string());
            match result {
                Ok(()) => {
                    metrics::counter!("reconcile_total", 1u64, "queue" => self.name().to_string(), "result" => "success");
                    self.forget(&key);
                }
                Err(e) if e.retryable() => {
                    metrics::counter!("reconcile_total", 1u64, "queue" => self.name().to_string(), "result" => "requeue");
                    warn!(queue = %self.name(), key = %key, error = %e, "reconcile failed, requeueing");
                    self.add_rate_limited(key.clone());
                }
                Err(e) => {
                    metrics::counter!("reconcile_total", 1u64, "queue" => self.name().to_string(), "result" => "error");
                    warn!(queue = %self.name(), key = %key, error = %e, "reconcile failed, not retrying");
                    self.forget(&key);
                }
            }
            self.inner.queue.done(&key);
        }
    }
}
