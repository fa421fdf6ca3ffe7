//! Config pump: fan-out of freshly received cluster-maps to the global
//! sink and per-bucket subscribers, with optional CCCP polling.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bucket::BucketAttachment;
use crate::node::ServiceType;
use crate::reconcile::TopologyReconciler;
use crate::registry::NodeRegistry;
use crate::topology::BucketConfig;

const DISPATCH_QUEUE_DEPTH: usize = 64;

/// Publish/subscribe facade over heterogeneous config sources.
///
/// A single dispatcher task drains the publish queue and applies one config
/// at a time, which serializes `apply_config` per bucket; revisions not
/// strictly greater than a bucket's last applied revision are discarded at
/// the door. Bucket-less maps land in the global sink.
pub struct ConfigPump {
    subscribers: Arc<DashMap<String, Arc<BucketAttachment>>>,
    reconciler: Arc<TopologyReconciler>,
    registry: Arc<NodeRegistry>,
    cancel: CancellationToken,
    poll_interval: Duration,
    global_tx: watch::Sender<Option<BucketConfig>>,
    queue_tx: mpsc::Sender<BucketConfig>,
    queue_rx: Mutex<Option<mpsc::Receiver<BucketConfig>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConfigPump {
    /// Pump wired to the given reconciler and registry.
    pub fn new(
        reconciler: Arc<TopologyReconciler>,
        registry: Arc<NodeRegistry>,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        let (global_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            subscribers: Arc::new(DashMap::new()),
            reconciler,
            registry,
            cancel,
            poll_interval,
            global_tx,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Begins producing updates: spawns the dispatcher and, when requested,
    /// the CCCP polling loop. Calling start twice is a no-op for the
    /// dispatcher (its receiver has already been taken).
    pub fn start(&self, enable_polling: bool) {
        let mut tasks = self.tasks.lock();

        if let Some(mut queue_rx) = self.queue_rx.lock().take() {
            let subscribers = Arc::clone(&self.subscribers);
            let reconciler = Arc::clone(&self.reconciler);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        received = queue_rx.recv() => {
                            let Some(config) = received else { break };
                            dispatch(&subscribers, &reconciler, config).await;
                        }
                    }
                }
            }));
        }

        if enable_polling {
            let registry = Arc::clone(&self.registry);
            let subscribers = Arc::clone(&self.subscribers);
            let global_tx = self.global_tx.clone();
            let queue_tx = self.queue_tx.clone();
            let cancel = self.cancel.clone();
            let interval = self.poll_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            poll_once(&registry, &subscribers, &global_tx, &queue_tx, &cancel).await;
                        }
                    }
                }
            }));
        }
    }

    /// Registers a per-bucket sink.
    pub fn subscribe(&self, attachment: Arc<BucketAttachment>) {
        self.subscribers
            .insert(attachment.name().to_string(), attachment);
    }

    /// Removes a per-bucket sink.
    pub fn unsubscribe(&self, bucket: &str) -> Option<Arc<BucketAttachment>> {
        self.subscribers.remove(bucket).map(|(_, sink)| sink)
    }

    /// Fans a freshly received config out to the matching sink.
    pub fn publish(&self, config: BucketConfig) {
        route(
            &self.subscribers,
            &self.global_tx,
            &self.queue_tx,
            config,
        );
    }

    /// Last config delivered to the global sink.
    #[must_use]
    pub fn global_config(&self) -> Option<BucketConfig> {
        self.global_tx.borrow().clone()
    }

    /// Stops the dispatcher and poll loop, waiting for both to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Routes a config to the global sink (bucket-less maps) or onto the
/// dispatch queue for the matching subscriber. Stale revisions drop here.
fn route(
    subscribers: &DashMap<String, Arc<BucketAttachment>>,
    global_tx: &watch::Sender<Option<BucketConfig>>,
    queue_tx: &mpsc::Sender<BucketConfig>,
    config: BucketConfig,
) {
    match config.name.clone() {
        None => {
            let stale = global_tx
                .borrow()
                .as_ref()
                .is_some_and(|current| config.rev <= current.rev);
            if stale {
                debug!(rev = config.rev, "discarding stale global config");
                return;
            }
            let _ = global_tx.send_replace(Some(config));
        }
        Some(bucket) => {
            let Some(sink) = subscribers.get(&bucket) else {
                debug!(bucket, "config for unsubscribed bucket dropped");
                return;
            };
            if !sink.accepts_revision(config.rev) {
                debug!(bucket, rev = config.rev, "discarding stale config revision");
                return;
            }
            drop(sink);
            if let Err(err) = queue_tx.try_send(config) {
                warn!(bucket, %err, "config dispatch queue rejected update");
            }
        }
    }
}

/// Applies one queued config to its subscriber.
async fn dispatch(
    subscribers: &DashMap<String, Arc<BucketAttachment>>,
    reconciler: &TopologyReconciler,
    config: BucketConfig,
) {
    let Some(name) = config.name.clone() else {
        return;
    };
    let Some(sink) = subscribers.get(&name).map(|entry| Arc::clone(&entry)) else {
        return;
    };
    if let Err(err) = reconciler.apply(&sink, &config).await {
        warn!(bucket = name, %err, "config application failed");
    }
}

/// One CCCP poll cycle: fetch the current map from a random KV node and
/// feed it through the normal routing path. Failures are logged and the
/// cycle is skipped.
async fn poll_once(
    registry: &NodeRegistry,
    subscribers: &DashMap<String, Arc<BucketAttachment>>,
    global_tx: &watch::Sender<Option<BucketConfig>>,
    queue_tx: &mpsc::Sender<BucketConfig>,
    cancel: &CancellationToken,
) {
    let Some(node) = registry.random(|node| node.advertises(ServiceType::Kv)) else {
        return;
    };
    match node.fetch_config(cancel).await {
        Ok(config) => route(subscribers, global_tx, queue_tx, config),
        Err(err) => {
            debug!(endpoint = %node.endpoint(), %err, "config poll failed");
        }
    }
}
