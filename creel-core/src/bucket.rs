//! Per-bucket attachment state: the node view a bucket routes over and the
//! bootstrap handshake that establishes it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::node::{BucketType, ClusterNode, ServiceType};
use crate::reconcile::TopologyReconciler;
use crate::topology::Endpoint;

/// Creates bucket attachments. Swappable so tests can observe or intercept
/// attachment construction.
pub trait BucketFactory: Send + Sync {
    /// New, unbootstrapped attachment for `name`.
    fn create(&self, name: &str, bucket_type: BucketType) -> Arc<BucketAttachment>;
}

/// Factory producing plain [`BucketAttachment`]s.
#[derive(Debug, Default)]
pub struct DefaultBucketFactory;

impl BucketFactory for DefaultBucketFactory {
    fn create(&self, name: &str, bucket_type: BucketType) -> Arc<BucketAttachment> {
        Arc::new(BucketAttachment::new(name, bucket_type))
    }
}

/// One bucket's attachment to the cluster: its ordered node view, bootstrap
/// state and the latest applied config revision.
pub struct BucketAttachment {
    name: String,
    bucket_type: BucketType,
    nodes: RwLock<Vec<Arc<ClusterNode>>>,
    bootstrapped: AtomicBool,
    last_revision: Mutex<Option<u64>>,
    disposed: AtomicBool,
}

impl BucketAttachment {
    /// Fresh attachment with an empty node view.
    pub fn new(name: impl Into<String>, bucket_type: BucketType) -> Self {
        Self {
            name: name.into(),
            bucket_type,
            nodes: RwLock::new(Vec::new()),
            bootstrapped: AtomicBool::new(false),
            last_revision: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket flavor.
    #[must_use]
    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    /// True once a bootstrap attempt has completed successfully.
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Latest config revision applied to the view.
    #[must_use]
    pub fn last_revision(&self) -> Option<u64> {
        *self.last_revision.lock()
    }

    /// Whether `rev` is strictly newer than the last applied revision.
    /// Re-deliveries of the same revision and older revisions are no-ops.
    #[must_use]
    pub fn accepts_revision(&self, rev: u64) -> bool {
        self.last_revision.lock().is_none_or(|last| rev > last)
    }

    /// Records `rev` as applied. Never moves the latch backwards.
    pub fn record_revision(&self, rev: u64) {
        let mut last = self.last_revision.lock();
        if last.is_none_or(|current| rev > current) {
            *last = Some(rev);
        }
    }

    /// Snapshot of the node view in server order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.nodes.read().clone()
    }

    /// True when the view holds a node at `endpoint`.
    #[must_use]
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.nodes
            .read()
            .iter()
            .any(|node| node.endpoint() == endpoint)
    }

    /// Appends a node to the view unless its endpoint is already present.
    pub fn add_node(&self, node: Arc<ClusterNode>) {
        let mut nodes = self.nodes.write();
        if !nodes.iter().any(|held| held.endpoint() == node.endpoint()) {
            nodes.push(node);
        }
    }

    /// Removes the node at `endpoint` from the view.
    pub fn remove_node(&self, endpoint: &Endpoint) -> Option<Arc<ClusterNode>> {
        let mut nodes = self.nodes.write();
        let index = nodes.iter().position(|node| node.endpoint() == endpoint)?;
        Some(nodes.remove(index))
    }

    /// Empties the view, returning the nodes it held. Registry eviction and
    /// disposal stay with the caller.
    pub fn clear_nodes(&self) -> Vec<Arc<ClusterNode>> {
        std::mem::take(&mut *self.nodes.write())
    }

    /// Bootstraps the bucket against `seed`: runs the SELECT_BUCKET
    /// handshake for Couchbase buckets whose seed speaks KV, claims the
    /// seed, pulls the first per-bucket cluster-map and applies it.
    ///
    /// On failure the claim and view entry are unwound so the seed can be
    /// reused by a later combination.
    pub async fn attach(
        &self,
        seed: &Arc<ClusterNode>,
        reconciler: &TopologyReconciler,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if self.bucket_type == BucketType::Couchbase && seed.advertises(ServiceType::Kv) {
            seed.select_bucket(&self.name, cancel).await?;
            seed.refresh_capabilities();
        }

        if !seed.claim(&self.name) {
            return Err(CoreError::connect(
                seed.endpoint().clone(),
                "seed node already owned by another bucket",
            ));
        }
        self.add_node(Arc::clone(seed));

        match self.pull_first_config(seed, reconciler, cancel).await {
            Ok(()) => {
                self.bootstrapped.store(true, Ordering::Release);
                debug!(bucket = self.name, seed = %seed.endpoint(), "bucket bootstrapped");
                Ok(())
            }
            Err(err) => {
                self.remove_node(seed.endpoint());
                seed.release_if_owned_by(&self.name);
                Err(err)
            }
        }
    }

    async fn pull_first_config(
        &self,
        seed: &Arc<ClusterNode>,
        reconciler: &TopologyReconciler,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let mut config = seed.fetch_config(cancel).await?;
        config.global = false;
        if config.name.is_none() {
            config.name = Some(self.name.clone());
        }
        reconciler.apply(self, &config).await
    }

    /// Resets bootstrap state and empties the view. The caller evicts the
    /// owned registry entries.
    pub fn detach(&self) -> Vec<Arc<ClusterNode>> {
        self.bootstrapped.store(false, Ordering::Release);
        self.clear_nodes()
    }

    /// Idempotent teardown: detaches and marks the attachment unusable.
    pub fn dispose(&self) -> Vec<Arc<ClusterNode>> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.detach()
    }

    /// True once [`BucketAttachment::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BucketAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketAttachment")
            .field("name", &self.name)
            .field("bucket_type", &self.bucket_type)
            .field("nodes", &self.nodes.read().len())
            .field("bootstrapped", &self.is_bootstrapped())
            .field("last_revision", &self.last_revision())
            .finish()
    }
}
