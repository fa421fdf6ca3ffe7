//! Live node handles: the in-process representation of one server node,
//! its capability flags and its bucket ownership state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::services::NodeConnection;
use crate::topology::{BucketConfig, Endpoint, NodeAdapter, NodeCapabilities};

/// Bucket flavor a node connection was established against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketType {
    /// Couchbase-type bucket: vBucket locator, SELECT_BUCKET handshake.
    Couchbase,
    /// Memcached-type bucket: ketama locator, no handshake.
    Memcached,
}

impl BucketType {
    /// Bucket types tried during attach, in contract order.
    pub const ATTACH_ORDER: [Self; 2] = [Self::Couchbase, Self::Memcached];
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Couchbase => write!(f, "couchbase"),
            Self::Memcached => write!(f, "memcached"),
        }
    }
}

/// Services a request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// Data (key/value) service.
    Kv,
    /// Query (N1QL) service.
    Query,
    /// Full-text search service.
    Search,
    /// Analytics service.
    Analytics,
    /// Views service. Bucket-scoped: routed only to nodes owned by the bucket.
    Views,
    /// Eventing service.
    Eventing,
}

impl ServiceType {
    /// Fixed service-to-capability mapping.
    #[must_use]
    pub fn advertised_by(self, caps: &NodeCapabilities) -> bool {
        match self {
            Self::Kv => caps.kv,
            Self::Query => caps.query,
            Self::Search => caps.search,
            Self::Analytics => caps.analytics,
            Self::Views => caps.views,
            Self::Eventing => caps.eventing,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kv => write!(f, "kv"),
            Self::Query => write!(f, "query"),
            Self::Search => write!(f, "search"),
            Self::Analytics => write!(f, "analytics"),
            Self::Views => write!(f, "views"),
            Self::Eventing => write!(f, "eventing"),
        }
    }
}

/// In-process handle to one connected server node.
///
/// Handles are born exclusively through the
/// [`ClusterNodeFactory`](crate::services::ClusterNodeFactory) and live in
/// the [`NodeRegistry`](crate::registry::NodeRegistry). The owner
/// back-reference is a non-owning bucket-name index; the attachment's node
/// view holds the owning edge.
pub struct ClusterNode {
    endpoint: Endpoint,
    bucket_type: BucketType,
    connection: Arc<dyn NodeConnection>,
    capabilities: RwLock<NodeCapabilities>,
    owner: Mutex<Option<String>>,
    adapter: Mutex<Option<NodeAdapter>>,
    disposed: AtomicBool,
}

impl ClusterNode {
    /// Wraps a freshly established connection into a handle.
    pub fn new(
        endpoint: Endpoint,
        bucket_type: BucketType,
        adapter: Option<NodeAdapter>,
        connection: Arc<dyn NodeConnection>,
    ) -> Self {
        let capabilities = connection.capabilities();
        Self {
            endpoint,
            bucket_type,
            connection,
            capabilities: RwLock::new(capabilities),
            owner: Mutex::new(None),
            adapter: Mutex::new(adapter),
            disposed: AtomicBool::new(false),
        }
    }

    /// Endpoint this handle is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Bucket flavor the connection was established against.
    #[must_use]
    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    /// Snapshot of the capability flags.
    #[must_use]
    pub fn capabilities(&self) -> NodeCapabilities {
        *self.capabilities.read()
    }

    /// Re-reads capability flags from the connection (the handshake may have
    /// been upgraded by SELECT_BUCKET since the last read).
    pub fn refresh_capabilities(&self) {
        *self.capabilities.write() = self.connection.capabilities();
    }

    /// Whether the node advertises the capability backing `service`.
    #[must_use]
    pub fn advertises(&self, service: ServiceType) -> bool {
        service.advertised_by(&self.capabilities.read())
    }

    /// Name of the owning bucket, if assigned.
    #[must_use]
    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    /// True while no bucket has claimed the node.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.owner.lock().is_none()
    }

    /// True when the owner is exactly `bucket`.
    #[must_use]
    pub fn is_owned_by(&self, bucket: &str) -> bool {
        self.owner.lock().as_deref() == Some(bucket)
    }

    /// Claims the node for `bucket`. A node is claimed at most once from the
    /// unassigned state; claiming an already-owned node only succeeds when
    /// the owner is the same bucket.
    pub fn claim(&self, bucket: &str) -> bool {
        let mut owner = self.owner.lock();
        match owner.as_deref() {
            None => {
                *owner = Some(bucket.to_string());
                true
            }
            Some(current) => current == bucket,
        }
    }

    /// Returns the node to the unassigned state, but only if `bucket` holds
    /// the claim. Used to unwind a partially completed attach.
    pub fn release_if_owned_by(&self, bucket: &str) {
        let mut owner = self.owner.lock();
        if owner.as_deref() == Some(bucket) {
            *owner = None;
        }
    }

    /// Current cluster-map slice for the node, if one has been applied.
    #[must_use]
    pub fn adapter(&self) -> Option<NodeAdapter> {
        self.adapter.lock().clone()
    }

    /// Replaces the cluster-map slice after a config application.
    pub fn set_adapter(&self, adapter: NodeAdapter) {
        *self.adapter.lock() = Some(adapter);
    }

    /// Runs the SELECT_BUCKET handshake on this node's connection.
    pub async fn select_bucket(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        self.guard()?;
        match cancel
            .run_until_cancelled(self.connection.select_bucket(bucket))
            .await
        {
            Some(result) => result,
            None => Err(CoreError::Cancelled),
        }
    }

    /// Fetches the connection's current cluster-map.
    pub async fn fetch_config(&self, cancel: &CancellationToken) -> CoreResult<BucketConfig> {
        self.guard()?;
        match cancel
            .run_until_cancelled(self.connection.fetch_config())
            .await
        {
            Some(result) => result,
            None => Err(CoreError::Cancelled),
        }
    }

    /// Shuts the underlying connection down. Idempotent; returns true on the
    /// first call only, so callers can assert a handle is disposed at most
    /// once.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(endpoint = %self.endpoint, "disposing cluster node");
        self.connection.shutdown();
        true
    }

    /// True once [`ClusterNode::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn guard(&self) -> CoreResult<()> {
        if self.is_disposed() {
            return Err(CoreError::Disposed);
        }
        Ok(())
    }
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("endpoint", &self.endpoint)
            .field("bucket_type", &self.bucket_type)
            .field("owner", &*self.owner.lock())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::testing::{StubConnection, kv_caps};

    fn node() -> ClusterNode {
        ClusterNode::new(
            Endpoint::new("10.0.0.1", 11210, false),
            BucketType::Couchbase,
            None,
            Arc::new(StubConnection::new(kv_caps())),
        )
    }

    #[test]
    fn claim_is_first_writer_wins() {
        let node = node();
        assert!(node.is_unassigned());
        assert!(node.claim("default"));
        assert!(node.is_owned_by("default"));
        // Re-claiming by the same bucket is a no-op success.
        assert!(node.claim("default"));
        // A different bucket cannot steal the claim.
        assert!(!node.claim("other"));
        assert_eq!(node.owner().as_deref(), Some("default"));
    }

    #[test]
    fn release_only_for_claim_holder() {
        let node = node();
        assert!(node.claim("default"));
        node.release_if_owned_by("other");
        assert!(node.is_owned_by("default"));
        node.release_if_owned_by("default");
        assert!(node.is_unassigned());
    }

    #[test]
    fn dispose_runs_once() {
        let node = node();
        assert!(node.dispose());
        assert!(!node.dispose());
        assert!(node.is_disposed());
    }

    #[tokio::test]
    async fn disposed_node_rejects_io() {
        let node = node();
        node.dispose();
        let cancel = CancellationToken::new();
        assert!(matches!(
            node.fetch_config(&cancel).await,
            Err(CoreError::Disposed)
        ));
    }

    #[tokio::test]
    async fn cancelled_token_surfaces_cancelled() {
        let node = node();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            node.select_bucket("default", &cancel).await,
            Err(CoreError::Cancelled)
        ));
    }

    #[test]
    fn service_capability_mapping_is_fixed() {
        let mut caps = NodeCapabilities::default();
        assert!(!ServiceType::Query.advertised_by(&caps));
        caps.query = true;
        caps.views = true;
        assert!(ServiceType::Query.advertised_by(&caps));
        assert!(ServiceType::Views.advertised_by(&caps));
        assert!(!ServiceType::Analytics.advertised_by(&caps));
    }
}
