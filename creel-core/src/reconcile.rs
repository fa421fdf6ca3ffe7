//! Topology reconciliation: reshaping the node registry and a bucket's
//! node view to match an incoming cluster-map.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bucket::BucketAttachment;
use crate::error::{CoreError, CoreResult};
use crate::node::{BucketType, ClusterNode, ServiceType};
use crate::registry::NodeRegistry;
use crate::services::ClusterNodeFactory;
use crate::topology::{BucketConfig, Endpoint, NetworkResolution, NodeAdapter};

/// Applies cluster-maps: claims or creates nodes for every adapter in the
/// map, then prunes registry entries whose host disappeared from it.
///
/// Per-node failures are logged and skipped (the node is simply absent from
/// the resulting view); only cancellation aborts an application.
pub struct TopologyReconciler {
    registry: Arc<NodeRegistry>,
    attachments: Arc<DashMap<String, Arc<BucketAttachment>>>,
    factory: Arc<dyn ClusterNodeFactory>,
    cancel: CancellationToken,
    tls: bool,
}

impl TopologyReconciler {
    /// Reconciler over the given registry and attachments map.
    pub fn new(
        registry: Arc<NodeRegistry>,
        attachments: Arc<DashMap<String, Arc<BucketAttachment>>>,
        factory: Arc<dyn ClusterNodeFactory>,
        cancel: CancellationToken,
        tls: bool,
    ) -> Self {
        Self {
            registry,
            attachments,
            factory,
            cancel,
            tls,
        }
    }

    /// Applies `config` to `bucket`. Idempotent for an already-applied
    /// revision; strictly older revisions are rejected as no-ops.
    pub async fn apply(
        &self,
        bucket: &BucketAttachment,
        config: &BucketConfig,
    ) -> CoreResult<()> {
        if bucket.is_disposed() {
            return Ok(());
        }
        if !bucket.accepts_revision(config.rev) {
            debug!(
                bucket = bucket.name(),
                rev = config.rev,
                last = ?bucket.last_revision(),
                "discarding stale config revision"
            );
            return Ok(());
        }

        let network = config.network;
        for adapter in &config.nodes {
            let Some(endpoint) = adapter.endpoint(network, self.tls) else {
                debug!(host = adapter.host(network), "adapter advertises no kv port; skipping");
                continue;
            };

            if let Some(node) = self.registry.try_get(&endpoint) {
                if node.is_unassigned() && bucket.bucket_type() != BucketType::Memcached {
                    if self.bind_node(&node, bucket).await? {
                        node.set_adapter(adapter.clone());
                        bucket.add_node(node);
                    }
                } else if !node.is_unassigned() && bucket.bucket_type() == BucketType::Memcached {
                    // Memcached buckets may share a node by endpoint alias.
                    node.set_adapter(adapter.clone());
                    bucket.add_node(node);
                } else if bucket.contains(&endpoint) {
                    node.set_adapter(adapter.clone());
                }
            } else {
                self.connect_node(bucket, endpoint, adapter).await?;
            }
        }

        self.prune(bucket, config, network);
        bucket.record_revision(config.rev);
        Ok(())
    }

    /// Binds an unassigned registry node to `bucket`: SELECT_BUCKET when the
    /// node speaks KV, then capability refresh and claim. Returns false when
    /// the handshake failed and the node was left as-is.
    async fn bind_node(
        &self,
        node: &Arc<ClusterNode>,
        bucket: &BucketAttachment,
    ) -> CoreResult<bool> {
        if node.advertises(ServiceType::Kv) {
            match node.select_bucket(bucket.name(), &self.cancel).await {
                Ok(()) => node.refresh_capabilities(),
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(err) => {
                    warn!(
                        bucket = bucket.name(),
                        endpoint = %node.endpoint(),
                        %err,
                        "select-bucket failed during reconciliation"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(node.claim(bucket.name()))
    }

    /// Creates, binds and registers a node for an adapter with no registry
    /// entry. Connection failures are absorbed.
    async fn connect_node(
        &self,
        bucket: &BucketAttachment,
        endpoint: Endpoint,
        adapter: &NodeAdapter,
    ) -> CoreResult<()> {
        let created = self
            .factory
            .create_and_connect(
                endpoint.clone(),
                bucket.bucket_type(),
                Some(adapter.clone()),
                &self.cancel,
            )
            .await;
        let node = match created {
            Ok(node) => node,
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(err) => {
                warn!(
                    bucket = bucket.name(),
                    %endpoint,
                    %err,
                    "failed to connect node from cluster-map"
                );
                return Ok(());
            }
        };

        if bucket.bucket_type() == BucketType::Couchbase && !self.bind_node(&node, bucket).await? {
            node.dispose();
            return Ok(());
        }
        if bucket.bucket_type() == BucketType::Memcached {
            node.claim(bucket.name());
        }

        if self.registry.add(Arc::clone(&node)) {
            bucket.add_node(node);
        } else {
            // Lost a registration race; the surviving entry wins.
            node.dispose();
        }
        Ok(())
    }

    /// Removes and disposes every registry node whose host is absent from
    /// the new map. Host-only comparison keeps nodes whose ports moved
    /// between revisions.
    fn prune(&self, bucket: &BucketAttachment, config: &BucketConfig, network: NetworkResolution) {
        let hosts = config.host_set(network);
        for node in self.registry.snapshot() {
            if hosts.contains(node.endpoint().host.as_str()) {
                continue;
            }
            let Some(removed) = self.registry.remove(node.endpoint()) else {
                continue;
            };
            if let Some(owner) = removed.owner() {
                if owner == bucket.name() {
                    bucket.remove_node(removed.endpoint());
                } else if let Some(attachment) = self.attachments.get(&owner) {
                    attachment.remove_node(removed.endpoint());
                }
            }
            debug!(endpoint = %removed.endpoint(), "pruning node absent from cluster-map");
            removed.dispose();
        }
    }
}
