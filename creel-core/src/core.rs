//! Process-wide cluster coordination: bootstrap, bucket attach,
//! rebootstrap and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bucket::BucketAttachment;
use crate::config::ClusterOptions;
use crate::connstr::ConnectionString;
use crate::error::{CoreError, CoreResult};
use crate::node::{BucketType, ClusterNode, ServiceType};
use crate::pump::ConfigPump;
use crate::reconcile::TopologyReconciler;
use crate::registry::NodeRegistry;
use crate::selector::NodeSelector;
use crate::services::{Services, TraceListener};
use crate::topology::{BucketConfig, Endpoint, NodeCapabilities};

/// The coordination core. Caller-owned (not a singleton): tests and hosts
/// may run several instances side by side.
///
/// All mutable state is safe under concurrent access: the request path
/// reads the registry and selector without blocking while bootstrap and
/// the config pump mutate topology.
pub struct ClusterCore {
    options: ClusterOptions,
    services: Services,
    connstr: ConnectionString,
    tls: bool,
    registry: Arc<NodeRegistry>,
    attachments: Arc<DashMap<String, Arc<BucketAttachment>>>,
    reconciler: Arc<TopologyReconciler>,
    pump: ConfigPump,
    selector: NodeSelector,
    supports_collections: AtomicBool,
    supports_preserve_ttl: AtomicBool,
    attach_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    listeners: Mutex<Vec<Arc<dyn TraceListener>>>,
    disposed: AtomicBool,
}

impl ClusterCore {
    /// Builds a core from options and collaborators. Fails with
    /// [`CoreError::InvalidConnectionString`] when no endpoints are
    /// derivable from the connection string.
    pub fn new(options: ClusterOptions, services: Services) -> CoreResult<Self> {
        let connstr = ConnectionString::parse(&options.connection_string)?;
        let tls = options.enable_tls || connstr.scheme_tls();
        let cancel = CancellationToken::new();
        let registry = Arc::new(NodeRegistry::new());
        let attachments: Arc<DashMap<String, Arc<BucketAttachment>>> = Arc::new(DashMap::new());
        let reconciler = Arc::new(TopologyReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&attachments),
            Arc::clone(&services.nodes),
            cancel.clone(),
            tls,
        ));
        let pump = ConfigPump::new(
            Arc::clone(&reconciler),
            Arc::clone(&registry),
            cancel.clone(),
            options.config_poll_interval,
        );
        let selector = NodeSelector::new(Arc::clone(&registry));

        Ok(Self {
            options,
            services,
            connstr,
            tls,
            registry,
            attachments,
            reconciler,
            pump,
            selector,
            supports_collections: AtomicBool::new(false),
            supports_preserve_ttl: AtomicBool::new(false),
            attach_lock: tokio::sync::Mutex::new(()),
            cancel,
            listeners: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Starts sub-resources (trace listeners, config pump) and runs global
    /// bootstrap. Per-endpoint bootstrap failures are absorbed with a
    /// warning: the next user-initiated bucket open retries discovery from
    /// scratch.
    pub async fn start(&self) -> CoreResult<()> {
        self.guard()?;
        self.start_trace_listeners();
        self.pump.start(self.options.enable_config_polling);

        match self.bootstrap_global().await {
            Ok(()) => Ok(()),
            Err(err @ (CoreError::Cancelled | CoreError::Disposed)) => Err(err),
            Err(err) => {
                warn!(%err, "global bootstrap failed; deferring discovery to bucket open");
                Ok(())
            }
        }
    }

    /// Discovers the cluster through the bootstrap endpoints via GCCCP.
    ///
    /// Endpoints are attempted in connection-string order (after DNS-SRV
    /// substitution). A `BucketNotConnected` rejection switches the core to
    /// legacy mode: the seed node is kept as-is and later bucket opens
    /// drive discovery.
    pub async fn bootstrap_global(&self) -> CoreResult<()> {
        self.guard()?;
        let mut last_err = None;

        for endpoint in self.bootstrap_endpoints().await {
            let node = match self
                .services
                .nodes
                .create_and_connect(endpoint.clone(), BucketType::Couchbase, None, &self.cancel)
                .await
            {
                Ok(node) => node,
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(err) => {
                    warn!(%endpoint, %err, "bootstrap connect failed; trying next endpoint");
                    last_err = Some(err);
                    continue;
                }
            };

            match node.fetch_config(&self.cancel).await {
                Ok(mut config) => {
                    config.mark_global();
                    config.name = None;
                    config.network = config.resolve_network(&endpoint);
                    self.apply_global_bootstrap(&endpoint, &node, &config).await?;
                    self.pump.publish(config);
                    return Ok(());
                }
                Err(CoreError::BucketNotConnected) => {
                    debug!(%endpoint, "global config unsupported; running in legacy mode");
                    self.register_node(node);
                    return Ok(());
                }
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(err) => {
                    warn!(%endpoint, %err, "global config fetch failed; trying next endpoint");
                    node.dispose();
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(CoreError::InvalidConnectionString {
            input: self.connstr.input().to_string(),
        }))
    }

    /// Registers the seed and every peer listed in a freshly fetched global
    /// map. Per-peer connect failures are absorbed.
    async fn apply_global_bootstrap(
        &self,
        seed_endpoint: &Endpoint,
        seed: &Arc<ClusterNode>,
        config: &BucketConfig,
    ) -> CoreResult<()> {
        let network = config.network;
        for adapter in &config.nodes {
            let Some(endpoint) = adapter.endpoint(network, self.tls) else {
                continue;
            };
            if endpoint == *seed_endpoint {
                seed.set_adapter(adapter.clone());
                seed.refresh_capabilities();
                self.register_node(Arc::clone(seed));
            } else {
                match self
                    .services
                    .nodes
                    .create_and_connect(
                        endpoint.clone(),
                        BucketType::Couchbase,
                        Some(adapter.clone()),
                        &self.cancel,
                    )
                    .await
                {
                    Ok(peer) => {
                        self.register_node(peer);
                    }
                    Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                    Err(err) => {
                        warn!(%endpoint, %err, "peer connect failed during global bootstrap");
                    }
                }
            }
        }

        // A seed reached through an address the map does not advertise has
        // no adapter to live under; drop its connection.
        if self.registry.try_get(seed_endpoint).is_none() {
            seed.dispose();
        }
        Ok(())
    }

    /// Returns the existing attachment for `name`, or runs the attach
    /// sequence under the single-permit lock.
    pub async fn get_or_create_bucket(&self, name: &str) -> CoreResult<Arc<BucketAttachment>> {
        self.guard()?;
        if let Some(existing) = self.attachments.get(name) {
            return Ok(Arc::clone(&existing));
        }

        let _permit = self.attach_lock.lock().await;
        self.guard()?;
        // Another waiter may have completed the attach while we queued.
        if let Some(existing) = self.attachments.get(name) {
            return Ok(Arc::clone(&existing));
        }

        for endpoint in self.bootstrap_endpoints().await {
            for bucket_type in BucketType::ATTACH_ORDER {
                let node = match self.ensure_unassigned_node(&endpoint, bucket_type).await {
                    Ok(node) => node,
                    Err(err) if err.is_fatal_for_attach() => return Err(err),
                    Err(err) => {
                        warn!(%endpoint, %bucket_type, %err, "attach candidate unavailable");
                        continue;
                    }
                };

                let attachment = self.services.buckets.create(name, bucket_type);
                match attachment.attach(&node, &self.reconciler, &self.cancel).await {
                    Ok(()) => {
                        self.update_features(node.capabilities());
                        self.register_bucket(Arc::clone(&attachment));
                        return Ok(attachment);
                    }
                    Err(err) if err.is_fatal_for_attach() => return Err(err),
                    Err(err) => {
                        debug!(
                            bucket = name,
                            %endpoint,
                            %bucket_type,
                            %err,
                            "attach combination failed; trying next"
                        );
                    }
                }
            }
        }

        Err(CoreError::bucket_not_found(name))
    }

    /// Rebuilds an existing bucket after total node loss: evicts and
    /// disposes every node the bucket owns, then re-drives the bootstrap
    /// endpoints until one attach succeeds.
    pub async fn rebootstrap(&self, name: &str) -> CoreResult<()> {
        self.guard()?;
        let Some(attachment) = self
            .attachments
            .get(name)
            .map(|entry| Arc::clone(&entry))
        else {
            return Err(CoreError::bucket_not_found(name));
        };

        for node in self.registry.clear_for(name) {
            node.dispose();
        }
        attachment.detach();

        for endpoint in self.bootstrap_endpoints().await {
            let node = match self
                .ensure_unassigned_node(&endpoint, BucketType::Couchbase)
                .await
            {
                Ok(node) => node,
                Err(err) if err.is_fatal_for_attach() => return Err(err),
                Err(err) => {
                    warn!(%endpoint, %err, "rebootstrap candidate unavailable");
                    continue;
                }
            };

            match attachment.attach(&node, &self.reconciler, &self.cancel).await {
                Ok(()) => {
                    self.register_bucket(Arc::clone(&attachment));
                    return Ok(());
                }
                Err(err) if err.is_fatal_for_attach() => return Err(err),
                Err(err) => {
                    self.unregister_bucket(name);
                    warn!(bucket = name, %endpoint, %err, "rebootstrap attach failed");
                }
            }
        }

        Err(CoreError::bucket_not_found(name))
    }

    /// Feeds an in-band (CCCP push or HTTP-streamed) config into the pump.
    pub fn publish_config(&self, config: BucketConfig) -> CoreResult<()> {
        self.guard()?;
        self.pump.publish(config);
        Ok(())
    }

    /// Registers a bootstrapped attachment and subscribes it to config
    /// updates.
    pub fn register_bucket(&self, attachment: Arc<BucketAttachment>) {
        self.attachments
            .insert(attachment.name().to_string(), Arc::clone(&attachment));
        self.pump.subscribe(attachment);
    }

    /// Unsubscribes and deregisters a bucket without disposing it.
    pub fn unregister_bucket(&self, name: &str) -> Option<Arc<BucketAttachment>> {
        self.pump.unsubscribe(name);
        self.attachments.remove(name).map(|(_, attachment)| attachment)
    }

    /// Closes a bucket: deregisters it, evicts and disposes its nodes.
    pub fn remove_bucket(&self, name: &str) {
        let attachment = self.unregister_bucket(name);
        for node in self.registry.clear_for(name) {
            node.dispose();
        }
        if let Some(attachment) = attachment {
            attachment.dispose();
        }
    }

    /// Evicts the node at `endpoint`. Returns true iff the endpoint was
    /// present and its handle has been disposed.
    pub fn remove_node(&self, endpoint: &Endpoint) -> bool {
        match self.registry.remove(endpoint) {
            Some(node) => {
                if let Some(owner) = node.owner()
                    && let Some(attachment) = self.attachments.get(&owner)
                {
                    attachment.remove_node(endpoint);
                }
                node.dispose();
                true
            }
            None => false,
        }
    }

    /// Random node advertising `service`, optionally scoped to a bucket.
    pub fn get_random_node_for_service(
        &self,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> CoreResult<Arc<ClusterNode>> {
        self.guard()?;
        self.selector.select_for_service(service, bucket)
    }

    /// Registry snapshot, or a bucket's node view when scoped.
    pub fn get_nodes(&self, bucket: Option<&str>) -> Vec<Arc<ClusterNode>> {
        match bucket {
            Some(name) => self
                .attachments
                .get(name)
                .map(|attachment| attachment.nodes())
                .unwrap_or_default(),
            None => self.registry.snapshot(),
        }
    }

    /// Last observed global config, if GCCCP bootstrap produced one.
    #[must_use]
    pub fn global_config(&self) -> Option<BucketConfig> {
        self.pump.global_config()
    }

    /// Whether any connected node advertised collections support.
    #[must_use]
    pub fn supports_collections(&self) -> bool {
        self.supports_collections.load(Ordering::Acquire)
    }

    /// Whether any connected node advertised preserve-TTL support.
    #[must_use]
    pub fn supports_preserve_ttl(&self) -> bool {
        self.supports_preserve_ttl.load(Ordering::Acquire)
    }

    /// Node registry handle, for collaborators that need read access.
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Idempotent teardown: cancels in-flight work, stops the pump,
    /// disposes trace listeners, every attachment, and every remaining
    /// node. All public operations fail with `Disposed` afterwards.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.pump.stop().await;

        let listeners: Vec<Arc<dyn TraceListener>> =
            std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.dispose();
        }

        let names: Vec<String> = self
            .attachments
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            self.pump.unsubscribe(&name);
            if let Some((_, attachment)) = self.attachments.remove(&name) {
                attachment.dispose();
            }
        }

        for node in self.registry.clear_all() {
            node.dispose();
        }
    }

    /// True once [`ClusterCore::dispose`] has run.
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

    fn start_trace_listeners(&self) {
        let Some(tracer) = &self.services.tracer else {
            return;
        };
        let sections = [
            &self.options.threshold_tracing,
            &self.options.orphan_tracing,
        ];
        for section in sections {
            if !section.enabled {
                continue;
            }
            if let Some(listener) = &section.listener {
                tracer.start(Arc::clone(listener));
                self.listeners.lock().push(Arc::clone(listener));
            }
        }
    }

    /// Bootstrap endpoints in connection-string order, with DNS-SRV
    /// substitution when the string names a single port-less hostname.
    /// Resolution failure is non-fatal and logged.
    async fn bootstrap_endpoints(&self) -> Vec<Endpoint> {
        if let Some(record) = self.connstr.srv_record(self.tls) {
            match self.services.dns.resolve_srv(&record, &self.cancel).await {
                Ok(resolved) if !resolved.is_empty() => return resolved,
                Ok(_) => debug!(record, "srv lookup returned no targets"),
                Err(err) => warn!(record, %err, "srv lookup failed; using literal endpoints"),
            }
        }
        self.connstr.endpoints(self.tls)
    }

    /// Reuses an unassigned node at `endpoint` for `bucket_type` or creates
    /// and registers a fresh one. An unassigned node of the wrong flavor is
    /// replaced; an owned node blocks the slot.
    async fn ensure_unassigned_node(
        &self,
        endpoint: &Endpoint,
        bucket_type: BucketType,
    ) -> CoreResult<Arc<ClusterNode>> {
        if let Some(existing) = self.registry.first_unassigned(endpoint, bucket_type) {
            return Ok(existing);
        }
        if let Some(existing) = self.registry.try_get(endpoint) {
            if !existing.is_unassigned() {
                return Err(CoreError::connect(
                    endpoint.clone(),
                    "endpoint already owned by another bucket",
                ));
            }
            if let Some(stale) = self.registry.remove(endpoint) {
                stale.dispose();
            }
        }

        let node = self
            .services
            .nodes
            .create_and_connect(endpoint.clone(), bucket_type, None, &self.cancel)
            .await?;
        if !self.registry.add(Arc::clone(&node)) {
            node.dispose();
            return Err(CoreError::connect(
                endpoint.clone(),
                "lost node registration race",
            ));
        }
        self.update_features(node.capabilities());
        Ok(node)
    }

    /// Adds a node to the registry and folds its capabilities into the
    /// core-wide feature flags. A duplicate endpoint keeps the established
    /// handle and disposes the newcomer.
    fn register_node(&self, node: Arc<ClusterNode>) {
        if self.registry.add(Arc::clone(&node)) {
            self.update_features(node.capabilities());
        } else {
            node.dispose();
        }
    }

    /// Monotone within the core's lifetime: once a handshake observes a
    /// feature, request dispatch observes it thereafter.
    fn update_features(&self, caps: NodeCapabilities) {
        if caps.collections {
            self.supports_collections.store(true, Ordering::Release);
        }
        if caps.preserve_ttl {
            self.supports_preserve_ttl.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for ClusterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCore")
            .field("nodes", &self.registry.len())
            .field("buckets", &self.attachments.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
