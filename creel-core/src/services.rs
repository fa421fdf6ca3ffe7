//! Collaborator traits and the dependency bundle handed to the core at
//! construction time. No runtime reflection: everything the core talks to
//! arrives here as an explicit trait object.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketFactory, DefaultBucketFactory};
use crate::error::CoreResult;
use crate::node::{BucketType, ClusterNode};
use crate::topology::{BucketConfig, Endpoint, NodeAdapter, NodeCapabilities};

/// Protocol surface of one established node connection.
///
/// Implemented by the KV transport layer; the core drives only the
/// handshake and cluster-map operations through it.
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// Binds the connection to a bucket via SELECT_BUCKET.
    async fn select_bucket(&self, bucket: &str) -> CoreResult<()>;

    /// Fetches the connection's current cluster-map (GCCCP before a bucket
    /// is selected, CCCP afterwards). Pre-6.5 servers answer a bucket-less
    /// fetch with [`CoreError::BucketNotConnected`](crate::error::CoreError).
    async fn fetch_config(&self) -> CoreResult<BucketConfig>;

    /// Capability flags advertised during the most recent handshake.
    fn capabilities(&self) -> NodeCapabilities;

    /// Tears the connection down. Fire-and-forget; never fails.
    fn shutdown(&self);
}

/// DNS-SRV resolution, abstracted to a pure lookup.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Resolves an SRV record name to endpoints. May return an empty list;
    /// errors are non-fatal to bootstrap (callers fall back to literal
    /// endpoints).
    async fn resolve_srv(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<Endpoint>>;
}

/// The only way node handles are born. Ownership of the returned handle
/// transfers to the caller.
#[async_trait]
pub trait ClusterNodeFactory: Send + Sync {
    /// Establishes a connection to `endpoint` for the given bucket flavor
    /// and wraps it into a handle, optionally seeding the cluster-map slice.
    async fn create_and_connect(
        &self,
        endpoint: Endpoint,
        bucket_type: BucketType,
        adapter: Option<NodeAdapter>,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<ClusterNode>>;
}

/// A tracing listener owned by the core and disposed with it.
pub trait TraceListener: Send + Sync {
    /// Releases the listener's resources. Idempotent.
    fn dispose(&self);
}

/// Optional request-tracing subsystem.
pub trait RequestTracer: Send + Sync {
    /// Registers a listener with the tracer.
    fn start(&self, listener: Arc<dyn TraceListener>);
}

/// Dependency bundle for [`ClusterCore`](crate::core::ClusterCore).
#[derive(Clone)]
pub struct Services {
    /// DNS-SRV resolver.
    pub dns: Arc<dyn SrvResolver>,
    /// Node factory.
    pub nodes: Arc<dyn ClusterNodeFactory>,
    /// Bucket attachment factory.
    pub buckets: Arc<dyn BucketFactory>,
    /// Request tracer, if the host application runs one.
    pub tracer: Option<Arc<dyn RequestTracer>>,
}

impl Services {
    /// Bundle with the default bucket factory and no tracer.
    pub fn new(dns: Arc<dyn SrvResolver>, nodes: Arc<dyn ClusterNodeFactory>) -> Self {
        Self {
            dns,
            nodes,
            buckets: Arc::new(DefaultBucketFactory),
            tracer: None,
        }
    }

    /// Overrides the bucket factory.
    #[must_use]
    pub fn with_bucket_factory(mut self, buckets: Arc<dyn BucketFactory>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Attaches a request tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn RequestTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("tracer", &self.tracer.is_some())
            .finish_non_exhaustive()
    }
}
