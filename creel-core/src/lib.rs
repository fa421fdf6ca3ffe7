//! Cluster coordination core for the Creel document database client.
//!
//! Given a connection string and a set of collaborators, the core discovers
//! the server cluster, keeps one live node handle per endpoint, attaches
//! buckets on demand, reconciles topology against server-published
//! cluster-maps and answers service-based node selection for the request
//! path.
//!
//! Protocol framing, DNS-SRV resolution mechanics, config streaming and the
//! user-facing API live outside this crate; they reach the core through the
//! traits in [`services`].

/// Per-bucket attachment state and the bucket factory seam.
pub mod bucket;
/// Options recognized by the core.
pub mod config;
/// Connection-string parsing.
pub mod connstr;
/// The process-wide coordination core.
pub mod core;
/// Error kinds produced by the core.
pub mod error;
/// Live node handles and service/capability mapping.
pub mod node;
/// Config fan-out and CCCP polling.
pub mod pump;
/// Cluster-map reconciliation.
pub mod reconcile;
/// Thread-safe node registry.
pub mod registry;
/// Service-based node selection.
pub mod selector;
/// Collaborator traits and the dependency bundle.
pub mod services;
/// Cluster-map data model.
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use bucket::{BucketAttachment, BucketFactory, DefaultBucketFactory};
pub use config::{ClusterOptions, TracingSectionOptions};
pub use connstr::ConnectionString;
pub use self::core::ClusterCore;
pub use error::{CoreError, CoreResult};
pub use node::{BucketType, ClusterNode, ServiceType};
pub use pump::ConfigPump;
pub use reconcile::TopologyReconciler;
pub use registry::NodeRegistry;
pub use selector::NodeSelector;
pub use services::{
    ClusterNodeFactory, NodeConnection, RequestTracer, Services, SrvResolver, TraceListener,
};
pub use topology::{
    AlternateAddress, BucketConfig, Endpoint, NetworkResolution, NodeAdapter, NodeCapabilities,
    NodeLocator, ServicePorts,
};
