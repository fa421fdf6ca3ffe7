use crate::node::ServiceType;
use crate::topology::Endpoint;
use thiserror::Error;

/// Errors produced by the cluster coordination core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No endpoints could be derived from the connection string.
    #[error("invalid connection string: no endpoints derivable from {input:?}")]
    InvalidConnectionString {
        /// Connection string as supplied by the caller.
        input: String,
    },
    /// Every attach combination was exhausted without a bootstrapped result.
    #[error("bucket {name:?} not found on any bootstrap endpoint")]
    BucketNotFound {
        /// Bucket name requested by the caller.
        name: String,
    },
    /// No registered node advertises the capability for the service.
    #[error("no cluster node available for service {service}")]
    ServiceNotAvailable {
        /// Service the caller asked to route to.
        service: ServiceType,
    },
    /// A bucket-scoped service is absent on every node owned by the bucket.
    #[error("service missing on nodes owned by bucket {bucket:?}")]
    ServiceMissing {
        /// Bucket whose node view lacks the service.
        bucket: String,
    },
    /// The server rejected the request due to rate limiting. Never absorbed.
    #[error("rate limited by the server")]
    RateLimited,
    /// The server does not support bucket-less config fetch (pre-6.5).
    ///
    /// Produced by the protocol layer during GCCCP bootstrap; the core reacts
    /// by falling back to legacy per-bucket discovery.
    #[error("bucket not connected: global config fetch unsupported")]
    BucketNotConnected,
    /// Failed to establish or use a connection to a node.
    #[error("connection to {endpoint} failed: {reason}")]
    Connect {
        /// Endpoint the connection was aimed at.
        endpoint: Endpoint,
        /// Collaborator-supplied failure description.
        reason: String,
    },
    /// Cancellation was observed during a suspendable operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The core has been disposed; no further operations are accepted.
    #[error("cluster core disposed")]
    Disposed,
}

impl CoreError {
    /// Connection failure against the given endpoint.
    pub fn connect(endpoint: Endpoint, reason: impl Into<String>) -> Self {
        Self::Connect {
            endpoint,
            reason: reason.into(),
        }
    }

    /// Bucket lookup failure for the given name.
    pub fn bucket_not_found(name: impl Into<String>) -> Self {
        Self::BucketNotFound { name: name.into() }
    }

    /// True when retrying another endpoint/bucket-type combination is
    /// pointless and the error must surface to the caller as-is.
    pub fn is_fatal_for_attach(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Cancelled | Self::Disposed)
    }
}

/// Result alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
