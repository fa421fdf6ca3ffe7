//! Cluster-map data model: endpoints, per-node adapters and versioned
//! bucket configurations as published by the server.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single addressable service location on a cluster node.
///
/// Endpoints compare by exact `(host, port, tls)` equality; host-only
/// comparison for pruning goes through [`Endpoint::same_host`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP literal.
    pub host: String,
    /// Service port.
    pub port: u16,
    /// Whether the connection is TLS-wrapped.
    pub tls: bool,
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Host-only equality used when pruning nodes across config revisions,
    /// where alternate-address ports may differ between revisions.
    #[must_use]
    pub fn same_host(&self, host: &str) -> bool {
        self.host == host
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How hostnames in a cluster-map are resolved to dialable addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkResolution {
    /// Pick internal or external automatically from the seed endpoint.
    #[default]
    Auto,
    /// Always use the internal (default) addresses.
    Internal,
    /// Always use the advertised alternate addresses.
    External,
}

/// Key distribution strategy advertised by a bucket config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeLocator {
    /// vBucket hashing, used by Couchbase-type buckets.
    #[default]
    VBucket,
    /// Consistent (ketama) hashing, used by Memcached-type buckets.
    Ketama,
}

/// KV service ports carried by an adapter's address block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServicePorts {
    /// Plain KV port, if the node runs the data service.
    pub kv: Option<u16>,
    /// TLS KV port, if the node runs the data service over TLS.
    pub kv_tls: Option<u16>,
}

impl ServicePorts {
    /// Port for the requested security mode, if advertised.
    #[must_use]
    pub fn kv_port(&self, tls: bool) -> Option<u16> {
        if tls { self.kv_tls } else { self.kv }
    }
}

/// Externally reachable address block advertised alongside the internal one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddress {
    /// External hostname.
    pub hostname: String,
    /// External service ports.
    #[serde(default)]
    pub services: ServicePorts,
}

/// Advertised capability bits for a single node.
///
/// Fixed at handshake time for a given connection; refreshed from the
/// connection after SELECT_BUCKET upgrades the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeCapabilities {
    /// Data (key/value) service.
    pub kv: bool,
    /// Query (N1QL) service.
    pub query: bool,
    /// Full-text search service.
    pub search: bool,
    /// Analytics service.
    pub analytics: bool,
    /// Views service.
    pub views: bool,
    /// Eventing service.
    pub eventing: bool,
    /// Server supports scoped collections.
    pub collections: bool,
    /// Server supports preserve-TTL mutations.
    pub preserve_ttl: bool,
}

/// The per-node slice of a cluster-map used to construct a live node handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAdapter {
    /// Internal hostname for the node.
    pub hostname: String,
    /// Internal service ports.
    #[serde(default)]
    pub services: ServicePorts,
    /// Alternate (external) address block, if advertised.
    #[serde(default)]
    pub alternate: Option<AlternateAddress>,
    /// Capability bits the map attributes to this node.
    #[serde(default)]
    pub capabilities: NodeCapabilities,
}

impl NodeAdapter {
    /// Adapter with only an internal hostname and KV ports.
    pub fn new(hostname: impl Into<String>, services: ServicePorts) -> Self {
        Self {
            hostname: hostname.into(),
            services,
            alternate: None,
            capabilities: NodeCapabilities::default(),
        }
    }

    /// Hostname under the given resolution mode.
    ///
    /// `Auto` falls back to the internal hostname; resolving `Auto` into a
    /// concrete mode is the config's job, see
    /// [`BucketConfig::resolve_network`].
    #[must_use]
    pub fn host(&self, network: NetworkResolution) -> &str {
        match network {
            NetworkResolution::External => self
                .alternate
                .as_ref()
                .map_or(self.hostname.as_str(), |alt| alt.hostname.as_str()),
            NetworkResolution::Auto | NetworkResolution::Internal => &self.hostname,
        }
    }

    /// KV endpoint under the given resolution mode, if the node runs KV.
    #[must_use]
    pub fn endpoint(&self, network: NetworkResolution, tls: bool) -> Option<Endpoint> {
        let (host, ports) = match network {
            NetworkResolution::External => match &self.alternate {
                Some(alt) => (alt.hostname.as_str(), &alt.services),
                None => (self.hostname.as_str(), &self.services),
            },
            NetworkResolution::Auto | NetworkResolution::Internal => {
                (self.hostname.as_str(), &self.services)
            }
        };
        ports.kv_port(tls).map(|port| Endpoint::new(host, port, tls))
    }
}

/// Versioned snapshot of cluster topology for a bucket (or, during GCCCP
/// bootstrap, for the cluster as a whole).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Revision counter, monotonically non-decreasing per source.
    pub rev: u64,
    /// Bucket name; `None` for bucket-less (global) maps.
    pub name: Option<String>,
    /// Per-node adapters in server-provided order.
    pub nodes: Vec<NodeAdapter>,
    /// Key distribution strategy for the bucket.
    #[serde(default)]
    pub locator: NodeLocator,
    /// Address-resolution hint applied when dialing nodes from this map.
    #[serde(default)]
    pub network: NetworkResolution,
    /// True only when the map was produced by GCCCP bootstrap.
    #[serde(default)]
    pub global: bool,
}

impl BucketConfig {
    /// Bucket-less map skeleton at the given revision.
    pub fn new(rev: u64, nodes: Vec<NodeAdapter>) -> Self {
        Self {
            rev,
            name: None,
            nodes,
            locator: NodeLocator::default(),
            network: NetworkResolution::default(),
            global: false,
        }
    }

    /// Marks the map as produced by GCCCP bootstrap.
    pub fn mark_global(&mut self) {
        self.global = true;
    }

    /// Resolves an `Auto` network hint against the seed endpoint the map was
    /// fetched through: if the seed host matches any advertised alternate
    /// hostname the cluster is being reached from outside, so alternate
    /// addresses win; otherwise internal addresses are used.
    #[must_use]
    pub fn resolve_network(&self, seed: &Endpoint) -> NetworkResolution {
        match self.network {
            NetworkResolution::Auto => {
                let external = self.nodes.iter().any(|node| {
                    node.alternate
                        .as_ref()
                        .is_some_and(|alt| seed.same_host(&alt.hostname))
                });
                if external {
                    NetworkResolution::External
                } else {
                    NetworkResolution::Internal
                }
            }
            resolved => resolved,
        }
    }

    /// Set of hosts present in this map under the given resolution mode.
    ///
    /// Pruning compares against this set by host only.
    #[must_use]
    pub fn host_set(&self, network: NetworkResolution) -> HashSet<&str> {
        self.nodes.iter().map(|node| node.host(network)).collect()
    }
}
