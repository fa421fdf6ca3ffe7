//! Thread-safe collection of live node handles keyed by endpoint.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::node::{BucketType, ClusterNode};
use crate::topology::Endpoint;

/// Registry of every connected node, unique per endpoint.
///
/// Readers never block: lookups and snapshots run against the concurrent
/// map, and iteration always goes through a collected snapshot so a
/// concurrent add/remove cannot mutate a reader's view mid-walk.
pub struct NodeRegistry {
    nodes: DashMap<Endpoint, Arc<ClusterNode>>,
    rng: Mutex<SmallRng>,
}

impl NodeRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Inserts a handle; returns false when the endpoint is already present.
    pub fn add(&self, node: Arc<ClusterNode>) -> bool {
        match self.nodes.entry(node.endpoint().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(node);
                true
            }
        }
    }

    /// Removes and returns the handle at `endpoint`, if present.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<ClusterNode>> {
        self.nodes.remove(endpoint).map(|(_, node)| node)
    }

    /// Handle at `endpoint`, if present.
    #[must_use]
    pub fn try_get(&self, endpoint: &Endpoint) -> Option<Arc<ClusterNode>> {
        self.nodes.get(endpoint).map(|entry| Arc::clone(&*entry))
    }

    /// Removes every handle, returning them for disposal.
    pub fn clear_all(&self) -> Vec<Arc<ClusterNode>> {
        let endpoints: Vec<Endpoint> = self
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        endpoints
            .iter()
            .filter_map(|endpoint| self.remove(endpoint))
            .collect()
    }

    /// Removes every handle owned by `bucket`, returning them for disposal.
    pub fn clear_for(&self, bucket: &str) -> Vec<Arc<ClusterNode>> {
        let owned: Vec<Endpoint> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().is_owned_by(bucket))
            .map(|entry| entry.key().clone())
            .collect();
        owned
            .iter()
            .filter_map(|endpoint| self.remove(endpoint))
            .collect()
    }

    /// Snapshot of all handles. Stable for the caller regardless of
    /// concurrent mutation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ClusterNode>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(&*entry))
            .collect()
    }

    /// First handle satisfying `predicate`, in snapshot order.
    pub fn find_first<F>(&self, predicate: F) -> Option<Arc<ClusterNode>>
    where
        F: Fn(&ClusterNode) -> bool,
    {
        self.nodes
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(&*entry))
    }

    /// Uniform random pick over the handles satisfying `predicate` at
    /// snapshot time. The returned `Arc` keeps the handle alive between
    /// selection and return; disposed handles never match.
    pub fn random<F>(&self, predicate: F) -> Option<Arc<ClusterNode>>
    where
        F: Fn(&ClusterNode) -> bool,
    {
        let matching: Vec<Arc<ClusterNode>> = self
            .nodes
            .iter()
            .filter(|entry| !entry.value().is_disposed() && predicate(entry.value()))
            .map(|entry| Arc::clone(&*entry))
            .collect();
        if matching.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..matching.len());
        matching.into_iter().nth(index)
    }

    /// First unassigned handle connected to `endpoint` for `bucket_type`.
    #[must_use]
    pub fn first_unassigned(
        &self,
        endpoint: &Endpoint,
        bucket_type: BucketType,
    ) -> Option<Arc<ClusterNode>> {
        self.try_get(endpoint).filter(|node| {
            node.is_unassigned() && node.bucket_type() == bucket_type && !node.is_disposed()
        })
    }

    /// Number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no handles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
