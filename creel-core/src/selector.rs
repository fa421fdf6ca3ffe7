//! Service-based node selection for the request path.

use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::node::{ClusterNode, ServiceType};
use crate::registry::NodeRegistry;

/// Random-with-predicate selection over the registry for a service type,
/// optionally scoped to a bucket's owned nodes.
#[derive(Clone)]
pub struct NodeSelector {
    registry: Arc<NodeRegistry>,
}

impl NodeSelector {
    /// Selector over the given registry.
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Picks a random node advertising `service`.
    ///
    /// With a `bucket` scope (mandatory for [`ServiceType::Views`]) only
    /// nodes owned by that bucket are considered, and exhaustion reports
    /// [`CoreError::ServiceMissing`]; unscoped exhaustion reports
    /// [`CoreError::ServiceNotAvailable`].
    pub fn select_for_service(
        &self,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> CoreResult<Arc<ClusterNode>> {
        match bucket {
            Some(name) => self
                .registry
                .random(|node| node.advertises(service) && node.is_owned_by(name))
                .ok_or_else(|| CoreError::ServiceMissing {
                    bucket: name.to_string(),
                }),
            None if service == ServiceType::Views => {
                // Views routing is defined only against a bucket's nodes.
                Err(CoreError::ServiceNotAvailable { service })
            }
            None => self
                .registry
                .random(|node| node.advertises(service))
                .ok_or(CoreError::ServiceNotAvailable { service }),
        }
    }
}
