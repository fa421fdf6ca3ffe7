//! Test doubles shared by the crate's unit tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::node::{BucketType, ClusterNode};
use crate::services::{ClusterNodeFactory, NodeConnection, SrvResolver};
use crate::topology::{BucketConfig, Endpoint, NodeAdapter, NodeCapabilities, ServicePorts};

pub(crate) fn kv_caps() -> NodeCapabilities {
    NodeCapabilities {
        kv: true,
        ..NodeCapabilities::default()
    }
}

pub(crate) fn query_caps() -> NodeCapabilities {
    NodeCapabilities {
        kv: true,
        query: true,
        ..NodeCapabilities::default()
    }
}

pub(crate) fn views_caps() -> NodeCapabilities {
    NodeCapabilities {
        kv: true,
        views: true,
        ..NodeCapabilities::default()
    }
}

/// Scripted SELECT_BUCKET outcome.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ScriptedSelect {
    Succeed,
    RateLimited,
    Fail,
}

/// Scripted cluster-map fetch outcome.
#[derive(Debug, Clone)]
pub(crate) enum ScriptedFetch {
    Config(BucketConfig),
    NotConnected,
    Fail,
}

/// Scriptable [`NodeConnection`] recording handshake traffic.
pub(crate) struct StubConnection {
    caps: Mutex<NodeCapabilities>,
    select: Mutex<ScriptedSelect>,
    fetch: Mutex<ScriptedFetch>,
    pub(crate) selected: Mutex<Vec<String>>,
    pub(crate) shutdowns: AtomicUsize,
}

impl StubConnection {
    pub(crate) fn new(caps: NodeCapabilities) -> Self {
        Self {
            caps: Mutex::new(caps),
            select: Mutex::new(ScriptedSelect::Succeed),
            fetch: Mutex::new(ScriptedFetch::NotConnected),
            selected: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_fetch(self, fetch: ScriptedFetch) -> Self {
        *self.fetch.lock() = fetch;
        self
    }

    pub(crate) fn with_select(self, select: ScriptedSelect) -> Self {
        *self.select.lock() = select;
        self
    }
}

#[async_trait]
impl NodeConnection for StubConnection {
    async fn select_bucket(&self, bucket: &str) -> CoreResult<()> {
        match *self.select.lock() {
            ScriptedSelect::Succeed => {
                self.selected.lock().push(bucket.to_string());
                Ok(())
            }
            ScriptedSelect::RateLimited => Err(CoreError::RateLimited),
            ScriptedSelect::Fail => Err(CoreError::connect(
                Endpoint::new("stub", 0, false),
                "scripted select failure",
            )),
        }
    }

    async fn fetch_config(&self) -> CoreResult<BucketConfig> {
        match self.fetch.lock().clone() {
            ScriptedFetch::Config(config) => Ok(config),
            ScriptedFetch::NotConnected => Err(CoreError::BucketNotConnected),
            ScriptedFetch::Fail => Err(CoreError::connect(
                Endpoint::new("stub", 0, false),
                "scripted fetch failure",
            )),
        }
    }

    fn capabilities(&self) -> NodeCapabilities {
        *self.caps.lock()
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn make_node(host: &str) -> Arc<ClusterNode> {
    make_node_with_caps(host, kv_caps())
}

pub(crate) fn make_node_with_caps(host: &str, caps: NodeCapabilities) -> Arc<ClusterNode> {
    Arc::new(ClusterNode::new(
        Endpoint::new(host, 11210, false),
        BucketType::Couchbase,
        None,
        Arc::new(StubConnection::new(caps)),
    ))
}

pub(crate) fn adapter(host: &str, port: u16) -> NodeAdapter {
    NodeAdapter {
        hostname: host.to_string(),
        services: ServicePorts {
            kv: Some(port),
            kv_tls: None,
        },
        alternate: None,
        capabilities: kv_caps(),
    }
}

pub(crate) fn config_for(name: &str, rev: u64, hosts: &[&str]) -> BucketConfig {
    let mut config = BucketConfig::new(
        rev,
        hosts.iter().map(|host| adapter(host, 11210)).collect(),
    );
    config.name = Some(name.to_string());
    config.network = crate::topology::NetworkResolution::Internal;
    config
}

/// Factory connecting every endpoint with a KV-capable stub connection.
pub(crate) struct StubFactory {
    created: AtomicUsize,
}

impl StubFactory {
    pub(crate) fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
        }
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClusterNodeFactory for StubFactory {
    async fn create_and_connect(
        &self,
        endpoint: Endpoint,
        bucket_type: BucketType,
        adapter: Option<NodeAdapter>,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<ClusterNode>> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ClusterNode::new(
            endpoint,
            bucket_type,
            adapter,
            Arc::new(StubConnection::new(kv_caps())),
        )))
    }
}

/// Resolver answering with a fixed endpoint list.
pub(crate) struct StubResolver {
    endpoints: Vec<Endpoint>,
}

impl StubResolver {
    pub(crate) fn empty() -> Self {
        Self {
            endpoints: Vec::new(),
        }
    }
}

#[async_trait]
impl SrvResolver for StubResolver {
    async fn resolve_srv(
        &self,
        _name: &str,
        _cancel: &CancellationToken,
    ) -> CoreResult<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}
