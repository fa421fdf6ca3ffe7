//! Scripted collaborators for driving the core end to end.

#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use creel_core::{
    BucketAttachment, BucketConfig, BucketFactory, BucketType, ClusterNode, ClusterNodeFactory,
    CoreError, CoreResult, Endpoint, NodeAdapter, NodeCapabilities, NodeConnection, ServicePorts,
    Services, SrvResolver,
};

pub fn ep(host: &str) -> Endpoint {
    Endpoint::new(host, 11210, false)
}

pub fn default_caps() -> NodeCapabilities {
    NodeCapabilities {
        kv: true,
        query: true,
        ..NodeCapabilities::default()
    }
}

pub fn adapter(host: &str) -> NodeAdapter {
    NodeAdapter {
        hostname: host.to_string(),
        services: ServicePorts {
            kv: Some(11210),
            kv_tls: Some(11207),
        },
        alternate: None,
        capabilities: default_caps(),
    }
}

/// Bucket map (named) or bucket-less map (`name = None`) over the hosts.
pub fn map_config(name: Option<&str>, rev: u64, hosts: &[&str]) -> BucketConfig {
    let mut config = BucketConfig::new(rev, hosts.iter().map(|host| adapter(host)).collect());
    config.name = name.map(str::to_string);
    config
}

#[derive(Clone)]
pub enum FetchScript {
    Config(BucketConfig),
    NotConnected,
    Fail,
}

#[derive(Clone, Copy)]
pub enum SelectScript {
    Ok,
    RateLimited,
    Fail,
}

/// Queue shared by every connection to the same host; the final entry
/// repeats so scripts describe "and from then on".
#[derive(Clone)]
struct SharedQueue<T: Clone> {
    entries: Arc<Mutex<VecDeque<T>>>,
}

impl<T: Clone> SharedQueue<T> {
    fn new(entries: Vec<T>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries.into())),
        }
    }

    fn next(&self) -> Option<T> {
        let mut entries = self.entries.lock();
        if entries.len() > 1 {
            entries.pop_front()
        } else {
            entries.front().cloned()
        }
    }
}

/// Per-host behavior script.
#[derive(Clone)]
pub struct HostScript {
    pub caps: NodeCapabilities,
    pub fetches: Vec<FetchScript>,
    pub selects: Vec<SelectScript>,
    pub refuse_connect: bool,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            caps: default_caps(),
            fetches: Vec::new(),
            selects: Vec::new(),
            refuse_connect: false,
        }
    }
}

impl HostScript {
    pub fn fetching(fetches: Vec<FetchScript>) -> Self {
        Self {
            fetches,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_selects(mut self, selects: Vec<SelectScript>) -> Self {
        self.selects = selects;
        self
    }

    #[must_use]
    pub fn refusing_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }
}

struct HostState {
    caps: NodeCapabilities,
    fetches: SharedQueue<FetchScript>,
    selects: SharedQueue<SelectScript>,
    refuse_connect: bool,
}

impl HostState {
    fn from_script(script: HostScript) -> Self {
        Self {
            caps: script.caps,
            fetches: SharedQueue::new(script.fetches),
            selects: SharedQueue::new(script.selects),
            refuse_connect: script.refuse_connect,
        }
    }
}

pub struct MockConnection {
    caps: NodeCapabilities,
    fetches: SharedQueue<FetchScript>,
    selects: SharedQueue<SelectScript>,
    pub selected: Mutex<Vec<String>>,
}

#[async_trait]
impl NodeConnection for MockConnection {
    async fn select_bucket(&self, bucket: &str) -> CoreResult<()> {
        match self.selects.next().unwrap_or(SelectScript::Ok) {
            SelectScript::Ok => {
                self.selected.lock().push(bucket.to_string());
                Ok(())
            }
            SelectScript::RateLimited => Err(CoreError::RateLimited),
            SelectScript::Fail => Err(CoreError::connect(
                Endpoint::new("mock", 0, false),
                "scripted select failure",
            )),
        }
    }

    async fn fetch_config(&self) -> CoreResult<BucketConfig> {
        match self.fetches.next().unwrap_or(FetchScript::NotConnected) {
            FetchScript::Config(config) => Ok(config),
            FetchScript::NotConnected => Err(CoreError::BucketNotConnected),
            FetchScript::Fail => Err(CoreError::connect(
                Endpoint::new("mock", 0, false),
                "scripted fetch failure",
            )),
        }
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.caps
    }

    fn shutdown(&self) {}
}

/// Node factory scripted per host. Hosts without a script connect with
/// default capabilities and no cluster-map.
pub struct MockFactory {
    hosts: Mutex<HashMap<String, HostState>>,
    created: Mutex<Vec<Endpoint>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_host(self, host: &str, script: HostScript) -> Self {
        self.hosts
            .lock()
            .insert(host.to_string(), HostState::from_script(script));
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn created_for(&self, host: &str) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|endpoint| endpoint.host == host)
            .count()
    }
}

#[async_trait]
impl ClusterNodeFactory for MockFactory {
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

        let mut hosts = self.hosts.lock();
        let state = hosts
            .entry(endpoint.host.clone())
            .or_insert_with(|| HostState::from_script(HostScript::default()));
        if state.refuse_connect {
            return Err(CoreError::connect(endpoint, "scripted connect refusal"));
        }

        let connection = MockConnection {
            caps: state.caps,
            fetches: state.fetches.clone(),
            selects: state.selects.clone(),
            selected: Mutex::new(Vec::new()),
        };
        drop(hosts);

        self.created.lock().push(endpoint.clone());
        Ok(Arc::new(ClusterNode::new(
            endpoint,
            bucket_type,
            adapter,
            Arc::new(connection),
        )))
    }
}

pub enum ResolverScript {
    Empty,
    List(Vec<Endpoint>),
    Fail,
}

pub struct MockResolver {
    script: ResolverScript,
}

impl MockResolver {
    pub fn empty() -> Self {
        Self {
            script: ResolverScript::Empty,
        }
    }

    pub fn with(script: ResolverScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl SrvResolver for MockResolver {
    async fn resolve_srv(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> CoreResult<Vec<Endpoint>> {
        match &self.script {
            ResolverScript::Empty => Ok(Vec::new()),
            ResolverScript::List(endpoints) => Ok(endpoints.clone()),
            ResolverScript::Fail => Err(CoreError::connect(
                Endpoint::new(name, 0, false),
                "scripted srv failure",
            )),
        }
    }
}

/// Bucket factory counting how many attachments were created.
#[derive(Default)]
pub struct CountingBucketFactory {
    count: AtomicUsize,
}

impl CountingBucketFactory {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl BucketFactory for CountingBucketFactory {
    fn create(&self, name: &str, bucket_type: BucketType) -> Arc<BucketAttachment> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Arc::new(BucketAttachment::new(name, bucket_type))
    }
}

/// Bundle with an empty resolver around the given factory.
pub fn services(factory: Arc<MockFactory>) -> Services {
    Services::new(Arc::new(MockResolver::empty()), factory)
}
