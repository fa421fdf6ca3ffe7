//! Cluster options recognized by the coordination core.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::TraceListener;
use crate::topology::NetworkResolution;

/// Options governing core behavior. Unrecognized keys in a deserialized
/// options document are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Seed connection string. Required.
    pub connection_string: String,
    /// Forces TLS even when the scheme is plain `couchbase://`.
    pub enable_tls: bool,
    /// Enables the CCCP polling loop in the config pump.
    pub enable_config_polling: bool,
    /// Cadence of the CCCP polling loop.
    #[serde(with = "humantime_serde")]
    pub config_poll_interval: Duration,
    /// Address-resolution hint for cluster-map hostnames.
    pub network: NetworkResolution,
    /// Threshold (slow-operation) tracing section.
    pub threshold_tracing: TracingSectionOptions,
    /// Orphaned-response tracing section.
    pub orphan_tracing: TracingSectionOptions,
}

impl ClusterOptions {
    /// Options for the given connection string with every default.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Builder-style TLS toggle.
    #[must_use]
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.enable_tls = enabled;
        self
    }

    /// Builder-style polling toggle.
    #[must_use]
    pub fn with_config_polling(mut self, enabled: bool) -> Self {
        self.enable_config_polling = enabled;
        self
    }
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(2_500)
}

/// One tracing section: an enable flag plus an optional listener handed to
/// the request tracer and owned by the core until disposal.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingSectionOptions {
    /// Whether the section is active.
    pub enabled: bool,
    /// Listener to register, if the host application supplies one.
    #[serde(skip)]
    pub listener: Option<Arc<dyn TraceListener>>,
}

impl TracingSectionOptions {
    /// Section with a listener attached.
    pub fn with_listener(listener: Arc<dyn TraceListener>) -> Self {
        Self {
            enabled: true,
            listener: Some(listener),
        }
    }
}

impl Default for TracingSectionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            listener: None,
        }
    }
}

impl fmt::Debug for TracingSectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingSectionOptions")
            .field("enabled", &self.enabled)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            enable_tls: false,
            enable_config_polling: false,
            config_poll_interval: default_poll_interval(),
            network: NetworkResolution::default(),
            threshold_tracing: TracingSectionOptions::default(),
            orphan_tracing: TracingSectionOptions::default(),
        }
    }
}
