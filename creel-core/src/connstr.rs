//! Connection-string parsing: the seed list a core bootstraps from.

use std::net::IpAddr;

use crate::error::{CoreError, CoreResult};
use crate::topology::Endpoint;

/// Default KV port for plain connections.
pub const DEFAULT_KV_PORT: u16 = 11210;
/// Default KV port for TLS connections.
pub const DEFAULT_KV_TLS_PORT: u16 = 11207;

const SCHEME_PLAIN: &str = "couchbase://";
const SCHEME_TLS: &str = "couchbases://";

/// One `host[:port]` entry from the connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// Hostname or IP literal.
    pub host: String,
    /// Explicit port, if one was written.
    pub port: Option<u16>,
}

/// Parsed connection string.
///
/// Yields either a list of literal bootstrap endpoints or a DNS-SRV
/// candidate name; the scheme decides the TLS default.
#[derive(Debug, Clone)]
pub struct ConnectionString {
    input: String,
    hosts: Vec<HostEntry>,
    scheme_tls: bool,
}

impl ConnectionString {
    /// Parses `input`, accepting `couchbase://` and `couchbases://` schemes
    /// (a bare host list defaults to the plain scheme).
    pub fn parse(input: &str) -> CoreResult<Self> {
        let invalid = || CoreError::InvalidConnectionString {
            input: input.to_string(),
        };

        let (scheme_tls, rest) = if let Some(rest) = input.strip_prefix(SCHEME_TLS) {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix(SCHEME_PLAIN) {
            (false, rest)
        } else if input.contains("://") {
            return Err(invalid());
        } else {
            (false, input)
        };

        // Anything after the authority (a path or query) is not ours to
        // interpret; options parsing belongs to the caller.
        let authority = rest
            .split(['/', '?'])
            .next()
            .unwrap_or_default();

        let mut hosts = Vec::new();
        for entry in authority.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            hosts.push(parse_host_entry(entry).ok_or_else(invalid)?);
        }

        if hosts.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            input: input.to_string(),
            hosts,
            scheme_tls,
        })
    }

    /// Original string as supplied by the caller.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// True when the scheme was `couchbases://`.
    #[must_use]
    pub fn scheme_tls(&self) -> bool {
        self.scheme_tls
    }

    /// Parsed host entries in connection-string order.
    #[must_use]
    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    /// DNS-SRV record name to try before falling back to literal endpoints:
    /// present only for a single port-less hostname that is not an IP
    /// literal.
    #[must_use]
    pub fn srv_record(&self, tls: bool) -> Option<String> {
        let [entry] = self.hosts.as_slice() else {
            return None;
        };
        if entry.port.is_some() || entry.host.parse::<IpAddr>().is_ok() {
            return None;
        }
        let service = if tls { "_couchbases" } else { "_couchbase" };
        Some(format!("{service}._tcp.{}", entry.host))
    }

    /// Literal bootstrap endpoints, defaulting missing ports for the
    /// requested security mode.
    #[must_use]
    pub fn endpoints(&self, tls: bool) -> Vec<Endpoint> {
        let default_port = if tls { DEFAULT_KV_TLS_PORT } else { DEFAULT_KV_PORT };
        self.hosts
            .iter()
            .map(|entry| Endpoint::new(entry.host.clone(), entry.port.unwrap_or(default_port), tls))
            .collect()
    }
}

fn parse_host_entry(entry: &str) -> Option<HostEntry> {
    // `host:port` when the suffix after the last colon is numeric; bare
    // colon-bearing entries (IPv6 literals in brackets are not supported
    // here) are rejected.
    if let Some((host, port)) = entry.rsplit_once(':') {
        if host.is_empty() {
            return None;
        }
        let port: u16 = port.parse().ok()?;
        if host.contains(':') {
            return None;
        }
        return Some(HostEntry {
            host: host.to_string(),
            port: Some(port),
        });
    }
    Some(HostEntry {
        host: entry.to_string(),
        port: None,
    })
}
