// # Configuration Surface
//
// Typed configuration consumed by the service stack. Construction
// happens either directly (tests, embedding) or through the flat
// properties reader in [`properties`]. All structs are plain data and
// immutable once the service is built.

use crate::balance::LoadBalanceKind;
use crate::channel::{Network, Params};
use crate::error::{AgentError, Result};
use std::collections::HashMap;
use std::time::Duration;

pub mod properties;

pub use properties::{load_properties, AgentConfig};

/// Listen port used when `agent.server.port` is absent.
pub const DEFAULT_SERVER_PORT: u16 = 9080;

/// Dst port used when a dstclient entry omits `port`.
pub const DEFAULT_DST_PORT: u16 = 19980;

// ============================================================================
// Ambient channel / read-pool settings
// ============================================================================

/// Per-channel transport tuning, applied to both agent and dst
/// channels. Zero/absent timeouts disable the respective guard.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
    /// Consecutive receive failures tolerated before the channel is
    /// closed.
    pub close_recv_fail_limit: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            read_buf_size: 8 * 1024,
            write_buf_size: 8 * 1024,
            close_recv_fail_limit: 3,
        }
    }
}

/// Read-dispatch bounds: a per-CPU pool limit for concurrent agent
/// reads and the depth of each channel's queues.
#[derive(Debug, Clone)]
pub struct ReadPoolConfig {
    pub max_cpu_size: usize,
    pub queue_size: usize,
}

impl Default for ReadPoolConfig {
    fn default() -> Self {
        Self {
            max_cpu_size: 4,
            queue_size: 128,
        }
    }
}

impl ReadPoolConfig {
    /// Total concurrent read dispatches allowed.
    pub fn permits(&self) -> usize {
        (num_cpus::get() * self.max_cpu_size).max(1)
    }
}

/// Logging sink settings, consumed by the binary at startup.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub dir: Option<String>,
    pub file: Option<String>,
    pub level: Option<String>,
}

// ============================================================================
// Service / server / routing configuration
// ============================================================================

/// One `{network, path, sub-protocol}` tuple the agent listener
/// accepts. Upgrades outside the declared set are rejected during the
/// handshake.
#[derive(Debug, Clone)]
pub struct ListenPath {
    pub network: Network,
    pub path: String,
    pub subprotocol: Option<String>,
}

/// A `(pattern -> upstreamId)` routing rule. The empty pattern is the
/// wildcard fallback; at most one may be configured.
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub pattern: String,
    pub upstream_id: String,
    pub ext_conf: Params,
}

impl LocationConfig {
    pub fn new(pattern: impl Into<String>, upstream_id: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            upstream_id: upstream_id.into(),
            ext_conf: Params::new(),
        }
    }
}

/// Upstream flavor. `Proxy` pairs each agent channel 1:1 with a
/// freshly dialed dst channel; `Route` (pooled, hash-partitioned) is
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Proxy,
    Route,
}

impl UpstreamKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "proxy" => Some(UpstreamKind::Proxy),
            "route" => Some(UpstreamKind::Route),
            _ => None,
        }
    }
}

/// One dialable backend endpoint.
#[derive(Debug, Clone)]
pub struct DstClientConfig {
    pub ip: String,
    pub port: u16,
    pub network: Network,
    pub scheme: Option<String>,
    pub path: String,
    pub subprotocol: Option<String>,
}

impl DstClientConfig {
    pub fn new(ip: impl Into<String>, port: u16, network: Network) -> Self {
        Self {
            ip: ip.into(),
            port,
            network,
            scheme: None,
            path: String::new(),
            subprotocol: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Dial URL for URL-addressed networks (WS).
    pub fn url(&self) -> String {
        let scheme = self.scheme.as_deref().unwrap_or("ws");
        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, self.ip, self.port, path)
    }
}

/// A named set of candidate backends plus the pick policy.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub id: String,
    pub kind: UpstreamKind,
    pub load_balance: LoadBalanceKind,
    pub dst_clients: Vec<DstClientConfig>,
}

impl UpstreamConfig {
    pub fn proxy(id: impl Into<String>, dst_clients: Vec<DstClientConfig>) -> Self {
        Self {
            id: id.into(),
            kind: UpstreamKind::Proxy,
            load_balance: LoadBalanceKind::Default,
            dst_clients,
        }
    }
}

/// Reserved filter slot; parsed and carried but never executed.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub id: String,
    pub pattern: String,
    pub ext_conf: Params,
}

/// Agent listener configuration: endpoint, accepted paths, and the
/// location routing table.
#[derive(Debug, Clone)]
pub struct AgServerConfig {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub network: Network,
    pub scheme: Option<String>,
    /// Maximum live agent channels; 0 means unlimited.
    pub max_channel_size: usize,
    pub listen_paths: Vec<ListenPath>,
    pub locations: HashMap<String, LocationConfig>,
}

impl AgServerConfig {
    pub fn new(id: impl Into<String>, port: u16, network: Network) -> Self {
        Self {
            id: id.into(),
            ip: String::new(),
            port,
            network,
            scheme: None,
            max_channel_size: 0,
            listen_paths: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn with_listen_path(mut self, path: ListenPath) -> Self {
        self.listen_paths.push(path);
        self
    }

    pub fn with_location(mut self, location: LocationConfig) -> Self {
        self.locations.insert(location.pattern.clone(), location);
        self
    }

    /// Bind address; an empty ip listens on all interfaces.
    pub fn bind_addr(&self) -> String {
        let ip = if self.ip.is_empty() {
            "0.0.0.0"
        } else {
            &self.ip
        };
        format!("{}:{}", ip, self.port)
    }
}

/// Top-level configuration: one listener, one-or-more upstreams, the
/// reserved filter table, and the ambient channel settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub id: String,
    pub ag_server: AgServerConfig,
    pub upstreams: HashMap<String, UpstreamConfig>,
    pub filters: HashMap<String, FilterConfig>,
    pub channel: ChannelConfig,
    pub read_pool: ReadPoolConfig,
}

impl ServiceConfig {
    pub fn new(id: impl Into<String>, ag_server: AgServerConfig) -> Self {
        Self {
            id: id.into(),
            ag_server,
            upstreams: HashMap::new(),
            filters: HashMap::new(),
            channel: ChannelConfig::default(),
            read_pool: ReadPoolConfig::default(),
        }
    }

    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstreams.insert(upstream.id.clone(), upstream);
        self
    }

    /// Startup validation; violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AgentError::Config("service id is empty".into()));
        }
        if self.upstreams.is_empty() {
            return Err(AgentError::Config("no upstream configured".into()));
        }
        for (id, ups) in &self.upstreams {
            if ups.kind == UpstreamKind::Proxy && ups.dst_clients.is_empty() {
                return Err(AgentError::Config(format!(
                    "upstream {} has no dstclient configured",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ServiceConfig {
        let server = AgServerConfig::new("ag-1", 9080, Network::Ws)
            .with_location(LocationConfig::new("/chat", "u1"));
        ServiceConfig::new("svc-1", server).with_upstream(UpstreamConfig::proxy(
            "u1",
            vec![DstClientConfig::new("127.0.0.1", 9101, Network::Ws).with_path("/echo")],
        ))
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_upstreams() {
        let mut conf = sample_config();
        conf.upstreams.clear();
        assert!(matches!(conf.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validate_requires_dst_clients() {
        let mut conf = sample_config();
        conf.upstreams.get_mut("u1").unwrap().dst_clients.clear();
        assert!(matches!(conf.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_dst_client_url() {
        let conf = DstClientConfig::new("127.0.0.1", 9101, Network::Ws).with_path("echo");
        assert_eq!(conf.url(), "ws://127.0.0.1:9101/echo");
        let bare = DstClientConfig::new("10.0.0.1", 80, Network::Ws);
        assert_eq!(bare.url(), "ws://10.0.0.1:80");
    }

    #[test]
    fn test_bind_addr_defaults_all_interfaces() {
        let conf = AgServerConfig::new("ag", 9080, Network::Ws);
        assert_eq!(conf.bind_addr(), "0.0.0.0:9080");
    }
}
