//! Flat-properties configuration reader.
//!
//! The file format is `key = value` per line, `#` or `!` comments,
//! case-sensitive dotted keys under the `agent.` prefix. Timeout
//! values are seconds. Unknown `agent.*` keys are ignored with a
//! warning; missing required keys abort startup.

use super::{
    AgServerConfig, ChannelConfig, DstClientConfig, ListenPath, LocationConfig, LogConfig,
    ReadPoolConfig, ServiceConfig, UpstreamConfig, UpstreamKind, DEFAULT_DST_PORT,
    DEFAULT_SERVER_PORT,
};
use crate::balance::LoadBalanceKind;
use crate::channel::Network;
use crate::error::{AgentError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Load a properties file into a raw key/value map. Later duplicate
/// keys win.
pub fn load_properties(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}

/// Everything the binary needs: the service configuration plus the
/// logging settings it installs before the service starts.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service: ServiceConfig,
    pub log: LogConfig,
}

impl AgentConfig {
    /// Build the typed configuration from a raw properties map.
    pub fn from_properties(props: HashMap<String, String>) -> Result<AgentConfig> {
        let mut bag = PropertyBag::new(props);

        let log = LogConfig {
            dir: bag.take("agent.log.dir"),
            file: bag.take("agent.log.file"),
            level: bag.take("agent.log.level"),
        };

        let read_pool = parse_read_pool(&mut bag)?;
        let channel = parse_channel(&mut bag)?;

        let server_id = bag
            .take("agent.server.id")
            .unwrap_or_else(|| format!("agent-{}", rand::random::<u32>()));

        let ag_server = parse_server(&mut bag, &server_id)?;
        let upstreams = parse_upstreams(&mut bag)?;

        bag.warn_leftovers();

        let mut service = ServiceConfig::new(server_id, ag_server);
        service.channel = channel;
        service.read_pool = read_pool;
        for ups in upstreams {
            service.upstreams.insert(ups.id.clone(), ups);
        }
        service.validate()?;
        Ok(AgentConfig { service, log })
    }
}

/// Raw map wrapper tracking which keys were consumed, so everything
/// left over can be reported.
struct PropertyBag {
    map: HashMap<String, String>,
}

impl PropertyBag {
    fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    fn take(&mut self, key: &str) -> Option<String> {
        self.map.remove(key).filter(|v| !v.is_empty())
    }

    fn take_parsed<T: std::str::FromStr>(&mut self, key: &str) -> Result<Option<T>> {
        match self.take(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| AgentError::Config(format!("invalid value for {}: {}", key, raw))),
        }
    }

    fn warn_leftovers(&self) {
        for key in self.map.keys() {
            if key.starts_with("agent.") {
                warn!(key = %key, "ignoring unknown config key");
            }
        }
    }
}

fn parse_read_pool(bag: &mut PropertyBag) -> Result<ReadPoolConfig> {
    let mut conf = ReadPoolConfig::default();
    if let Some(size) = bag.take_parsed::<usize>("agent.readpool.maxCpuSize")? {
        conf.max_cpu_size = size;
    }
    if let Some(size) = bag.take_parsed::<usize>("agent.readqueue.maxSize")? {
        conf.queue_size = size;
    }
    Ok(conf)
}

fn parse_channel(bag: &mut PropertyBag) -> Result<ChannelConfig> {
    let mut conf = ChannelConfig::default();
    if let Some(secs) = bag.take_parsed::<u64>("agent.channel.readTimeout")? {
        conf.read_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = bag.take_parsed::<u64>("agent.channel.writeTimeout")? {
        conf.write_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(size) = bag.take_parsed::<usize>("agent.channel.readBufSize")? {
        conf.read_buf_size = size;
    }
    if let Some(size) = bag.take_parsed::<usize>("agent.channel.writeBufSize")? {
        conf.write_buf_size = size;
    }
    if let Some(limit) = bag.take_parsed::<u32>("agent.channel.closeRevFailTime")? {
        conf.close_recv_fail_limit = limit;
    }
    Ok(conf)
}

fn parse_server(bag: &mut PropertyBag, server_id: &str) -> Result<AgServerConfig> {
    let network = match bag.take("agent.server.network") {
        Some(raw) => Network::parse(&raw)
            .ok_or_else(|| AgentError::Config(format!("unknown server network: {}", raw)))?,
        None => Network::Ws,
    };
    let port = bag
        .take_parsed::<u16>("agent.server.port")?
        .unwrap_or(DEFAULT_SERVER_PORT);

    let mut conf = AgServerConfig::new(server_id, port, network);
    if let Some(ip) = bag.take("agent.server.ip") {
        conf.ip = ip;
    }
    conf.scheme = bag.take("agent.server.scheme");
    if let Some(max) = bag.take_parsed::<usize>("agent.server.maxChannelSize")? {
        conf.max_channel_size = max;
    }

    // agent.server.ws.<i>.{path,subprotocol}
    let mut index = 0usize;
    while let Some(path) = bag.take(&format!("agent.server.ws.{}.path", index)) {
        let subprotocol = bag.take(&format!("agent.server.ws.{}.subprotocol", index));
        conf.listen_paths.push(ListenPath {
            network: Network::Ws,
            path,
            subprotocol,
        });
        index += 1;
    }

    // agent.server.location.<i>.{pattern,upstreamId}
    let mut index = 0usize;
    loop {
        let pattern = bag.take(&format!("agent.server.location.{}.pattern", index));
        let upstream_id = bag.take(&format!("agent.server.location.{}.upstreamId", index));
        match (pattern, upstream_id) {
            (Some(pattern), Some(upstream_id)) => {
                let pattern = normalize_pattern(pattern);
                conf.locations
                    .insert(pattern.clone(), LocationConfig::new(pattern, upstream_id));
                index += 1;
            }
            _ => break,
        }
    }

    Ok(conf)
}

/// The documented wildcard spelling is the empty pattern; accept a
/// bare `*` as the same thing since property values cannot be empty.
fn normalize_pattern(pattern: String) -> String {
    if pattern == "*" {
        String::new()
    } else {
        pattern
    }
}

fn parse_upstreams(bag: &mut PropertyBag) -> Result<Vec<UpstreamConfig>> {
    let raw_ids = bag
        .take("agent.upstream.id")
        .ok_or_else(|| AgentError::Config("agent.upstream.id is required".into()))?;
    let ids: Vec<String> = raw_ids
        .split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(AgentError::Config("agent.upstream.id is empty".into()));
    }

    let mut upstreams = Vec::with_capacity(ids.len());
    for id in ids {
        let kind = match bag.take(&format!("agent.upstream.{}.type", id)) {
            Some(raw) => UpstreamKind::parse(&raw)
                .ok_or_else(|| AgentError::Config(format!("unknown upstream type: {}", raw)))?,
            None => UpstreamKind::Proxy,
        };
        let load_balance = match bag.take(&format!("agent.upstream.{}.loadBalance", id)) {
            Some(raw) => LoadBalanceKind::parse(&raw)
                .ok_or_else(|| AgentError::Config("unknown load balance type".into()))?,
            None => LoadBalanceKind::Default,
        };

        let mut dst_clients = Vec::new();
        let mut index = 0usize;
        while let Some(ip) = bag.take(&format!("agent.upstream.{}.dstclient.{}.ip", id, index)) {
            let prefix = format!("agent.upstream.{}.dstclient.{}", id, index);
            let port = bag
                .take_parsed::<u16>(&format!("{}.port", prefix))?
                .unwrap_or(DEFAULT_DST_PORT);
            let network = match bag.take(&format!("{}.network", prefix)) {
                Some(raw) => Network::parse(&raw).ok_or_else(|| {
                    AgentError::Config(format!("unknown dstclient network: {}", raw))
                })?,
                None => Network::Ws,
            };
            let mut dst = DstClientConfig::new(ip, port, network);
            dst.scheme = bag.take(&format!("{}.scheme", prefix));
            if let Some(path) = bag.take(&format!("{}.path", prefix)) {
                dst.path = path;
            }
            dst.subprotocol = bag.take(&format!("{}.subprotocol", prefix));
            dst_clients.push(dst);
            index += 1;
        }

        if kind == UpstreamKind::Proxy && dst_clients.is_empty() {
            return Err(AgentError::Config(format!(
                "upstream {} has no dstclient configured",
                id
            )));
        }

        upstreams.push(UpstreamConfig {
            id,
            kind,
            load_balance,
            dst_clients,
        });
    }
    Ok(upstreams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(text: &str) -> Result<AgentConfig> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let props = load_properties(file.path()).unwrap();
        AgentConfig::from_properties(props)
    }

    const SAMPLE: &str = r#"
# agent listener
agent.server.id = ag-test
agent.server.port = 9080
agent.server.network = ws
agent.server.ws.0.path = /chat
agent.server.ws.0.subprotocol = chat-v1
agent.server.location.0.pattern = /chat
agent.server.location.0.upstreamId = u1

agent.channel.readTimeout = 30
agent.readqueue.maxSize = 64

agent.upstream.id = u1;u2
agent.upstream.u1.loadBalance = default
agent.upstream.u1.dstclient.0.ip = 127.0.0.1
agent.upstream.u1.dstclient.0.port = 9101
agent.upstream.u1.dstclient.0.network = ws
agent.upstream.u1.dstclient.0.path = /echo
agent.upstream.u2.dstclient.0.ip = 127.0.0.1
agent.upstream.u2.dstclient.0.port = 9102
"#;

    #[test]
    fn test_parse_sample() {
        let conf = parse(SAMPLE).unwrap();
        assert_eq!(conf.service.id, "ag-test");
        assert_eq!(conf.service.ag_server.port, 9080);
        assert_eq!(conf.service.ag_server.listen_paths.len(), 1);
        assert_eq!(
            conf.service.ag_server.listen_paths[0].subprotocol.as_deref(),
            Some("chat-v1")
        );
        assert_eq!(conf.service.upstreams.len(), 2);
        let u1 = &conf.service.upstreams["u1"];
        assert_eq!(u1.dst_clients[0].port, 9101);
        assert_eq!(u1.dst_clients[0].path, "/echo");
        // u2 falls back to defaults where keys are absent.
        let u2 = &conf.service.upstreams["u2"];
        assert_eq!(u2.dst_clients[0].network, Network::Ws);
        assert_eq!(
            conf.service.channel.read_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(conf.service.read_pool.queue_size, 64);
        assert_eq!(
            conf.service.ag_server.locations["/chat"].upstream_id,
            "u1"
        );
    }

    #[test]
    fn test_missing_upstream_id_aborts() {
        let err = parse("agent.server.port = 9080\n").unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_missing_dstclient_aborts() {
        let err = parse("agent.upstream.id = u1\n").unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_unknown_load_balance_aborts() {
        let text = "agent.upstream.id = u1\n\
                    agent.upstream.u1.loadBalance = fancy\n\
                    agent.upstream.u1.dstclient.0.ip = 127.0.0.1\n";
        let err = parse(text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: unknown load balance type"
        );
    }

    #[test]
    fn test_single_upstream_id_without_separator() {
        let text = "agent.upstream.id = solo\n\
                    agent.upstream.solo.dstclient.0.ip = 10.0.0.1\n";
        let conf = parse(text).unwrap();
        assert!(conf.service.upstreams.contains_key("solo"));
        assert_eq!(
            conf.service.upstreams["solo"].dst_clients[0].port,
            DEFAULT_DST_PORT
        );
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"# comment\n! also comment\n\nagent.server.port = 9090\n")
            .unwrap();
        let props = load_properties(file.path()).unwrap();
        assert_eq!(props.get("agent.server.port").map(String::as_str), Some("9090"));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_wildcard_pattern_normalized() {
        let text = "agent.server.location.0.pattern = *\n\
                    agent.server.location.0.upstreamId = u1\n\
                    agent.upstream.id = u1\n\
                    agent.upstream.u1.dstclient.0.ip = 127.0.0.1\n";
        let conf = parse(text).unwrap();
        assert!(conf.service.ag_server.locations.contains_key(""));
    }
}
