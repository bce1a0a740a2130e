//! PROXY upstream: one dialed dst channel per activated agent
//! channel, with the three-way registry tying the pair together.
//!
//! Registry invariants: every `agent_to_dst` entry has a matching
//! `channel_peers` entry keyed by the dst id, and every channel in
//! `dst_channels` is the dst side of exactly one peer. Teardown from
//! either side claims ownership by removing the `channel_peers` entry;
//! whichever side loses the race observes the missing entry and
//! returns.

use super::{ChannelPeer, Upstream, UpstreamShared};
use crate::balance::BalanceContext;
use crate::channel::kws::KwsChannel;
use crate::channel::ws::WsChannel;
use crate::channel::{Channel, ChannelEvents, Network, Packet, Params};
use crate::config::{DstClientConfig, UpstreamConfig};
use crate::error::{AgentError, Result};
use crate::extension::Extension;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub struct ProxyUpstream {
    conf: UpstreamConfig,
    extension: Arc<dyn Extension>,
    shared: UpstreamShared,
    /// Dst pool: dstChannelId -> dst channel.
    dst_channels: DashMap<String, Arc<dyn Channel>>,
    /// dstChannelId -> peer. Removal is the teardown ownership claim.
    channel_peers: DashMap<String, Arc<ChannelPeer>>,
    /// agentChannelId -> dstChannelId.
    agent_to_dst: DashMap<String, String>,
    self_ref: OnceCell<Weak<ProxyUpstream>>,
}

impl ProxyUpstream {
    pub fn new(
        conf: UpstreamConfig,
        extension: Arc<dyn Extension>,
        shared: UpstreamShared,
    ) -> Arc<Self> {
        let upstream = Arc::new(Self {
            conf,
            extension,
            shared,
            dst_channels: DashMap::new(),
            channel_peers: DashMap::new(),
            agent_to_dst: DashMap::new(),
            self_ref: OnceCell::new(),
        });
        let _ = upstream.self_ref.set(Arc::downgrade(&upstream));
        upstream
    }

    fn dst_events(&self) -> Arc<dyn ChannelEvents> {
        let upstream = self.self_ref.get().cloned().unwrap_or_default();
        Arc::new(DstEvents { upstream })
    }

    async fn dial_dst(
        &self,
        dst_conf: &DstClientConfig,
        params: &Params,
    ) -> Result<Arc<dyn Channel>> {
        let events = self.dst_events();
        let queue_size = self.shared.read_pool.queue_size;
        match dst_conf.network {
            Network::Ws => {
                WsChannel::connect(dst_conf, params, events, &self.shared.channel, queue_size).await
            }
            Network::Kws => {
                KwsChannel::connect(dst_conf, events, &self.shared.channel, queue_size).await
            }
            other => Err(AgentError::Dial(format!(
                "unsupported dst network: {}",
                other
            ))),
        }
    }
}

#[async_trait::async_trait]
impl Upstream for ProxyUpstream {
    fn id(&self) -> &str {
        &self.conf.id
    }

    fn conf(&self) -> &UpstreamConfig {
        &self.conf
    }

    async fn init_channel_peer(
        &self,
        agent_channel: Arc<dyn Channel>,
        params: Params,
    ) -> Result<Arc<dyn Channel>> {
        let ctx = BalanceContext {
            upstream_id: &self.conf.id,
            agent_channel: &agent_channel,
            backends: &self.conf.dst_clients,
        };
        let dst_conf = self.shared.balancers.pick(self.conf.load_balance, &ctx)?;
        debug!(
            upstream = %self.conf.id,
            dst = %dst_conf.addr(),
            "backend selected"
        );

        let dst_channel = match self.dial_dst(&dst_conf, &params).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    upstream = %self.conf.id,
                    agent_ch = %agent_channel.id(),
                    dst = %dst_conf.addr(),
                    error = %err,
                    "dst dial failed"
                );
                return Err(err);
            }
        };

        let agent_id = agent_channel.id().to_string();
        let dst_id = dst_channel.id().to_string();
        self.agent_to_dst.insert(agent_id.clone(), dst_id.clone());
        self.channel_peers.insert(
            dst_id.clone(),
            Arc::new(ChannelPeer::new(agent_channel, dst_channel.clone())),
        );
        self.dst_channels.insert(dst_id.clone(), dst_channel.clone());

        // Reads may flow only after the pair is resolvable.
        dst_channel.start();
        info!(
            upstream = %self.conf.id,
            agent_ch = %agent_id,
            dst_ch = %dst_id,
            "channel peer established"
        );
        Ok(dst_channel)
    }

    fn channel_peer(&self, channel_id: &str, is_agent: bool) -> Option<Arc<ChannelPeer>> {
        let dst_id = if is_agent {
            self.agent_to_dst.get(channel_id)?.value().clone()
        } else {
            channel_id.to_string()
        };
        self.channel_peers.get(&dst_id).map(|e| e.value().clone())
    }

    fn query_dst_channel(&self, agent_channel_id: &str) -> Option<Arc<dyn Channel>> {
        self.channel_peer(agent_channel_id, true)
            .map(|peer| peer.dst_channel().clone())
    }

    fn query_agent_channel(&self, dst_channel_id: &str) -> Option<Arc<dyn Channel>> {
        self.channel_peer(dst_channel_id, false)
            .map(|peer| peer.agent_channel().clone())
    }

    async fn on_dst_read(&self, packet: Packet) {
        let dst_id = packet.channel().id().to_string();
        let Some(agent_channel) = self.query_agent_channel(&dst_id) else {
            warn!(dst_ch = %dst_id, "dropping packet for vanished peer");
            return;
        };
        if let Err(err) = self.extension.transfer(&packet, &agent_channel).await {
            warn!(dst_ch = %dst_id, error = %err, "dst-to-agent transfer failed");
        }
    }

    fn release_on_agent_channel(&self, agent_channel: &Arc<dyn Channel>) {
        let agent_id = agent_channel.id();
        let Some(dst_id) = self.agent_to_dst.get(agent_id).map(|e| e.value().clone()) else {
            debug!(agent_ch = %agent_id, "no pair to release");
            return;
        };
        match self.channel_peers.remove(&dst_id) {
            Some((_, peer)) => {
                self.agent_to_dst.remove(agent_id);
                self.dst_channels.remove(&dst_id);
                peer.dst_channel().stop();
                info!(
                    upstream = %self.conf.id,
                    agent_ch = %agent_id,
                    dst_ch = %dst_id,
                    "channel peer released on agent close"
                );
            }
            None => debug!(dst_ch = %dst_id, "teardown already owned by dst side"),
        }
    }

    fn release_on_dst_channel(&self, dst_channel: &Arc<dyn Channel>) {
        let dst_id = dst_channel.id();
        match self.channel_peers.remove(dst_id) {
            Some((dst_id, peer)) => {
                self.agent_to_dst.remove(peer.agent_channel().id());
                self.dst_channels.remove(&dst_id);
                peer.agent_channel().stop();
                info!(
                    upstream = %self.conf.id,
                    agent_ch = %peer.agent_channel().id(),
                    dst_ch = %dst_id,
                    "channel peer released on dst close"
                );
            }
            None => debug!(dst_ch = %dst_id, "teardown already owned by agent side"),
        }
    }

    fn release_channel_peers(&self) {
        let dst_ids: Vec<String> = self.channel_peers.iter().map(|e| e.key().clone()).collect();
        for dst_id in dst_ids {
            if let Some((_, peer)) = self.channel_peers.remove(&dst_id) {
                self.agent_to_dst.remove(peer.agent_channel().id());
                peer.agent_channel().stop();
                peer.dst_channel().stop();
            }
            self.dst_channels.remove(&dst_id);
        }
        // Anything still in the pool has no peer; stop it regardless.
        let leftovers: Vec<Arc<dyn Channel>> =
            self.dst_channels.iter().map(|e| e.value().clone()).collect();
        for channel in leftovers {
            channel.stop();
        }
        self.dst_channels.clear();
        self.agent_to_dst.clear();
        info!(upstream = %self.conf.id, "all channel peers released");
    }

    fn peer_count(&self) -> usize {
        self.channel_peers.len()
    }
}

/// Callback adapter wired into every dialed dst channel.
struct DstEvents {
    upstream: Weak<ProxyUpstream>,
}

#[async_trait::async_trait]
impl ChannelEvents for DstEvents {
    async fn on_read(&self, packet: Packet) {
        if let Some(upstream) = self.upstream.upgrade() {
            upstream.on_dst_read(packet).await;
        }
    }

    async fn on_inactive(&self, channel: Arc<dyn Channel>) {
        if let Some(upstream) = self.upstream.upgrade() {
            debug!(dst_ch = %channel.id(), "dst channel in-active");
            upstream.release_on_dst_channel(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalancerRegistry;
    use crate::channel::testing::MemoryChannel;
    use crate::config::{ChannelConfig, ReadPoolConfig};
    use crate::extension::DefaultExtension;

    fn test_upstream() -> Arc<ProxyUpstream> {
        let conf = UpstreamConfig::proxy(
            "u1",
            vec![DstClientConfig::new("127.0.0.1", 9101, Network::Ws)],
        );
        let shared = UpstreamShared {
            balancers: Arc::new(BalancerRegistry::with_defaults()),
            channel: ChannelConfig::default(),
            read_pool: ReadPoolConfig::default(),
        };
        ProxyUpstream::new(conf, Arc::new(DefaultExtension::new()), shared)
    }

    fn register_pair(
        upstream: &ProxyUpstream,
    ) -> (Arc<dyn Channel>, Arc<dyn Channel>) {
        let agent: Arc<dyn Channel> = MemoryChannel::new(Network::Ws);
        let dst: Arc<dyn Channel> = MemoryChannel::new(Network::Ws);
        upstream
            .agent_to_dst
            .insert(agent.id().to_string(), dst.id().to_string());
        upstream.channel_peers.insert(
            dst.id().to_string(),
            Arc::new(ChannelPeer::new(agent.clone(), dst.clone())),
        );
        upstream
            .dst_channels
            .insert(dst.id().to_string(), dst.clone());
        (agent, dst)
    }

    #[test]
    fn test_pair_integrity() {
        let upstream = test_upstream();
        let (agent, dst) = register_pair(&upstream);

        let peer = upstream.channel_peer(agent.id(), true).unwrap();
        assert_eq!(peer.agent_channel().id(), agent.id());
        assert_eq!(peer.dst_channel().id(), dst.id());
        assert_eq!(
            upstream.query_dst_channel(agent.id()).unwrap().id(),
            dst.id()
        );
        assert_eq!(
            upstream.query_agent_channel(dst.id()).unwrap().id(),
            agent.id()
        );
        assert_eq!(upstream.peer_count(), 1);
    }

    #[test]
    fn test_release_on_agent_side() {
        let upstream = test_upstream();
        let (agent, dst) = register_pair(&upstream);

        upstream.release_on_agent_channel(&agent);
        assert!(dst.is_closed());
        assert_eq!(upstream.peer_count(), 0);
        assert!(upstream.agent_to_dst.is_empty());
        assert!(upstream.dst_channels.is_empty());
        // Second release is a no-op.
        upstream.release_on_agent_channel(&agent);
    }

    #[test]
    fn test_release_on_dst_side() {
        let upstream = test_upstream();
        let (agent, dst) = register_pair(&upstream);

        upstream.release_on_dst_channel(&dst);
        assert!(agent.is_closed());
        assert_eq!(upstream.peer_count(), 0);
        assert!(upstream.agent_to_dst.is_empty());
        assert!(upstream.dst_channels.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_release_has_single_owner() {
        for _ in 0..50 {
            let upstream = test_upstream();
            let (agent, dst) = register_pair(&upstream);

            let ups_a = upstream.clone();
            let agent_side = {
                let agent = agent.clone();
                tokio::spawn(async move { ups_a.release_on_agent_channel(&agent) })
            };
            let ups_b = upstream.clone();
            let dst_side = {
                let dst = dst.clone();
                tokio::spawn(async move { ups_b.release_on_dst_channel(&dst) })
            };
            agent_side.await.unwrap();
            dst_side.await.unwrap();

            assert_eq!(upstream.peer_count(), 0);
            assert!(upstream.agent_to_dst.is_empty());
            assert!(upstream.dst_channels.is_empty());
            assert!(agent.is_closed() || dst.is_closed());
        }
    }

    #[test]
    fn test_release_channel_peers_stops_everything() {
        let upstream = test_upstream();
        let mut channels = Vec::new();
        for _ in 0..10 {
            channels.push(register_pair(&upstream));
        }

        upstream.release_channel_peers();
        assert_eq!(upstream.peer_count(), 0);
        assert!(upstream.agent_to_dst.is_empty());
        assert!(upstream.dst_channels.is_empty());
        for (agent, dst) in channels {
            assert!(agent.is_closed());
            assert!(dst.is_closed());
        }
        // Idempotent.
        upstream.release_channel_peers();
    }

    #[test]
    fn test_lookup_misses_are_none() {
        let upstream = test_upstream();
        assert!(upstream.channel_peer("nope", true).is_none());
        assert!(upstream.channel_peer("nope", false).is_none());
        assert!(upstream.query_dst_channel("nope").is_none());
        assert!(upstream.query_agent_channel("nope").is_none());
    }
}
