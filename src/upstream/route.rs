//! ROUTE upstream: reserved.
//!
//! The intended design shares a pool of pre-dialed dst channels among
//! many agent channels, partitioned by a route key hash. Until that is
//! specified, the variant fails closed: activation through it is
//! refused and every lookup answers empty.

use super::{ChannelPeer, Upstream};
use crate::channel::{Channel, Packet, Params};
use crate::config::UpstreamConfig;
use crate::error::{AgentError, Result};
use std::sync::Arc;
use tracing::warn;

pub struct RouteUpstream {
    conf: UpstreamConfig,
}

impl RouteUpstream {
    pub fn new(conf: UpstreamConfig) -> Arc<Self> {
        Arc::new(Self { conf })
    }
}

#[async_trait::async_trait]
impl Upstream for RouteUpstream {
    fn id(&self) -> &str {
        &self.conf.id
    }

    fn conf(&self) -> &UpstreamConfig {
        &self.conf
    }

    async fn init_channel_peer(
        &self,
        agent_channel: Arc<dyn Channel>,
        _params: Params,
    ) -> Result<Arc<dyn Channel>> {
        warn!(
            upstream = %self.conf.id,
            agent_ch = %agent_channel.id(),
            "route upstream selected but not available"
        );
        Err(AgentError::Routing(format!(
            "route upstream is reserved, id:{}",
            self.conf.id
        )))
    }

    fn channel_peer(&self, _channel_id: &str, _is_agent: bool) -> Option<Arc<ChannelPeer>> {
        None
    }

    fn query_dst_channel(&self, _agent_channel_id: &str) -> Option<Arc<dyn Channel>> {
        None
    }

    fn query_agent_channel(&self, _dst_channel_id: &str) -> Option<Arc<dyn Channel>> {
        None
    }

    async fn on_dst_read(&self, packet: Packet) {
        warn!(dst_ch = %packet.channel().id(), "route upstream dropping packet");
    }

    fn release_on_agent_channel(&self, _agent_channel: &Arc<dyn Channel>) {}

    fn release_on_dst_channel(&self, _dst_channel: &Arc<dyn Channel>) {}

    fn release_channel_peers(&self) {}

    fn peer_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::channel::Network;
    use crate::config::UpstreamKind;

    #[tokio::test]
    async fn test_route_fails_closed() {
        let conf = UpstreamConfig {
            id: "r1".into(),
            kind: UpstreamKind::Route,
            load_balance: crate::balance::LoadBalanceKind::Default,
            dst_clients: Vec::new(),
        };
        let upstream = RouteUpstream::new(conf);
        let agent: Arc<dyn Channel> = MemoryChannel::new(Network::Ws);
        let err = upstream
            .init_channel_peer(agent, Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Routing(_)));
        assert_eq!(upstream.peer_count(), 0);
    }
}
