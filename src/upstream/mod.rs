// # Upstreams
//
// An upstream is a named set of candidate backends plus the policy
// for picking among them. The PROXY variant pairs every activated
// agent channel 1:1 with a freshly dialed dst channel and owns the
// registry of live pairs; the ROUTE variant (pooled, hash-partitioned
// backends shared by many agent channels) is reserved.

use crate::balance::BalancerRegistry;
use crate::channel::{Attachments, Channel, Packet};
use crate::config::{ChannelConfig, ReadPoolConfig, UpstreamConfig};
use crate::error::Result;
use std::sync::Arc;

pub mod proxy;
pub mod route;

pub use proxy::ProxyUpstream;
pub use route::RouteUpstream;

/// Dependencies an upstream needs beyond its own configuration,
/// supplied by the service at construction time.
#[derive(Clone)]
pub struct UpstreamShared {
    pub balancers: Arc<BalancerRegistry>,
    pub channel: ChannelConfig,
    pub read_pool: ReadPoolConfig,
}

/// The 1:1 binding between an agent channel and a dst channel for the
/// lifetime of one session. Both sides are live at creation; a peer is
/// never reconstructed once removed.
pub struct ChannelPeer {
    agent_channel: Arc<dyn Channel>,
    dst_channel: Arc<dyn Channel>,
    attachments: Attachments,
}

impl ChannelPeer {
    pub fn new(agent_channel: Arc<dyn Channel>, dst_channel: Arc<dyn Channel>) -> Self {
        Self {
            agent_channel,
            dst_channel,
            attachments: Attachments::new(),
        }
    }

    pub fn agent_channel(&self) -> &Arc<dyn Channel> {
        &self.agent_channel
    }

    pub fn dst_channel(&self) -> &Arc<dyn Channel> {
        &self.dst_channel
    }

    /// Per-session metadata store.
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

/// Policy surface for dst-channel creation and cleanup. All lookup
/// and release operations are total: absent entries are answered with
/// `None` or silently skipped, never with an error.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    fn id(&self) -> &str;

    fn conf(&self) -> &UpstreamConfig;

    /// Create the channel pair for a freshly activated agent channel:
    /// pick a backend, dial it, and register the pair. A failure
    /// leaves no trace in the registry and refuses the activation.
    async fn init_channel_peer(
        &self,
        agent_channel: Arc<dyn Channel>,
        params: crate::channel::Params,
    ) -> Result<Arc<dyn Channel>>;

    /// Look up the pair by agent id (`is_agent`) or dst id.
    fn channel_peer(&self, channel_id: &str, is_agent: bool) -> Option<Arc<ChannelPeer>>;

    /// The dst channel paired with this agent channel, if any.
    fn query_dst_channel(&self, agent_channel_id: &str) -> Option<Arc<dyn Channel>>;

    /// The agent channel paired with this dst channel, if any.
    fn query_agent_channel(&self, dst_channel_id: &str) -> Option<Arc<dyn Channel>>;

    /// Relay a packet read from a dst channel to its paired agent
    /// channel; packets for vanished peers are dropped and logged.
    async fn on_dst_read(&self, packet: Packet);

    /// Teardown entered from the agent side going in-active.
    fn release_on_agent_channel(&self, agent_channel: &Arc<dyn Channel>);

    /// Teardown entered from the dst side going in-active.
    fn release_on_dst_channel(&self, dst_channel: &Arc<dyn Channel>);

    /// Drop every pair and stop every tracked channel. Used on
    /// service shutdown; idempotent.
    fn release_channel_peers(&self);

    /// Number of live pairs, for observability and shutdown checks.
    fn peer_count(&self) -> usize;
}
