// # Extension
//
// The extension is the only component aware of per-protocol payload
// shape. It translates packets between the two sides of a channel
// pair, extracts the location pattern and per-connection parameters
// from a freshly accepted agent channel, manufactures upstreams, and
// exposes the lifecycle hooks embedders override.
//
// The default implementation covers the bundled WS and KWS adapters;
// every other protocol pair degrades to a plain byte copy.

use crate::channel::{
    Channel, Network, Packet, PacketTag, Params, WsMsgType, KEY_ACTIVATING, KEY_OPCODE,
    KEY_PARAMS, KEY_PATH, OPCODE_TEXT_SESSION, OPCODE_TEXT_SIGNALLING,
};
use crate::config::{UpstreamConfig, UpstreamKind};
use crate::error::Result;
use crate::server::AgServer;
use crate::upstream::{ProxyUpstream, RouteUpstream, Upstream, UpstreamShared};
use std::sync::Arc;
use tracing::debug;

/// User-supplied packet interceptor. Handlers run in registration
/// order on every agent-channel read; a handler may `release()` the
/// packet to consume it, which stops the relay.
#[async_trait::async_trait]
pub trait MsgHandler: Send + Sync {
    async fn handle(&self, packet: &Packet);
}

/// Pluggable protocol/policy surface of the proxy.
#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    /// Construct a packet on `to_channel` carrying `packet`'s payload,
    /// translating headers according to the protocol pair, and write
    /// it out.
    async fn transfer(&self, packet: &Packet, to_channel: &Arc<dyn Channel>) -> Result<()>;

    /// Extract the location pattern and per-connection parameters from
    /// an agent channel. Unknown networks yield `("", {})`.
    fn location_pattern(&self, channel: &Arc<dyn Channel>) -> (String, Params);

    /// Factory for upstream variants.
    fn create_upstream(
        &self,
        extension: Arc<dyn Extension>,
        conf: UpstreamConfig,
        shared: UpstreamShared,
    ) -> Result<Arc<dyn Upstream>>;

    /// Runs before an agent channel is activated; an error aborts the
    /// activation.
    async fn before_agent_active(&self, channel: &Arc<dyn Channel>) -> Result<()> {
        let _ = channel;
        Ok(())
    }

    /// Runs after an agent channel was activated successfully.
    async fn after_agent_active(&self, channel: &Arc<dyn Channel>) {
        let _ = channel;
    }

    /// Runs before the listener binds; an error aborts the listen.
    async fn before_server_listen(&self, server: &AgServer) -> Result<()> {
        let _ = server;
        Ok(())
    }

    /// Runs after the listener bound successfully.
    async fn after_server_listen(&self, server: &AgServer) {
        let _ = server;
    }

    /// Ordered packet interceptors for agent-channel reads.
    fn agent_msg_handlers(&self) -> &[Arc<dyn MsgHandler>];
}

/// Stock extension: WS/KWS translation, path-based location
/// extraction, and the PROXY/ROUTE factory.
pub struct DefaultExtension {
    msg_handlers: Vec<Arc<dyn MsgHandler>>,
}

impl DefaultExtension {
    pub fn new() -> Self {
        Self {
            msg_handlers: Vec::new(),
        }
    }

    /// Extension with user packet interceptors, run in the given
    /// order.
    pub fn with_msg_handlers(msg_handlers: Vec<Arc<dyn MsgHandler>>) -> Self {
        Self { msg_handlers }
    }
}

impl Default for DefaultExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Extension for DefaultExtension {
    async fn transfer(&self, packet: &Packet, to_channel: &Arc<dyn Channel>) -> Result<()> {
        let from_channel = packet.channel();
        let payload = packet.payload().clone();

        let out = match (from_channel.network(), to_channel.network()) {
            // Same-protocol WS keeps the message kind.
            (Network::Ws, Network::Ws) => {
                Packet::new(to_channel.clone(), payload, packet.tag().clone())
            }
            // KWS frames pass through verbatim between KWS peers.
            (Network::Kws, Network::Kws) => {
                let opcode = packet.opcode().unwrap_or(OPCODE_TEXT_SIGNALLING);
                Packet::new(to_channel.clone(), payload, PacketTag::Kws { opcode })
            }
            // Strip the frame toward WS; the inbound opcode is kept on
            // the KWS side for reply mirroring.
            (Network::Kws, Network::Ws) => {
                if let Some(opcode) = packet.opcode() {
                    from_channel.attachments().put(KEY_OPCODE, opcode);
                }
                Packet::new(to_channel.clone(), payload, PacketTag::Ws(WsMsgType::Text))
            }
            // Wrap toward KWS. A reply mirrors the last opcode seen
            // from that channel; otherwise the first frame after
            // activation opens the session.
            (Network::Ws, Network::Kws) => {
                let opcode = match to_channel.attachments().get::<u16>(KEY_OPCODE) {
                    Some(opcode) => *opcode,
                    None if from_channel.attachments().contains(KEY_ACTIVATING) => {
                        OPCODE_TEXT_SESSION
                    }
                    None => OPCODE_TEXT_SIGNALLING,
                };
                from_channel.attachments().put(KEY_OPCODE, opcode);
                Packet::new(to_channel.clone(), payload, PacketTag::Kws { opcode })
            }
            (from, to) => {
                debug!(from = %from, to = %to, "transfer as raw bytes");
                Packet::new(to_channel.clone(), payload, PacketTag::Raw)
            }
        };

        from_channel.attachments().remove(KEY_ACTIVATING);
        to_channel.write(out).await
    }

    fn location_pattern(&self, channel: &Arc<dyn Channel>) -> (String, Params) {
        match channel.network() {
            Network::Ws => {
                let path = channel
                    .attachments()
                    .get::<String>(KEY_PATH)
                    .map(|p| (*p).clone())
                    .unwrap_or_default();
                let params = channel
                    .attachments()
                    .get::<Params>(KEY_PARAMS)
                    .map(|p| (*p).clone())
                    .unwrap_or_default();
                (path, params)
            }
            Network::Kws => {
                // Registration params were decoded by the listener;
                // the path rides inside them.
                let params = channel
                    .attachments()
                    .get::<Params>(KEY_PARAMS)
                    .map(|p| (*p).clone())
                    .unwrap_or_default();
                let path = params
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (path, params)
            }
            _ => (String::new(), Params::new()),
        }
    }

    fn create_upstream(
        &self,
        extension: Arc<dyn Extension>,
        conf: UpstreamConfig,
        shared: UpstreamShared,
    ) -> Result<Arc<dyn Upstream>> {
        match conf.kind {
            UpstreamKind::Proxy => Ok(ProxyUpstream::new(conf, extension, shared)),
            UpstreamKind::Route => Ok(RouteUpstream::new(conf)),
        }
    }

    fn agent_msg_handlers(&self) -> &[Arc<dyn MsgHandler>] {
        &self.msg_handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use bytes::Bytes;
    use serde_json::json;

    fn ext() -> DefaultExtension {
        DefaultExtension::new()
    }

    #[tokio::test]
    async fn test_ws_to_ws_preserves_msg_type() {
        let from = MemoryChannel::new(Network::Ws);
        let to = MemoryChannel::new(Network::Ws);
        let to_dyn: Arc<dyn Channel> = to.clone();

        let packet = Packet::new(
            from.clone(),
            Bytes::from_static(b"hello"),
            PacketTag::Ws(WsMsgType::Binary),
        );
        ext().transfer(&packet, &to_dyn).await.unwrap();

        let written = to.take_written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].payload().as_ref(), b"hello");
        assert_eq!(*written[0].tag(), PacketTag::Ws(WsMsgType::Binary));
    }

    #[tokio::test]
    async fn test_kws_to_ws_strips_frame_and_remembers_opcode() {
        let from = MemoryChannel::new(Network::Kws);
        let to = MemoryChannel::new(Network::Ws);
        let to_dyn: Arc<dyn Channel> = to.clone();

        let packet = Packet::new(
            from.clone(),
            Bytes::from_static(b"ping"),
            PacketTag::Kws {
                opcode: OPCODE_TEXT_SIGNALLING,
            },
        );
        ext().transfer(&packet, &to_dyn).await.unwrap();

        let written = to.take_written();
        assert_eq!(*written[0].tag(), PacketTag::Ws(WsMsgType::Text));
        assert_eq!(written[0].payload().as_ref(), b"ping");
        assert_eq!(
            *from.attachments().get::<u16>(KEY_OPCODE).unwrap(),
            OPCODE_TEXT_SIGNALLING
        );
    }

    #[tokio::test]
    async fn test_ws_to_kws_mirrors_reply_opcode() {
        let from = MemoryChannel::new(Network::Ws);
        let to = MemoryChannel::new(Network::Kws);
        let to_dyn: Arc<dyn Channel> = to.clone();
        // The KWS side has already spoken; its last opcode is mirrored.
        to.attachments().put(KEY_OPCODE, OPCODE_TEXT_SIGNALLING);

        let packet = Packet::new(
            from.clone(),
            Bytes::from_static(b"pong"),
            PacketTag::Ws(WsMsgType::Text),
        );
        ext().transfer(&packet, &to_dyn).await.unwrap();

        let written = to.take_written();
        assert_eq!(
            *written[0].tag(),
            PacketTag::Kws {
                opcode: OPCODE_TEXT_SIGNALLING
            }
        );
        assert_eq!(written[0].payload().as_ref(), b"pong");
    }

    #[tokio::test]
    async fn test_ws_to_kws_first_frame_opens_session() {
        let from = MemoryChannel::new(Network::Ws);
        let to = MemoryChannel::new(Network::Kws);
        let to_dyn: Arc<dyn Channel> = to.clone();
        from.attachments().put(KEY_ACTIVATING, true);

        let first = Packet::new(
            from.clone(),
            Bytes::from_static(b"{\"path\":\"/chat\"}"),
            PacketTag::Ws(WsMsgType::Text),
        );
        ext().transfer(&first, &to_dyn).await.unwrap();
        // The first-frame marker is cleared by the transfer.
        assert!(!from.attachments().contains(KEY_ACTIVATING));

        let second = Packet::new(
            from.clone(),
            Bytes::from_static(b"ping"),
            PacketTag::Ws(WsMsgType::Text),
        );
        ext().transfer(&second, &to_dyn).await.unwrap();

        let written = to.take_written();
        assert_eq!(
            *written[0].tag(),
            PacketTag::Kws {
                opcode: OPCODE_TEXT_SESSION
            }
        );
        // Subsequent frames are plain signalling.
        assert_eq!(
            *written[1].tag(),
            PacketTag::Kws {
                opcode: OPCODE_TEXT_SIGNALLING
            }
        );
    }

    #[tokio::test]
    async fn test_kws_to_kws_verbatim() {
        let from = MemoryChannel::new(Network::Kws);
        let to = MemoryChannel::new(Network::Kws);
        let to_dyn: Arc<dyn Channel> = to.clone();

        let packet = Packet::new(
            from.clone(),
            Bytes::from_static(b"payload"),
            PacketTag::Kws { opcode: 0x77 },
        );
        ext().transfer(&packet, &to_dyn).await.unwrap();

        let written = to.take_written();
        assert_eq!(*written[0].tag(), PacketTag::Kws { opcode: 0x77 });
        assert_eq!(written[0].payload().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_unlisted_pair_copies_bytes() {
        let from = MemoryChannel::new(Network::Tcp);
        let to = MemoryChannel::new(Network::Ws);
        let to_dyn: Arc<dyn Channel> = to.clone();

        let packet = Packet::new(from.clone(), Bytes::from_static(b"raw"), PacketTag::Raw);
        ext().transfer(&packet, &to_dyn).await.unwrap();

        let written = to.take_written();
        assert_eq!(*written[0].tag(), PacketTag::Raw);
        assert_eq!(written[0].payload().as_ref(), b"raw");
    }

    #[test]
    fn test_location_pattern_ws() {
        let channel = MemoryChannel::new(Network::Ws);
        channel.attachments().put(KEY_PATH, "/chat".to_string());
        let mut params = Params::new();
        params.insert("token".into(), json!("abc"));
        channel.attachments().put(KEY_PARAMS, params);

        let ch: Arc<dyn Channel> = channel;
        let (pattern, params) = ext().location_pattern(&ch);
        assert_eq!(pattern, "/chat");
        assert_eq!(params["token"], json!("abc"));
    }

    #[test]
    fn test_location_pattern_kws_uses_registration_path() {
        let channel = MemoryChannel::new(Network::Kws);
        let mut params = Params::new();
        params.insert("path".into(), json!("/chat"));
        params.insert("room".into(), json!("blue"));
        channel.attachments().put(KEY_PARAMS, params);

        let ch: Arc<dyn Channel> = channel;
        let (pattern, params) = ext().location_pattern(&ch);
        assert_eq!(pattern, "/chat");
        assert_eq!(params["room"], json!("blue"));
    }

    #[test]
    fn test_location_pattern_unknown_network() {
        let ch: Arc<dyn Channel> = MemoryChannel::new(Network::Udp);
        let (pattern, params) = ext().location_pattern(&ch);
        assert_eq!(pattern, "");
        assert!(params.is_empty());
    }
}
