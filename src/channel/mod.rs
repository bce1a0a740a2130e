// # Channel Abstraction
//
// A channel is one live connection, either accepted from a client (an
// *agent channel*) or dialed to an upstream backend (a *dst channel*).
// Concrete adapters (WebSocket, KWS-over-UDP) live in submodules and
// share the plumbing here:
//
// - **Capability trait**: id, network tag, attach store, packet
//   construction, ordered write, idempotent stop. No downcasting.
// - **Tagged packets**: raw bytes, WS `(msg_type, bytes)`, or KWS
//   `(opcode, payload)`. All protocol translation dispatches on tags.
// - **Callback surface**: active / read / in-active events delivered
//   to a `ChannelEvents` implementation with panic recovery, so one
//   misbehaving pair cannot crash the process.

use crate::error::{AgentError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};

pub mod frame;
pub mod kws;
pub mod ws;

pub use frame::{Frame, OPCODE_TEXT_SESSION, OPCODE_TEXT_SIGNALLING};

/// Per-connection parameters extracted at activation time: WS query
/// parameters or the KWS registration payload.
pub type Params = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Network tags
// ============================================================================

/// Wire protocol of a channel. Only `Ws` and `Kws` have bundled
/// adapters; the remaining tags are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Ws,
    Http,
    Httpx,
    Kws,
    Kcp,
    Tcp,
    Udp,
}

impl Network {
    /// Parse a network tag from its configuration spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ws" => Some(Network::Ws),
            "http" => Some(Network::Http),
            "httpx" => Some(Network::Httpx),
            "kws" => Some(Network::Kws),
            "kcp" => Some(Network::Kcp),
            "tcp" => Some(Network::Tcp),
            "udp" => Some(Network::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Ws => "ws",
            Network::Http => "http",
            Network::Httpx => "httpx",
            Network::Kws => "kws",
            Network::Kcp => "kcp",
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Attach store
// ============================================================================

/// Well-known attach keys.
pub const KEY_UPSTREAM: &str = "upstream";
pub const KEY_OPCODE: &str = "opcode";
pub const KEY_ACTIVATING: &str = "activating";
pub const KEY_PATH: &str = "path";
pub const KEY_PARAMS: &str = "params";
pub const KEY_SUBPROTOCOL: &str = "subprotocol";

/// Typed key/value store carried by every channel for per-session
/// state (selected upstream, last KWS opcode, activation marker,
/// listener-captured request data).
#[derive(Default)]
pub struct Attachments {
    inner: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.inner.insert(key.to_string(), Arc::new(value));
    }

    /// Typed lookup. Returns `None` when the key is absent or holds a
    /// value of a different type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.inner.remove(key);
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("Attachments").field("keys", &keys).finish()
    }
}

// ============================================================================
// Packets
// ============================================================================

/// WebSocket message kind carried on WS-tagged packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMsgType {
    Text,
    Binary,
}

/// Protocol tag of a packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketTag {
    /// Opaque bytes (TCP/UDP/KCP and friends).
    Raw,
    /// WebSocket message with its kind preserved.
    Ws(WsMsgType),
    /// KWS frame; the payload holds the inner bytes, the opcode rides
    /// on the tag.
    Kws { opcode: u16 },
}

/// One unit of traffic, owned by the channel it was read from (or is
/// about to be written to).
pub struct Packet {
    channel: Arc<dyn Channel>,
    payload: Bytes,
    tag: PacketTag,
    released: AtomicBool,
}

impl Packet {
    pub fn new(channel: Arc<dyn Channel>, payload: Bytes, tag: PacketTag) -> Self {
        Self {
            channel,
            payload,
            tag,
            released: AtomicBool::new(false),
        }
    }

    /// The channel this packet belongs to.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn tag(&self) -> &PacketTag {
        &self.tag
    }

    /// KWS opcode, when this packet is KWS-tagged.
    pub fn opcode(&self) -> Option<u16> {
        match self.tag {
            PacketTag::Kws { opcode } => Some(opcode),
            _ => None,
        }
    }

    /// Mark the packet as consumed by a message handler; a released
    /// packet is not relayed further.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("channel", &self.channel.id())
            .field("len", &self.payload.len())
            .field("tag", &self.tag)
            .finish()
    }
}

// ============================================================================
// Channel trait
// ============================================================================

/// Capability surface of a live connection. Implementations guarantee:
/// reads are delivered in on-wire order, writes complete in issue
/// order, `stop` is idempotent, and the in-active event fires exactly
/// once.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Stable unique id for the lifetime of the connection.
    fn id(&self) -> &str;

    fn network(&self) -> Network;

    fn attachments(&self) -> &Attachments;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Construct a packet owned by this channel with the default tag
    /// for its network.
    fn new_packet(&self, payload: Bytes) -> Packet;

    /// Queue a packet for ordered delivery. Blocks when the send
    /// queue is full; fails once the channel is closed.
    async fn write(&self, packet: Packet) -> Result<()>;

    /// Begin delivering reads. Reads arriving earlier are queued, not
    /// dropped. Idempotent.
    fn start(&self);

    /// Close the channel. Idempotent; triggers the in-active event on
    /// the reader task.
    fn stop(&self);

    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("network", &self.network())
            .finish()
    }
}

/// Lifecycle and data callbacks a channel owner wires in. All three
/// are invoked from channel tasks with panic recovery applied.
#[async_trait::async_trait]
pub trait ChannelEvents: Send + Sync {
    /// Fired once the connection is established (for listener-side
    /// KWS, once the registration frame arrived). An error refuses
    /// the channel; the caller stops it.
    async fn on_active(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let _ = channel;
        Ok(())
    }

    async fn on_read(&self, packet: Packet);

    /// Fired exactly once when the channel goes away, whatever the
    /// cause (remote close, transport error, timeout, local stop).
    async fn on_inactive(&self, channel: Arc<dyn Channel>);
}

// ============================================================================
// Shared channel plumbing
// ============================================================================

/// State shared by the concrete channel adapters: identity, attach
/// store, the ordered write queue, the shutdown signal and the
/// read-gate used to hold back delivery until the owner registered
/// the channel.
pub(crate) struct ChannelCore {
    id: String,
    network: Network,
    attachments: Attachments,
    remote: Option<SocketAddr>,
    closed: AtomicBool,
    inactive_fired: AtomicBool,
    out_tx: mpsc::Sender<Packet>,
    shutdown_tx: watch::Sender<bool>,
    start_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    self_ref: OnceCell<Weak<dyn Channel>>,
}

/// Receiving ends of the core's queues, consumed by the adapter's
/// reader/writer tasks.
pub(crate) struct CorePlumbing {
    pub out_rx: mpsc::Receiver<Packet>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub start_rx: oneshot::Receiver<()>,
}

impl ChannelCore {
    pub fn new(network: Network, remote: Option<SocketAddr>, queue_size: usize) -> (Self, CorePlumbing) {
        let (out_tx, out_rx) = mpsc::channel(queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (start_tx, start_rx) = oneshot::channel();
        let core = Self {
            id: uuid::Uuid::new_v4().to_string(),
            network,
            attachments: Attachments::new(),
            remote,
            closed: AtomicBool::new(false),
            inactive_fired: AtomicBool::new(false),
            out_tx,
            shutdown_tx,
            start_tx: parking_lot::Mutex::new(Some(start_tx)),
            self_ref: OnceCell::new(),
        };
        let plumbing = CorePlumbing {
            out_rx,
            shutdown_rx,
            start_rx,
        };
        (core, plumbing)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Record the owning `Arc` so packets can carry a back-reference.
    /// Called exactly once right after construction.
    pub fn bind(&self, channel: Weak<dyn Channel>) {
        let _ = self.self_ref.set(channel);
    }

    /// The channel as a trait object. Only valid after `bind`.
    pub fn channel_ref(&self) -> Arc<dyn Channel> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("channel back-reference bound at construction")
    }

    pub async fn write(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(AgentError::Transport(format!(
                "write on closed channel {}",
                self.id
            )));
        }
        self.out_tx
            .send(packet)
            .await
            .map_err(|_| AgentError::Transport(format!("write queue closed, chId:{}", self.id)))
    }

    /// Release the read gate; delivery begins.
    pub fn start(&self) {
        if let Some(tx) = self.start_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn stop(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(ch_id = %self.id, network = %self.network, "channel stop");
            let _ = self.shutdown_tx.send(true);
            // An unstarted reader observes the dropped gate and exits.
            self.start_tx.lock().take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claims the right to fire the in-active event; true for exactly
    /// one caller.
    pub fn claim_inactive(&self) -> bool {
        !self.inactive_fired.swap(true, Ordering::AcqRel)
    }
}

// ============================================================================
// Callback dispatch with panic recovery
// ============================================================================

/// Deliver a packet to `on_read`. A panic in the handler chain is
/// logged and tears the channel down.
pub(crate) async fn deliver_read(events: &Arc<dyn ChannelEvents>, packet: Packet) {
    let channel = packet.channel().clone();
    if AssertUnwindSafe(events.on_read(packet))
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::error!(ch_id = %channel.id(), "panic in read handler, stopping channel");
        channel.stop();
    }
}

/// Run `on_active`, folding a panic into an activation error.
pub(crate) async fn deliver_active(
    events: &Arc<dyn ChannelEvents>,
    channel: Arc<dyn Channel>,
) -> Result<()> {
    match AssertUnwindSafe(events.on_active(channel.clone()))
        .catch_unwind()
        .await
    {
        Ok(ret) => ret,
        Err(_) => Err(AgentError::Internal(format!(
            "panic in activation handler, chId:{}",
            channel.id()
        ))),
    }
}

/// Fire `on_inactive` exactly once per channel, panics suppressed.
pub(crate) async fn deliver_inactive(
    core: &ChannelCore,
    events: &Arc<dyn ChannelEvents>,
    channel: Arc<dyn Channel>,
) {
    if !core.claim_inactive() {
        return;
    }
    core.stop();
    let id = channel.id().to_string();
    if AssertUnwindSafe(events.on_inactive(channel))
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::error!(ch_id = %id, "panic in in-active handler");
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory channel recording everything written to it. Unit
    /// tests use it to observe the relay path without sockets.
    pub struct MemoryChannel {
        id: String,
        network: Network,
        attachments: Attachments,
        written: Mutex<Vec<Packet>>,
        closed: AtomicBool,
        self_ref: OnceCell<Weak<dyn Channel>>,
    }

    impl MemoryChannel {
        pub fn new(network: Network) -> Arc<Self> {
            let ch = Arc::new(Self {
                id: uuid::Uuid::new_v4().to_string(),
                network,
                attachments: Attachments::new(),
                written: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                self_ref: OnceCell::new(),
            });
            let weak: Weak<dyn Channel> = Arc::downgrade(&(ch.clone() as Arc<dyn Channel>));
            let _ = ch.self_ref.set(weak);
            ch
        }

        pub fn take_written(&self) -> Vec<Packet> {
            std::mem::take(&mut *self.written.lock())
        }
    }

    #[async_trait::async_trait]
    impl Channel for MemoryChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn network(&self) -> Network {
            self.network
        }

        fn attachments(&self) -> &Attachments {
            &self.attachments
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn new_packet(&self, payload: Bytes) -> Packet {
            let ch = self
                .self_ref
                .get()
                .and_then(Weak::upgrade)
                .expect("bound at construction");
            let tag = match self.network {
                Network::Ws => PacketTag::Ws(WsMsgType::Text),
                Network::Kws => PacketTag::Kws {
                    opcode: OPCODE_TEXT_SIGNALLING,
                },
                _ => PacketTag::Raw,
            };
            Packet::new(ch, payload, tag)
        }

        async fn write(&self, packet: Packet) -> Result<()> {
            if self.is_closed() {
                return Err(AgentError::Transport("closed".into()));
            }
            self.written.lock().push(packet);
            Ok(())
        }

        fn start(&self) {}

        fn stop(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse_roundtrip() {
        for tag in ["ws", "kws", "kcp", "tcp", "udp", "http", "httpx"] {
            let network = Network::parse(tag).unwrap();
            assert_eq!(network.as_str(), tag);
        }
        assert!(Network::parse("quic").is_none());
    }

    #[test]
    fn test_attachments_typed_access() {
        let attachments = Attachments::new();
        attachments.put(KEY_OPCODE, 7u16);
        assert_eq!(*attachments.get::<u16>(KEY_OPCODE).unwrap(), 7);
        // Wrong type reads as absent.
        assert!(attachments.get::<String>(KEY_OPCODE).is_none());
        attachments.remove(KEY_OPCODE);
        assert!(!attachments.contains(KEY_OPCODE));
    }

    #[test]
    fn test_packet_release_flag() {
        let ch = testing::MemoryChannel::new(Network::Ws);
        let packet = ch.new_packet(Bytes::from_static(b"x"));
        assert!(!packet.is_released());
        packet.release();
        assert!(packet.is_released());
    }

    #[tokio::test]
    async fn test_core_write_after_stop_fails() {
        let (core, _plumbing) = ChannelCore::new(Network::Ws, None, 4);
        core.stop();
        let ch = testing::MemoryChannel::new(Network::Ws);
        let packet = ch.new_packet(Bytes::from_static(b"x"));
        assert!(core.write(packet).await.is_err());
    }

    #[test]
    fn test_core_inactive_claimed_once() {
        let (core, _plumbing) = ChannelCore::new(Network::Ws, None, 4);
        assert!(core.claim_inactive());
        assert!(!core.claim_inactive());
    }
}
