// # Agent Server
//
// Owns the listener, maps every accepted agent channel to an upstream
// on activation, and relays packets in both directions. From the
// server's viewpoint an agent channel walks
// `ACCEPTED -> ACTIVATING -> ACTIVE -> CLOSING -> CLOSED`; any
// activation failure jumps straight to CLOSING and the channel is
// refused.
//
// Two listener flavors are bundled: WS over a TCP listener (upgrades
// outside the declared path set are rejected during the handshake)
// and KWS over a shared UDP socket demultiplexed by peer address
// (activation waits for the registration frame).

use crate::channel::kws::{KwsChannel, KwsDemuxEntry, KwsDemuxMap};
use crate::channel::ws::WsChannel;
use crate::channel::{
    deliver_active, frame::Frame, Channel, ChannelEvents, Network, Packet, Params,
    KEY_ACTIVATING, KEY_PARAMS, KEY_PATH, KEY_SUBPROTOCOL, KEY_UPSTREAM,
};
use crate::config::{AgServerConfig, ChannelConfig, ListenPath, ReadPoolConfig};
use crate::error::{AgentError, Result};
use crate::extension::Extension;
use crate::service::Service;
use crate::upstream::Upstream;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

/// Agent-channel lifecycle, as tracked by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Accepted,
    Activating,
    Active,
    Closing,
}

struct AgentEntry {
    channel: Arc<dyn Channel>,
    state: AgentState,
}

/// Request data captured during the WS upgrade handshake.
#[derive(Default)]
struct UpgradeInfo {
    path: String,
    params: Params,
    subprotocol: Option<String>,
}

pub struct AgServer {
    conf: AgServerConfig,
    channel_conf: ChannelConfig,
    queue_size: usize,
    extension: Arc<dyn Extension>,
    service: Weak<Service>,
    channels: DashMap<String, AgentEntry>,
    read_permits: Arc<Semaphore>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    local_addr: OnceCell<SocketAddr>,
    closed: AtomicBool,
    self_ref: OnceCell<Weak<AgServer>>,
}

impl AgServer {
    pub fn new(
        service: Weak<Service>,
        conf: AgServerConfig,
        channel_conf: ChannelConfig,
        read_pool: &ReadPoolConfig,
        extension: Arc<dyn Extension>,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            conf,
            channel_conf,
            queue_size: read_pool.queue_size,
            extension,
            service,
            channels: DashMap::new(),
            read_permits: Arc::new(Semaphore::new(read_pool.permits())),
            tasks: parking_lot::Mutex::new(Vec::new()),
            local_addr: OnceCell::new(),
            closed: AtomicBool::new(false),
            self_ref: OnceCell::new(),
        });
        let _ = server.self_ref.set(Arc::downgrade(&server));
        server
    }

    pub fn conf(&self) -> &AgServerConfig {
        &self.conf
    }

    /// Bound listener address, available once `listen` returned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Live agent channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind the listener and start accepting. The listen hooks run
    /// around the bind; an error from the before-hook aborts.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        self.extension.before_server_listen(self).await?;
        match self.conf.network {
            Network::Ws => self.listen_ws().await?,
            Network::Kws => self.listen_kws().await?,
            other => {
                return Err(AgentError::Config(format!(
                    "unsupported listen network: {}",
                    other
                )))
            }
        }
        self.extension.after_server_listen(self).await;
        Ok(())
    }

    /// Stop accepting and stop every live agent channel. Idempotent.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            info!(server = %self.conf.id, "agent server already stopped");
            return;
        }
        info!(server = %self.conf.id, "stopping agent server");
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let channels: Vec<Arc<dyn Channel>> = self
            .channels
            .iter()
            .map(|entry| entry.value().channel.clone())
            .collect();
        for channel in channels {
            channel.stop();
        }
        self.channels.clear();
    }

    fn agent_events(&self) -> Arc<dyn ChannelEvents> {
        let server = self.self_ref.get().cloned().unwrap_or_default();
        Arc::new(AgentEvents { server })
    }

    fn at_capacity(&self) -> bool {
        self.conf.max_channel_size > 0 && self.channels.len() >= self.conf.max_channel_size
    }

    fn register_channel(&self, channel: Arc<dyn Channel>) {
        self.channels.insert(
            channel.id().to_string(),
            AgentEntry {
                channel,
                state: AgentState::Accepted,
            },
        );
    }

    fn set_state(&self, channel_id: &str, state: AgentState) {
        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            debug!(agent_ch = %channel_id, ?state, "agent state");
            entry.state = state;
        }
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Drive a freshly accepted agent channel through activation.
    pub(crate) async fn activate(&self, channel: Arc<dyn Channel>) -> Result<()> {
        self.set_state(channel.id(), AgentState::Activating);
        self.extension.before_agent_active(&channel).await?;
        self.locate_upstream(&channel).await?;
        self.extension.after_agent_active(&channel).await;
        self.set_state(channel.id(), AgentState::Active);
        info!(agent_ch = %channel.id(), "agent channel active");
        Ok(())
    }

    /// Resolve the location for this channel, let the upstream build
    /// the pair, and attach the upstream to the channel.
    async fn locate_upstream(&self, channel: &Arc<dyn Channel>) -> Result<()> {
        let (pattern, params) = self.extension.location_pattern(channel);
        let location = self
            .conf
            .locations
            .get(&pattern)
            .or_else(|| self.conf.locations.get(""))
            .ok_or_else(|| {
                AgentError::Routing(format!("no location for pattern {}", pattern))
            })?;

        let service = self
            .service
            .upgrade()
            .ok_or_else(|| AgentError::Internal("service dropped".into()))?;
        let upstream = service.upstream(&location.upstream_id).ok_or_else(|| {
            AgentError::Routing(format!("no upstream for id {}", location.upstream_id))
        })?;

        upstream
            .init_channel_peer(channel.clone(), params)
            .await?;

        channel.attachments().put(KEY_UPSTREAM, upstream);
        // First-frame marker, cleared by the first transfer.
        channel.attachments().put(KEY_ACTIVATING, true);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data and teardown paths
    // ------------------------------------------------------------------

    pub(crate) async fn on_agent_read(&self, packet: Packet) {
        let _permit = match self.read_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        // User interceptors first, in registration order; a released
        // packet is consumed.
        for handler in self.extension.agent_msg_handlers() {
            handler.handle(&packet).await;
            if packet.is_released() {
                return;
            }
        }

        let agent_channel = packet.channel();
        let Some(upstream) = agent_channel
            .attachments()
            .get::<Arc<dyn Upstream>>(KEY_UPSTREAM)
        else {
            warn!(agent_ch = %agent_channel.id(), "no upstream attached, dropping packet");
            return;
        };
        let Some(dst_channel) = upstream.query_dst_channel(agent_channel.id()) else {
            warn!(agent_ch = %agent_channel.id(), "no dst channel, dropping packet");
            return;
        };
        if let Err(err) = self.extension.transfer(&packet, &dst_channel).await {
            warn!(
                agent_ch = %agent_channel.id(),
                error = %err,
                "agent-to-dst transfer failed"
            );
        }
    }

    pub(crate) fn on_agent_inactive(&self, channel: Arc<dyn Channel>) {
        self.set_state(channel.id(), AgentState::Closing);
        if let Some(upstream) = channel
            .attachments()
            .get::<Arc<dyn Upstream>>(KEY_UPSTREAM)
        {
            upstream.release_on_agent_channel(&channel);
        }
        self.channels.remove(channel.id());
        debug!(agent_ch = %channel.id(), "agent channel closed");
    }

    // ------------------------------------------------------------------
    // WS listener
    // ------------------------------------------------------------------

    async fn listen_ws(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.conf.bind_addr()).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);
        info!(server = %self.conf.id, addr = %local, "listening (ws)");

        let server = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if server.is_closed() {
                            break;
                        }
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.handle_ws_accept(stream, peer).await;
                        });
                    }
                    Err(err) => {
                        if server.is_closed() {
                            break;
                        }
                        warn!(error = %err, "accept failed");
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn handle_ws_accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let captured: Arc<parking_lot::Mutex<Option<UpgradeInfo>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let callback_captured = captured.clone();
        let listen_paths = self.conf.listen_paths.clone();
        let at_capacity = self.at_capacity();

        let callback = move |req: &Request, mut resp: Response| {
            if at_capacity {
                return Err(reject_upgrade(StatusCode::SERVICE_UNAVAILABLE));
            }
            let path = req.uri().path().to_string();
            let entry = match_listen_path(&listen_paths, &path);
            if !listen_paths.is_empty() && entry.is_none() {
                return Err(reject_upgrade(StatusCode::NOT_FOUND));
            }
            let params = parse_query(req.uri().query());
            let subprotocol = negotiate_subprotocol(req, &mut resp, entry);
            *callback_captured.lock() = Some(UpgradeInfo {
                path,
                params,
                subprotocol,
            });
            Ok(resp)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(err) => {
                debug!(%peer, error = %err, "handshake rejected");
                return;
            }
        };
        let info = captured.lock().take().unwrap_or_default();

        let events = self.agent_events();
        let channel = WsChannel::accept(
            ws,
            Some(peer),
            events.clone(),
            &self.channel_conf,
            self.queue_size,
        );
        channel.attachments().put(KEY_PATH, info.path);
        channel.attachments().put(KEY_PARAMS, info.params);
        if let Some(subprotocol) = info.subprotocol {
            channel.attachments().put(KEY_SUBPROTOCOL, subprotocol);
        }

        let channel: Arc<dyn Channel> = channel;
        self.register_channel(channel.clone());
        self.run_activation(events, channel).await;
    }

    async fn run_activation(&self, events: Arc<dyn ChannelEvents>, channel: Arc<dyn Channel>) {
        match deliver_active(&events, channel.clone()).await {
            Ok(()) => channel.start(),
            Err(err) => {
                warn!(agent_ch = %channel.id(), error = %err, "activation refused");
                channel.stop();
            }
        }
    }

    // ------------------------------------------------------------------
    // KWS listener
    // ------------------------------------------------------------------

    async fn listen_kws(self: &Arc<Self>) -> Result<()> {
        let socket = UdpSocket::bind(self.conf.bind_addr()).await?;
        let local = socket.local_addr()?;
        let _ = self.local_addr.set(local);
        info!(server = %self.conf.id, addr = %local, "listening (kws)");

        let server = self.clone();
        let socket = Arc::new(socket);
        let demux: Arc<KwsDemuxMap> = Arc::new(DashMap::new());
        let handle = tokio::spawn(async move {
            server.demux_loop(socket, demux).await;
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn demux_loop(self: Arc<Self>, socket: Arc<UdpSocket>, demux: Arc<KwsDemuxMap>) {
        let mut buf = vec![0u8; self.channel_conf.read_buf_size.max(2048)];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    if self.is_closed() {
                        break;
                    }
                    warn!(error = %err, "udp recv failed");
                    continue;
                }
            };
            if self.is_closed() {
                break;
            }

            let frame = match Frame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    self.count_decode_failure(&demux, peer, &err);
                    continue;
                }
            };

            if let Some(entry) = demux.get(&peer) {
                entry.fails.store(0, Ordering::Relaxed);
                if entry.tx.try_send(frame).is_err() {
                    warn!(%peer, "read queue full, dropping frame");
                }
                continue;
            }
            self.register_kws_peer(&socket, &demux, peer, frame);
        }
    }

    fn count_decode_failure(&self, demux: &KwsDemuxMap, peer: SocketAddr, err: &AgentError) {
        match demux.get(&peer) {
            Some(entry) => {
                let fails = entry.fails.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(%peer, error = %err, fails, "undecodable datagram");
                if fails >= self.channel_conf.close_recv_fail_limit.max(1) {
                    entry.channel.stop();
                }
            }
            None => warn!(%peer, error = %err, "undecodable datagram from unknown peer"),
        }
    }

    /// First contact from a peer: the frame must be a `TEXT_SESSION`
    /// registration carrying a JSON object with at least `path`.
    /// Anything else refuses the session.
    fn register_kws_peer(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        demux: &Arc<KwsDemuxMap>,
        peer: SocketAddr,
        frame: Frame,
    ) {
        if !frame.is_session() {
            warn!(%peer, opcode = frame.opcode, "first frame is not a session frame");
            return;
        }
        let params = match serde_json::from_slice::<Value>(&frame.payload) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(%peer, "malformed registration payload");
                return;
            }
        };
        if !params.get("path").map(Value::is_string).unwrap_or(false) {
            warn!(%peer, "registration missing path");
            return;
        }
        if self.at_capacity() {
            warn!(%peer, "max channel size reached, rejecting");
            return;
        }

        let (tx, frame_rx) = mpsc::channel(self.queue_size.max(1));
        let events = self.agent_events();
        let channel = KwsChannel::accept(
            socket.clone(),
            peer,
            frame_rx,
            Arc::downgrade(demux),
            events.clone(),
            &self.channel_conf,
            self.queue_size,
        );
        channel.attachments().put(KEY_PARAMS, params);

        let channel: Arc<dyn Channel> = channel;
        demux.insert(
            peer,
            KwsDemuxEntry {
                tx,
                fails: AtomicU32::new(0),
                channel: channel.clone(),
            },
        );
        self.register_channel(channel.clone());

        // Activation dials the dst; keep it off the demux loop.
        let server = self.clone();
        tokio::spawn(async move {
            server.run_activation(events, channel).await;
        });
    }
}

/// Callback adapter wired into every accepted agent channel.
struct AgentEvents {
    server: Weak<AgServer>,
}

#[async_trait::async_trait]
impl ChannelEvents for AgentEvents {
    async fn on_active(&self, channel: Arc<dyn Channel>) -> Result<()> {
        match self.server.upgrade() {
            Some(server) => server.activate(channel).await,
            None => Err(AgentError::Internal("server dropped".into())),
        }
    }

    async fn on_read(&self, packet: Packet) {
        if let Some(server) = self.server.upgrade() {
            server.on_agent_read(packet).await;
        }
    }

    async fn on_inactive(&self, channel: Arc<dyn Channel>) {
        if let Some(server) = self.server.upgrade() {
            server.on_agent_inactive(channel);
        }
    }
}

fn reject_upgrade(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

fn match_listen_path<'a>(listen_paths: &'a [ListenPath], path: &str) -> Option<&'a ListenPath> {
    listen_paths.iter().find(|entry| entry.path == path)
}

/// Decode `k=v&k2=v2` into params; values stay strings.
fn parse_query(query: Option<&str>) -> Params {
    let mut params = Params::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => params.insert(key.to_string(), Value::String(value.to_string())),
            None => params.insert(pair.to_string(), Value::String(String::new())),
        };
    }
    params
}

/// Pick the configured subprotocol when the client offered it.
fn negotiate_subprotocol(
    req: &Request,
    resp: &mut Response,
    entry: Option<&ListenPath>,
) -> Option<String> {
    let wanted = entry.and_then(|e| e.subprotocol.as_deref())?;
    let offered = req
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())?;
    let matched = offered
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == wanted);
    if !matched {
        return None;
    }
    if let Ok(value) = wanted.parse() {
        resp.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    Some(wanted.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let params = parse_query(Some("token=abc&room=blue&flag"));
        assert_eq!(params["token"], Value::String("abc".into()));
        assert_eq!(params["room"], Value::String("blue".into()));
        assert_eq!(params["flag"], Value::String(String::new()));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_match_listen_path_is_exact() {
        let paths = vec![ListenPath {
            network: Network::Ws,
            path: "/chat".into(),
            subprotocol: None,
        }];
        assert!(match_listen_path(&paths, "/chat").is_some());
        assert!(match_listen_path(&paths, "/chat/extra").is_none());
        assert!(match_listen_path(&paths, "/other").is_none());
    }
}
