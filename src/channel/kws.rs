//! KWS channel adapter.
//!
//! KWS frames are carried one per UDP datagram. On the listener side a
//! single socket is shared by all peers; the server demultiplexes by
//! peer address and feeds each channel's frame queue. On the dial side
//! the channel owns its socket. The KCP ARQ layer sits below this
//! module's horizon; swapping the carrier does not touch the channel
//! surface or the framing.

use crate::channel::{
    deliver_inactive, deliver_read, frame::Frame, Attachments, Channel, ChannelCore,
    ChannelEvents, Network, Packet, PacketTag, OPCODE_TEXT_SIGNALLING,
};
use crate::config::{ChannelConfig, DstClientConfig};
use crate::error::{AgentError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Listener-side bookkeeping for one remote peer: the frame queue
/// feeding its channel and the consecutive decode-failure count.
pub struct KwsDemuxEntry {
    pub tx: mpsc::Sender<Frame>,
    pub fails: AtomicU32,
    pub channel: Arc<dyn Channel>,
}

/// Peer address to demux entry, owned by the KWS listener.
pub type KwsDemuxMap = DashMap<SocketAddr, KwsDemuxEntry>;

pub struct KwsChannel {
    core: ChannelCore,
}

/// Where this channel's inbound frames come from.
enum FrameSource {
    /// Listener side: frames pushed by the demux loop.
    Queue(mpsc::Receiver<Frame>),
    /// Dial side: the channel reads its own socket.
    Socket {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        buf_size: usize,
    },
}

impl KwsChannel {
    /// Wrap a listener-side peer. `frame_rx` is fed by the demux loop;
    /// the entry in `demux` is dropped when the channel winds down.
    pub fn accept(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        frame_rx: mpsc::Receiver<Frame>,
        demux: Weak<KwsDemuxMap>,
        events: Arc<dyn ChannelEvents>,
        conf: &ChannelConfig,
        queue_size: usize,
    ) -> Arc<KwsChannel> {
        Self::spawn(
            socket,
            peer,
            FrameSource::Queue(frame_rx),
            demux,
            events,
            conf,
            queue_size,
        )
    }

    /// Dial a KWS dst endpoint. No registration frame is sent here;
    /// the first relayed frame opens the session.
    pub async fn connect(
        dst_conf: &DstClientConfig,
        events: Arc<dyn ChannelEvents>,
        conf: &ChannelConfig,
        queue_size: usize,
    ) -> Result<Arc<dyn Channel>> {
        let peer: SocketAddr = dst_conf
            .addr()
            .parse()
            .map_err(|_| AgentError::Dial(format!("invalid dst address: {}", dst_conf.addr())))?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|err| AgentError::Dial(format!("udp bind failed: {}", err)))?;
        let socket = Arc::new(socket);
        let source = FrameSource::Socket {
            socket: socket.clone(),
            peer,
            buf_size: conf.read_buf_size,
        };
        let channel = Self::spawn(socket, peer, source, Weak::new(), events, conf, queue_size);
        Ok(channel)
    }

    fn spawn(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        source: FrameSource,
        demux: Weak<KwsDemuxMap>,
        events: Arc<dyn ChannelEvents>,
        conf: &ChannelConfig,
        queue_size: usize,
    ) -> Arc<KwsChannel> {
        let (core, plumbing) = ChannelCore::new(Network::Kws, Some(peer), queue_size);
        let channel = Arc::new(KwsChannel { core });
        let dyn_channel: Arc<dyn Channel> = channel.clone();
        channel.core.bind(Arc::downgrade(&dyn_channel));

        tokio::spawn(write_loop(
            socket,
            peer,
            plumbing.out_rx,
            plumbing.shutdown_rx.clone(),
            conf.write_timeout,
            dyn_channel.clone(),
        ));
        tokio::spawn(read_loop(
            source,
            peer,
            demux,
            plumbing.start_rx,
            plumbing.shutdown_rx,
            conf.read_timeout,
            conf.close_recv_fail_limit,
            channel.clone(),
            dyn_channel,
            events,
        ));
        channel
    }
}

#[async_trait::async_trait]
impl Channel for KwsChannel {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn network(&self) -> Network {
        self.core.network()
    }

    fn attachments(&self) -> &Attachments {
        self.core.attachments()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.core.remote()
    }

    fn new_packet(&self, payload: Bytes) -> Packet {
        Packet::new(
            self.core.channel_ref(),
            payload,
            PacketTag::Kws {
                opcode: OPCODE_TEXT_SIGNALLING,
            },
        )
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        self.core.write(packet).await
    }

    fn start(&self) {
        self.core.start();
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

/// Frame a packet for the wire. Untagged payloads go out as plain
/// signalling frames.
fn encode_datagram(packet: &Packet) -> Bytes {
    let opcode = packet.opcode().unwrap_or(OPCODE_TEXT_SIGNALLING);
    Frame::new(opcode, packet.payload().clone()).encode()
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut out_rx: mpsc::Receiver<Packet>,
    mut shutdown_rx: watch::Receiver<bool>,
    write_timeout: Option<Duration>,
    channel: Arc<dyn Channel>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let packet = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            maybe = out_rx.recv() => match maybe {
                Some(packet) => packet,
                None => break,
            },
        };
        let datagram = encode_datagram(&packet);
        let send = socket.send_to(&datagram, peer);
        let result = match write_timeout {
            Some(limit) => match timeout(limit, send).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(ch_id = %channel.id(), "write timeout");
                    break;
                }
            },
            None => send.await,
        };
        if let Err(err) = result {
            debug!(ch_id = %channel.id(), error = %err, "send failed");
            break;
        }
    }
    channel.stop();
}

enum ReadOutcome {
    Frame(Frame),
    Timeout,
    Closed,
    Failed(String),
}

impl FrameSource {
    async fn next(&mut self) -> ReadOutcome {
        match self {
            FrameSource::Queue(rx) => match rx.recv().await {
                Some(frame) => ReadOutcome::Frame(frame),
                None => ReadOutcome::Closed,
            },
            FrameSource::Socket {
                socket,
                peer,
                buf_size,
            } => {
                let mut buf = vec![0u8; (*buf_size).max(2048)];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, addr)) => {
                            if addr != *peer {
                                continue;
                            }
                            match Frame::decode(&buf[..len]) {
                                Ok(frame) => return ReadOutcome::Frame(frame),
                                Err(err) => return ReadOutcome::Failed(err.to_string()),
                            }
                        }
                        Err(err) => return ReadOutcome::Failed(err.to_string()),
                    }
                }
            }
        }
    }

    async fn next_with_timeout(&mut self, read_timeout: Option<Duration>) -> ReadOutcome {
        match read_timeout {
            Some(limit) => match timeout(limit, self.next()).await {
                Ok(outcome) => outcome,
                Err(_) => ReadOutcome::Timeout,
            },
            None => self.next().await,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut source: FrameSource,
    peer: SocketAddr,
    demux: Weak<KwsDemuxMap>,
    start_rx: oneshot::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
    read_timeout: Option<Duration>,
    fail_limit: u32,
    channel: Arc<KwsChannel>,
    dyn_channel: Arc<dyn Channel>,
    events: Arc<dyn ChannelEvents>,
) {
    let started = tokio::select! {
        started = start_rx => started.is_ok(),
        _ = shutdown_rx.changed() => false,
    };
    if started {
        let mut consecutive_fails = 0u32;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let outcome = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                outcome = source.next_with_timeout(read_timeout) => outcome,
            };
            match outcome {
                ReadOutcome::Frame(frame) => {
                    consecutive_fails = 0;
                    let packet = Packet::new(
                        dyn_channel.clone(),
                        frame.payload,
                        PacketTag::Kws {
                            opcode: frame.opcode,
                        },
                    );
                    deliver_read(&events, packet).await;
                }
                ReadOutcome::Timeout => {
                    warn!(ch_id = %dyn_channel.id(), "read timeout");
                    break;
                }
                ReadOutcome::Closed => break,
                ReadOutcome::Failed(err) => {
                    consecutive_fails += 1;
                    debug!(
                        ch_id = %dyn_channel.id(),
                        error = %err,
                        fails = consecutive_fails,
                        "read failed"
                    );
                    if consecutive_fails >= fail_limit.max(1) {
                        break;
                    }
                }
            }
        }
    }
    deliver_inactive(&channel.core, &events, dyn_channel).await;
    if let Some(demux) = demux.upgrade() {
        demux.remove(&peer);
    }
}
