//! WebSocket channel adapter.
//!
//! Wraps a `tokio-tungstenite` stream on either side of the proxy:
//! accepted agent connections and dialed dst connections share the
//! same reader/writer tasks. Writes are queued and flushed in issue
//! order by a single writer; reads are delivered one at a time in
//! on-wire order once the owner releases the read gate.

use crate::channel::{
    deliver_inactive, deliver_read, frame::Frame, Attachments, Channel, ChannelCore,
    ChannelEvents, Network, Packet, PacketTag, Params, WsMsgType,
};
use crate::config::{ChannelConfig, DstClientConfig};
use crate::error::{AgentError, Result};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

pub struct WsChannel {
    core: ChannelCore,
}

impl WsChannel {
    /// Wrap an accepted listener-side stream.
    pub fn accept<S>(
        stream: WebSocketStream<S>,
        remote: Option<SocketAddr>,
        events: Arc<dyn ChannelEvents>,
        conf: &ChannelConfig,
        queue_size: usize,
    ) -> Arc<WsChannel>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(stream, remote, events, conf, queue_size)
    }

    /// Dial a WS dst endpoint. `params` become the query string; the
    /// configured subprotocol is offered on the upgrade request.
    pub async fn connect(
        dst_conf: &DstClientConfig,
        params: &Params,
        events: Arc<dyn ChannelEvents>,
        conf: &ChannelConfig,
        queue_size: usize,
    ) -> Result<Arc<dyn Channel>> {
        let mut url = dst_conf.url();
        let query = encode_params(params);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|err| AgentError::Dial(format!("invalid dst url {}: {}", url, err)))?;
        if let Some(subprotocol) = &dst_conf.subprotocol {
            let value = HeaderValue::from_str(subprotocol).map_err(|err| {
                AgentError::Dial(format!("invalid subprotocol {}: {}", subprotocol, err))
            })?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| AgentError::Dial(format!("dial {} failed: {}", url, err)))?;

        let remote = dst_conf.addr().parse().ok();
        Ok(Self::spawn(stream, remote, events, conf, queue_size))
    }

    fn spawn<S>(
        stream: WebSocketStream<S>,
        remote: Option<SocketAddr>,
        events: Arc<dyn ChannelEvents>,
        conf: &ChannelConfig,
        queue_size: usize,
    ) -> Arc<WsChannel>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (core, plumbing) = ChannelCore::new(Network::Ws, remote, queue_size);
        let channel = Arc::new(WsChannel { core });
        let dyn_channel: Arc<dyn Channel> = channel.clone();
        channel.core.bind(Arc::downgrade(&dyn_channel));

        let (sink, split_stream) = stream.split();
        tokio::spawn(write_loop(
            sink,
            plumbing.out_rx,
            plumbing.shutdown_rx.clone(),
            conf.write_timeout,
            dyn_channel.clone(),
        ));
        tokio::spawn(read_loop(
            split_stream,
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
impl Channel for WsChannel {
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
            PacketTag::Ws(WsMsgType::Text),
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

/// Build the query string from per-connection parameters.
fn encode_params(params: &Params) -> String {
    params
        .iter()
        .map(|(key, value)| {
            let value = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Translate a packet into an outbound WS message. Text packets with
/// non-UTF-8 payloads are dropped.
fn encode_message(packet: &Packet) -> Option<Message> {
    match packet.tag() {
        PacketTag::Ws(WsMsgType::Text) => match String::from_utf8(packet.payload().to_vec()) {
            Ok(text) => Some(Message::text(text)),
            Err(_) => {
                warn!(ch_id = %packet.channel().id(), "dropping non-utf8 text packet");
                None
            }
        },
        PacketTag::Ws(WsMsgType::Binary) | PacketTag::Raw => {
            Some(Message::binary(packet.payload().clone()))
        }
        PacketTag::Kws { opcode } => {
            let frame = Frame::new(*opcode, packet.payload().clone());
            Some(Message::binary(frame.encode()))
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut out_rx: mpsc::Receiver<Packet>,
    mut shutdown_rx: watch::Receiver<bool>,
    write_timeout: Option<Duration>,
    channel: Arc<dyn Channel>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
        let Some(message) = encode_message(&packet) else {
            continue;
        };
        let result = match write_timeout {
            Some(limit) => match timeout(limit, sink.send(message)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(ch_id = %channel.id(), "write timeout");
                    break;
                }
            },
            None => sink.send(message).await,
        };
        if let Err(err) = result {
            debug!(ch_id = %channel.id(), error = %err, "write failed");
            break;
        }
    }
    let _ = sink.close().await;
    // Wakes the reader, which owns the in-active dispatch.
    channel.stop();
}

enum ReadOutcome {
    Message(Message),
    Timeout,
    Closed,
    Failed(String),
}

async fn read_next<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    read_timeout: Option<Duration>,
) -> ReadOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let next = stream.next();
    let item = match read_timeout {
        Some(limit) => match timeout(limit, next).await {
            Ok(item) => item,
            Err(_) => return ReadOutcome::Timeout,
        },
        None => next.await,
    };
    match item {
        None => ReadOutcome::Closed,
        Some(Ok(message)) => ReadOutcome::Message(message),
        Some(Err(err)) => ReadOutcome::Failed(err.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    start_rx: oneshot::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
    read_timeout: Option<Duration>,
    fail_limit: u32,
    channel: Arc<WsChannel>,
    dyn_channel: Arc<dyn Channel>,
    events: Arc<dyn ChannelEvents>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Delivery starts once the owner registered the channel; a channel
    // stopped before that just winds down.
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
                outcome = read_next(&mut stream, read_timeout) => outcome,
            };
            match outcome {
                ReadOutcome::Message(Message::Text(text)) => {
                    consecutive_fails = 0;
                    let payload: Bytes = text.into();
                    let packet = Packet::new(
                        dyn_channel.clone(),
                        payload,
                        PacketTag::Ws(WsMsgType::Text),
                    );
                    deliver_read(&events, packet).await;
                }
                ReadOutcome::Message(Message::Binary(payload)) => {
                    consecutive_fails = 0;
                    let packet = Packet::new(
                        dyn_channel.clone(),
                        payload,
                        PacketTag::Ws(WsMsgType::Binary),
                    );
                    deliver_read(&events, packet).await;
                }
                ReadOutcome::Message(Message::Close(_)) => break,
                ReadOutcome::Message(_) => continue,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_params() {
        let mut params = Params::new();
        params.insert("token".into(), json!("abc"));
        params.insert("n".into(), json!(3));
        let query = encode_params(&params);
        assert!(query.contains("token=abc"));
        assert!(query.contains("n=3"));
        assert_eq!(query.matches('&').count(), 1);
    }

    #[test]
    fn test_encode_params_empty() {
        assert_eq!(encode_params(&Params::new()), "");
    }
}
