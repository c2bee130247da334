//! The tunnel client.
//!
//! `TunnelClient` owns the WebSocket connection. A writer task serializes
//! outgoing messages onto the socket; a dispatch task reads gateway messages
//! and routes them to waiting `open`/`ping` calls and to per-stream channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use mailgate_core::{codec, GateError, GateResult, Message, StreamId, WireFormat};

use crate::stream::{StreamEvent, TunnelStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Result of an `open` request: the new stream, or the gateway's error text.
type OpenReply = Result<(StreamId, mpsc::UnboundedReceiver<StreamEvent>), String>;

/// Work for the writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Message(Message),
    Close,
}

/// Everything the dispatch task routes replies to.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) opens: HashMap<u32, oneshot::Sender<OpenReply>>,
    pub(crate) streams: HashMap<StreamId, mpsc::UnboundedSender<StreamEvent>>,
    pub(crate) acks: HashMap<(StreamId, u32), oneshot::Sender<()>>,
    pub(crate) pings: HashMap<u64, oneshot::Sender<()>>,
    /// Set once the connection is gone; nothing will be routed anymore.
    closed: bool,
}

impl Registry {
    pub(crate) fn ensure_open(&self) -> GateResult<()> {
        if self.closed {
            return Err(GateError::Closed);
        }
        Ok(())
    }

    /// Drop every waiter, waking it with "closed", and refuse new ones.
    fn shut(&mut self) {
        *self = Registry {
            closed: true,
            ..Registry::default()
        };
    }

    fn forget_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.acks.retain(|(id, _), _| *id != stream_id);
    }
}

/// A connection to a mailgate gateway.
pub struct TunnelClient {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    registry: Arc<Mutex<Registry>>,
    next_request_id: AtomicU32,
    next_ping_id: AtomicU64,
    writer_handle: Option<JoinHandle<()>>,
    dispatch_handle: JoinHandle<()>,
}

impl TunnelClient {
    /// Connect using binary CBOR frames.
    pub async fn connect(url: &str) -> GateResult<Self> {
        Self::connect_with_format(url, WireFormat::Cbor).await
    }

    /// Connect and speak `format` for every frame of the session.
    pub async fn connect_with_format(url: &str, format: WireFormat) -> GateResult<Self> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| GateError::Transport(format!("WebSocket connect error: {e}")))?;

        info!(url, ?format, "connected to gateway");

        let (ws_sink, ws_read) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (dispatch_done, dispatch_done_rx) = oneshot::channel::<()>();

        let writer_handle =
            tokio::spawn(write_loop(ws_sink, outgoing_rx, dispatch_done_rx, format));
        let dispatch_handle =
            tokio::spawn(dispatch_loop(ws_read, registry.clone(), dispatch_done));

        Ok(Self {
            outgoing,
            registry,
            next_request_id: AtomicU32::new(1),
            next_ping_id: AtomicU64::new(1),
            writer_handle: Some(writer_handle),
            dispatch_handle,
        })
    }

    /// Open a tunnel to `host:port`.
    ///
    /// Resolves once the gateway has connected to the destination. A
    /// refused or unresolvable destination yields [`GateError::Connect`].
    pub async fn open(&self, host: &str, port: u16) -> GateResult<TunnelStream> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry.lock().await;
            registry.ensure_open()?;
            registry.opens.insert(request_id, tx);
        }

        self.push(Message::Open {
            request_id,
            host: host.to_string(),
            port,
        })?;

        match rx.await {
            Ok(Ok((stream_id, events))) => {
                debug!(stream_id, host, port, "stream opened");
                Ok(TunnelStream::new(
                    stream_id,
                    events,
                    self.outgoing.clone(),
                    self.registry.clone(),
                ))
            }
            Ok(Err(message)) => Err(GateError::Connect(message)),
            Err(_) => Err(GateError::Closed),
        }
    }

    /// Round-trip a ping through the gateway.
    pub async fn ping(&self) -> GateResult<Duration> {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry.lock().await;
            registry.ensure_open()?;
            registry.pings.insert(id, tx);
        }

        let sent = Instant::now();
        self.push(Message::Ping { id })?;
        rx.await.map_err(|_| GateError::Closed)?;
        Ok(sent.elapsed())
    }

    /// Whether the gateway connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.dispatch_handle.is_finished()
    }

    /// Close the WebSocket. The gateway closes every stream of the session.
    pub async fn close(mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
        if let Some(writer) = self.writer_handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
                warn!("timed out closing gateway connection");
            }
        }
        self.dispatch_handle.abort();
        self.registry.lock().await.shut();
    }

    fn push(&self, message: Message) -> GateResult<()> {
        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_| GateError::Closed)
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    mut dispatch_done: oneshot::Receiver<()>,
    format: WireFormat,
) {
    loop {
        let item = tokio::select! {
            item = outgoing.recv() => item,
            _ = &mut dispatch_done => {
                debug!("gateway connection gone, writer stopping");
                return;
            }
        };
        let message = match item {
            Some(Outgoing::Message(message)) => message,
            Some(Outgoing::Close) | None => break,
        };
        let payload = match codec::encode(&message, format) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode message");
                continue;
            }
        };
        let frame = match format {
            WireFormat::Cbor => WsMessage::Binary(payload),
            WireFormat::Json => match String::from_utf8(payload) {
                Ok(text) => WsMessage::Text(text),
                Err(e) => {
                    warn!(error = %e, "encoded JSON is not UTF-8");
                    continue;
                }
            },
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "gateway connection lost while writing");
            return;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
    debug!("writer loop ended");
}

/// `_done` is dropped on return, which stops the writer.
async fn dispatch_loop(
    mut ws_read: SplitStream<WsStream>,
    registry: Arc<Mutex<Registry>>,
    _done: oneshot::Sender<()>,
) {
    while let Some(frame) = ws_read.next().await {
        let (payload, format) = match frame {
            Ok(WsMessage::Binary(data)) => (data, WireFormat::Cbor),
            Ok(WsMessage::Text(text)) => (text.into_bytes(), WireFormat::Json),
            Ok(WsMessage::Close(_)) => {
                debug!("gateway sent close frame");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "gateway read error");
                break;
            }
        };

        let message: Message = match codec::decode(&payload, format) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable gateway message");
                continue;
            }
        };

        route(&mut *registry.lock().await, message);
    }

    registry.lock().await.shut();
    debug!("dispatch loop ended");
}

fn route(registry: &mut Registry, message: Message) {
    match message {
        Message::Opened {
            request_id,
            stream_id,
        } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let claimed = registry
                .opens
                .remove(&request_id)
                .is_some_and(|waiter| waiter.send(Ok((stream_id, rx))).is_ok());
            if claimed {
                registry.streams.insert(stream_id, tx);
            } else {
                debug!(request_id, stream_id, "opened stream nobody is waiting for");
            }
        }
        Message::Error {
            stream_id,
            message,
            request_id,
        } => {
            if let Some(waiter) = request_id.and_then(|id| registry.opens.remove(&id)) {
                let _ = waiter.send(Err(message));
            } else {
                deliver(registry, stream_id, StreamEvent::Error(message));
            }
        }
        Message::Data {
            stream_id, data, ..
        } => deliver(registry, stream_id, StreamEvent::Data(data)),
        Message::Ack { stream_id, ack } => {
            if let Some(waiter) = registry.acks.remove(&(stream_id, ack)) {
                let _ = waiter.send(());
            }
        }
        Message::End { stream_id } => deliver(registry, stream_id, StreamEvent::End),
        Message::Close { stream_id } => {
            deliver(registry, stream_id, StreamEvent::Close);
            registry.forget_stream(stream_id);
        }
        Message::Pong { id } => {
            if let Some(waiter) = registry.pings.remove(&id) {
                let _ = waiter.send(());
            }
        }
        other => debug!(kind = other.kind(), "unexpected message from gateway"),
    }
}

fn deliver(registry: &mut Registry, stream_id: StreamId, event: StreamEvent) {
    if let Some(tx) = registry.streams.get(&stream_id) {
        if tx.send(event).is_err() {
            registry.forget_stream(stream_id);
        }
    }
}
