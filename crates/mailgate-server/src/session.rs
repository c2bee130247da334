//! Session gateway: one client transport connection and its streams.
//!
//! [`SessionGateway`] is the synchronous core: it decodes client frames,
//! drives its [`StreamMultiplexer`] and produces the messages to send back.
//! [`run_session`] wraps it in the per-connection event loop that multiplexes
//! the WebSocket, the bridge event queue and the server shutdown signal.

use crate::config::GatewayConfig;
use crate::gateway::{BridgeCommand, StreamEvent, StreamMultiplexer};
use crate::transport::websocket::{self, Frame, WebSocketConnection};
use mailgate_core::{codec, GateResult, Message, WireFormat};
use rand::Rng;
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// State of one client session.
pub struct SessionGateway {
    session_id: String,
    remote_addr: SocketAddr,
    /// Encoding of the first client frame; replies use the same one.
    format: Option<WireFormat>,
    max_message_size: usize,
    streams: StreamMultiplexer,
}

impl SessionGateway {
    /// Create a session whose bridges report on `events`.
    pub fn new(
        remote_addr: SocketAddr,
        events: mpsc::Sender<StreamEvent>,
        config: &GatewayConfig,
    ) -> Self {
        let session_id = generate_session_id();
        Self {
            streams: StreamMultiplexer::new(
                session_id.clone(),
                events,
                config.read_buffer_size,
            ),
            session_id,
            remote_addr,
            format: None,
            max_message_size: config.max_message_size,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wire format for outbound messages.
    pub fn format(&self) -> WireFormat {
        self.format.unwrap_or_default()
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Handle one frame from the client and return the immediate replies.
    /// Malformed frames are logged and dropped.
    pub fn on_message(&mut self, frame: Frame) -> Vec<Message> {
        if frame.payload.len() > self.max_message_size {
            warn!(
                session_id = %self.session_id,
                bytes = frame.payload.len(),
                max = self.max_message_size,
                "frame too large, dropped"
            );
            return Vec::new();
        }

        let format = *self.format.get_or_insert(frame.format);
        if format != frame.format {
            debug!(
                session_id = %self.session_id,
                ?format,
                received = ?frame.format,
                "frame encoding differs from session encoding"
            );
        }

        let message: Message = match codec::decode(&frame.payload, frame.format) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "malformed frame dropped");
                return Vec::new();
            }
        };

        self.dispatch(message)
    }

    /// Route a decoded client message.
    pub fn dispatch(&mut self, message: Message) -> Vec<Message> {
        match message {
            Message::Open {
                request_id,
                host,
                port,
            } => match self.streams.open_stream(request_id, &host, port) {
                Ok(_) => Vec::new(),
                // No id could be allocated; 0 is never a valid stream.
                Err(e) => vec![
                    Message::Error {
                        stream_id: 0,
                        message: e.to_string(),
                        request_id: Some(request_id),
                    },
                    Message::Close { stream_id: 0 },
                ],
            },
            Message::Data {
                stream_id,
                data,
                ack,
            } => {
                self.streams
                    .route(stream_id, BridgeCommand::Write { data, ack });
                Vec::new()
            }
            Message::End { stream_id } => {
                self.streams.route(stream_id, BridgeCommand::End);
                Vec::new()
            }
            Message::Ping { id } => vec![Message::Pong { id }],
            other => {
                debug!(
                    session_id = %self.session_id,
                    kind = other.kind(),
                    "unexpected message from client ignored"
                );
                Vec::new()
            }
        }
    }

    /// Turn a bridge event into the message for the client.
    pub fn on_event(&mut self, event: StreamEvent) -> Option<Message> {
        self.streams.handle_event(event)
    }

    /// The transport is gone: close every stream.
    pub fn on_disconnect(&mut self) {
        self.streams.close_all();
        info!(
            session_id = %self.session_id,
            remote = %self.remote_addr,
            "closed connection"
        );
    }
}

/// Run one client session until the client disconnects or the server shuts
/// down. Every stream of the session is closed before this returns.
pub async fn run_session(
    mut conn: WebSocketConnection,
    config: &GatewayConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> GateResult<()> {
    let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(config.event_queue);
    let mut session = SessionGateway::new(conn.remote_addr, events_tx, config);

    info!(
        session_id = %session.session_id(),
        remote = %conn.remote_addr,
        "new connection"
    );

    let result = session_loop(&mut conn, &mut session, &mut events_rx, &mut shutdown_rx).await;

    session.on_disconnect();
    websocket::ws_close(&mut conn.ws_stream).await;
    result
}

async fn session_loop(
    conn: &mut WebSocketConnection,
    session: &mut SessionGateway,
    events_rx: &mut mpsc::Receiver<StreamEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> GateResult<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(session_id = %session.session_id(), "shutdown signal received");
                return Ok(());
            }

            Some(event) = events_rx.recv() => {
                if let Some(message) = session.on_event(event) {
                    send_message(conn, session, &message).await?;
                }
            }

            frame = websocket::ws_recv(&mut conn.ws_stream) => {
                match frame {
                    Ok(Some(frame)) => {
                        for reply in session.on_message(frame) {
                            send_message(conn, session, &reply).await?;
                        }
                    }
                    Ok(None) => {
                        debug!(session_id = %session.session_id(), "client closed transport");
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(session_id = %session.session_id(), error = %e, "transport ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn send_message(
    conn: &mut WebSocketConnection,
    session: &SessionGateway,
    message: &Message,
) -> GateResult<()> {
    let format = session.format();
    let payload = codec::encode(message, format)?;
    if let Message::Data { stream_id, data, .. } = message {
        trace!(
            session_id = %session.session_id(),
            stream_id,
            bytes = data.len(),
            "forwarding bytes to client"
        );
    }
    websocket::ws_send(&mut conn.ws_stream, format, payload).await
}

/// Opaque session identifier: 16 random bytes, hex encoded.
fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
