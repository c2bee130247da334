//! WebSocket listener using tokio-tungstenite.
//!
//! Every accepted WebSocket connection becomes one session. Binary frames
//! carry CBOR messages and text frames carry JSON messages; see
//! [`mailgate_core::codec`].

use futures_util::{SinkExt, StreamExt};
use mailgate_core::{GateError, GateResult, WireFormat};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    /// The WebSocket stream.
    pub ws_stream: WebSocketStream<TcpStream>,
    /// Remote address.
    pub remote_addr: SocketAddr,
}

/// One protocol frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub format: WireFormat,
    pub payload: Vec<u8>,
}

/// Bind the WebSocket listener and start accepting in the background.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields connections whose WebSocket handshake completed.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> GateResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => {
                    debug!("server stopped accepting, listener exiting");
                    break;
                }
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one encoded message in the frame type matching `format`.
pub async fn ws_send(
    ws: &mut WebSocketStream<TcpStream>,
    format: WireFormat,
    payload: Vec<u8>,
) -> GateResult<()> {
    let frame = match format {
        WireFormat::Cbor => WsMessage::Binary(payload.into()),
        WireFormat::Json => {
            let text = String::from_utf8(payload)
                .map_err(|e| GateError::Codec(format!("JSON frame is not UTF-8: {e}")))?;
            WsMessage::Text(text.into())
        }
    };
    ws.send(frame)
        .await
        .map_err(|e| GateError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next protocol frame.
///
/// Returns `None` once the connection is closed. Control frames are handled
/// here and never surface to the caller.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> GateResult<Option<Frame>> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                return Ok(Some(Frame {
                    format: WireFormat::Cbor,
                    payload: data.to_vec(),
                }));
            }
            Some(Ok(WsMessage::Text(text))) => {
                return Ok(Some(Frame {
                    format: WireFormat::Json,
                    payload: text.as_bytes().to_vec(),
                }));
            }
            Some(Ok(WsMessage::Close(_))) => return Ok(None),
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(GateError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

/// Close the WebSocket with a normal close frame, ignoring errors.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    let _ = ws.close(None).await;
}
