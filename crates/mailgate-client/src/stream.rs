//! One TCP tunnel inside a client session.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use mailgate_core::{GateError, GateResult, Message, StreamId};

use crate::client::{Outgoing, Registry};

/// What the gateway reported about a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Bytes read from the destination.
    Data(Vec<u8>),
    /// The destination socket failed; a `Close` follows.
    Error(String),
    /// The destination finished sending.
    End,
    /// The stream is gone. No further events follow.
    Close,
}

/// A tunnel to one destination, returned by [`TunnelClient::open`].
///
/// [`TunnelClient::open`]: crate::TunnelClient::open
pub struct TunnelStream {
    id: StreamId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    registry: Arc<Mutex<Registry>>,
    next_ack: u32,
}

impl TunnelStream {
    pub(crate) fn new(
        id: StreamId,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        outgoing: mpsc::UnboundedSender<Outgoing>,
        registry: Arc<Mutex<Registry>>,
    ) -> Self {
        Self {
            id,
            events,
            outgoing,
            registry,
            next_ack: 1,
        }
    }

    /// The gateway-assigned stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Queue bytes for the destination.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> GateResult<()> {
        self.push(Message::Data {
            stream_id: self.id,
            data: data.into(),
            ack: None,
        })
    }

    /// Send bytes and wait until the gateway has handed them to the socket.
    pub async fn send_acked(&mut self, data: impl Into<Vec<u8>>) -> GateResult<()> {
        let token = self.next_ack;
        self.next_ack = self.next_ack.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry.lock().await;
            registry.ensure_open()?;
            registry.acks.insert((self.id, token), tx);
        }

        self.push(Message::Data {
            stream_id: self.id,
            data: data.into(),
            ack: Some(token),
        })?;

        rx.await.map_err(|_| GateError::Closed)
    }

    /// Half-close: the destination sees end-of-stream.
    pub fn end(&self) -> GateResult<()> {
        self.push(Message::End { stream_id: self.id })
    }

    /// Next event from the gateway. `None` once the stream is closed and
    /// every event has been consumed, or the session is gone.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Read until the stream closes, returning all data received.
    ///
    /// An `Error` event does not stop the read: the stream is drained up to
    /// its `Close`, and only then is the last reported error returned.
    pub async fn read_to_close(&mut self) -> GateResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut failure = None;
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Data(bytes) => out.extend_from_slice(&bytes),
                StreamEvent::Error(message) => failure = Some(message),
                StreamEvent::End => {}
                StreamEvent::Close => break,
            }
        }
        match failure {
            Some(message) => Err(GateError::Transport(message)),
            None => Ok(out),
        }
    }

    fn push(&self, message: Message) -> GateResult<()> {
        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_| GateError::Closed)
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").field("id", &self.id).finish()
    }
}
