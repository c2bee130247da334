//! Stream multiplexer: the set of live streams of one session.
//!
//! The multiplexer is owned by its session task and only ever touched
//! through `&mut self`, so the stream map needs no lock. Bridges report back
//! through the session's event channel; [`StreamMultiplexer::handle_event`]
//! turns those reports into protocol messages.

use super::bridge::TcpBridge;
use super::{BridgeCommand, EventKind, StreamEvent};
use mailgate_core::{GateError, GateResult, Message, StreamId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of a registered stream. Closed streams are removed from the
/// map, so there is no closed variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// TCP connect in flight; the client has not been given the id yet.
    Connecting,
    /// Connected and relaying.
    Open,
}

/// Bookkeeping for one stream.
struct StreamHandle {
    /// The client's `open` request, echoed in `opened` or a connect `error`.
    request_id: u32,
    host: String,
    port: u16,
    state: StreamState,
    /// Client → bridge commands. Dropping it ends the bridge.
    commands: mpsc::UnboundedSender<BridgeCommand>,
    /// The bridge task; aborting it closes the socket.
    task: JoinHandle<()>,
}

/// Owns every [`TcpBridge`] of one session, keyed by stream id.
pub struct StreamMultiplexer {
    session_id: String,
    /// Next id to hand out. Starts at 1 and only grows; `None` once the
    /// id space is used up.
    next_id: Option<StreamId>,
    streams: HashMap<StreamId, StreamHandle>,
    /// Cloned into every bridge.
    events: mpsc::Sender<StreamEvent>,
    read_buffer_size: usize,
}

impl StreamMultiplexer {
    /// Create an empty multiplexer whose bridges report on `events`.
    pub fn new(
        session_id: impl Into<String>,
        events: mpsc::Sender<StreamEvent>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            next_id: Some(1),
            streams: HashMap::new(),
            events,
            read_buffer_size,
        }
    }

    /// Allocate an id and start connecting to `host:port`.
    ///
    /// Returns immediately. The client learns the id from the `opened`
    /// message produced once the bridge reports `Connected`; on failure it
    /// gets `error` (with `request_id`) and `close` instead.
    ///
    /// Fails without connecting once every stream id has been handed out.
    pub fn open_stream(
        &mut self,
        request_id: u32,
        host: &str,
        port: u16,
    ) -> GateResult<StreamId> {
        let Some(stream_id) = self.allocate_id() else {
            warn!(
                session_id = %self.session_id,
                request_id,
                "stream ids exhausted, open refused"
            );
            return Err(GateError::Connect("stream ids exhausted".into()));
        };

        debug!(
            session_id = %self.session_id,
            stream_id,
            host = %host,
            port,
            "open request"
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = TcpBridge::new(
            stream_id,
            host,
            port,
            self.events.clone(),
            self.read_buffer_size,
        )
        .spawn(command_rx);

        self.streams.insert(
            stream_id,
            StreamHandle {
                request_id,
                host: host.to_string(),
                port,
                state: StreamState::Connecting,
                commands,
                task,
            },
        );

        Ok(stream_id)
    }

    /// Deliver a client command to a stream.
    ///
    /// Unknown or already-closed ids are ignored: the client may still be
    /// sending when our `close` is in flight.
    pub fn route(&mut self, stream_id: StreamId, command: BridgeCommand) {
        let Some(handle) = self.streams.get(&stream_id) else {
            debug!(
                session_id = %self.session_id,
                stream_id,
                "command for unknown stream ignored"
            );
            return;
        };

        if handle.commands.send(command).is_err() {
            debug!(
                session_id = %self.session_id,
                stream_id,
                "bridge already finished, command dropped"
            );
        }
    }

    /// Translate a bridge event into the message for the client.
    ///
    /// `Closed` removes the stream. Events from streams that are no longer
    /// registered (torn down by [`close_all`](Self::close_all)) yield `None`.
    pub fn handle_event(&mut self, event: StreamEvent) -> Option<Message> {
        let StreamEvent { stream_id, kind } = event;
        let Some(handle) = self.streams.get_mut(&stream_id) else {
            debug!(
                session_id = %self.session_id,
                stream_id,
                "event for unregistered stream discarded"
            );
            return None;
        };

        let message = match kind {
            EventKind::Connected => {
                handle.state = StreamState::Open;
                Message::Opened {
                    request_id: handle.request_id,
                    stream_id,
                }
            }
            EventKind::Data(data) => Message::Data {
                stream_id,
                data,
                ack: None,
            },
            EventKind::Ack(ack) => Message::Ack { stream_id, ack },
            EventKind::Error(message) => {
                debug!(
                    session_id = %self.session_id,
                    stream_id,
                    host = %handle.host,
                    port = handle.port,
                    error = %message,
                    "stream error"
                );
                let request_id = match handle.state {
                    StreamState::Connecting => Some(handle.request_id),
                    StreamState::Open => None,
                };
                Message::Error {
                    stream_id,
                    message,
                    request_id,
                }
            }
            EventKind::End => Message::End { stream_id },
            EventKind::Closed => {
                self.streams.remove(&stream_id);
                Message::Close { stream_id }
            }
        };

        Some(message)
    }

    /// Tear down every stream. Safe to call more than once.
    pub fn close_all(&mut self) {
        if self.streams.is_empty() {
            return;
        }
        debug!(
            session_id = %self.session_id,
            count = self.streams.len(),
            "closing all streams"
        );
        for (_, handle) in self.streams.drain() {
            handle.task.abort();
        }
    }

    /// State of a registered stream, or `None` once it is closed.
    pub fn state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get(&stream_id).map(|h| h.state)
    }

    /// Number of registered (connecting or open) streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn exhaust_ids(&mut self) {
        self.next_id = None;
    }

    fn allocate_id(&mut self) -> Option<StreamId> {
        let id = self.next_id?;
        self.next_id = id.checked_add(1);
        Some(id)
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn mux() -> (StreamMultiplexer, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (StreamMultiplexer::new("test-session", tx, 1024), rx)
    }

    /// Pump bridge events through the multiplexer until `pred` matches a
    /// produced message, returning every message seen on the way.
    async fn pump_until(
        mux: &mut StreamMultiplexer,
        rx: &mut mpsc::Receiver<StreamEvent>,
        pred: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if let Some(msg) = mux.handle_event(event) {
                let done = pred(&msg);
                seen.push(msg);
                if done {
                    return seen;
                }
            }
        }
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn ids_start_at_one_and_count_failed_opens() {
        let (mut mux, mut rx) = mux();
        let port = refused_port().await;

        assert_eq!(mux.open_stream(10, "127.0.0.1", port).unwrap(), 1);
        assert_eq!(mux.open_stream(11, "127.0.0.1", port).unwrap(), 2);

        // Let both fail and be removed; the counter must not rewind.
        let mut closed = 0;
        while closed < 2 {
            let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Close { .. })).await;
            closed += msgs.iter().filter(|m| matches!(m, Message::Close { .. })).count();
        }
        assert!(mux.is_empty());
        assert_eq!(mux.open_stream(12, "127.0.0.1", port).unwrap(), 3);
    }

    #[tokio::test]
    async fn refused_connect_yields_error_with_request_id_then_close() {
        let (mut mux, mut rx) = mux();
        let port = refused_port().await;

        let id = mux.open_stream(42, "127.0.0.1", port).unwrap();
        assert_eq!(mux.state(id), Some(StreamState::Connecting));

        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Close { .. })).await;
        assert_eq!(msgs.len(), 2, "got {msgs:?}");
        match &msgs[0] {
            Message::Error {
                stream_id,
                request_id,
                ..
            } => {
                assert_eq!(*stream_id, id);
                assert_eq!(*request_id, Some(42));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(msgs[1], Message::Close { stream_id: id });
        assert_eq!(mux.state(id), None);
    }

    #[tokio::test]
    async fn routes_data_only_to_its_own_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, mut rx) = mux();

        let first = mux.open_stream(1, "127.0.0.1", port).unwrap();
        let (mut sock_a, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Opened { .. })).await;

        let second = mux.open_stream(2, "127.0.0.1", port).unwrap();
        let (mut sock_b, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Opened { .. })).await;
        assert_ne!(first, second);

        mux.route(
            second,
            BridgeCommand::Write {
                data: b"to-b".to_vec(),
                ack: None,
            },
        );
        mux.route(first, BridgeCommand::End);

        // The first connection only sees the half-close.
        let mut got_a = Vec::new();
        timeout(WAIT, sock_a.read_to_end(&mut got_a)).await.unwrap().unwrap();
        assert!(got_a.is_empty());

        let mut got_b = [0u8; 4];
        timeout(WAIT, sock_b.read_exact(&mut got_b)).await.unwrap().unwrap();
        assert_eq!(&got_b, b"to-b");
    }

    #[tokio::test]
    async fn opened_reply_echoes_request_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, mut rx) = mux();

        let id = mux.open_stream(77, "127.0.0.1", port).unwrap();
        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Opened { .. })).await;
        assert_eq!(
            msgs.last(),
            Some(&Message::Opened {
                request_id: 77,
                stream_id: id
            })
        );
        assert_eq!(mux.state(id), Some(StreamState::Open));
        drop(listener);
    }

    #[tokio::test]
    async fn commands_for_closed_stream_are_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, mut rx) = mux();

        let id = mux.open_stream(1, "127.0.0.1", port).unwrap();
        let (sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        drop(sock);

        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Close { .. })).await;
        assert!(msgs.contains(&Message::End { stream_id: id }));
        assert!(mux.is_empty());

        // Late traffic for the closed id and for an id never handed out.
        mux.route(
            id,
            BridgeCommand::Write {
                data: b"late".to_vec(),
                ack: Some(1),
            },
        );
        mux.route(id, BridgeCommand::End);
        mux.route(999, BridgeCommand::End);
        assert!(mux.is_empty());
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "no events expected for a closed stream"
        );
    }

    #[tokio::test]
    async fn close_all_closes_every_socket_and_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, mut rx) = mux();

        let mut peers: Vec<TcpStream> = Vec::new();
        for request_id in 0..3 {
            mux.open_stream(request_id, "127.0.0.1", port).unwrap();
            let (sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            peers.push(sock);
            pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Opened { .. })).await;
        }
        assert_eq!(mux.len(), 3);

        mux.close_all();
        mux.close_all();
        assert!(mux.is_empty());

        for sock in &mut peers {
            let mut buf = [0u8; 8];
            let n = timeout(WAIT, sock.read(&mut buf)).await.unwrap().unwrap_or(0);
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn events_after_close_all_are_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, _rx) = mux();

        let id = mux.open_stream(1, "127.0.0.1", port).unwrap();
        mux.close_all();
        let stale = StreamEvent {
            stream_id: id,
            kind: EventKind::Data(b"stale".to_vec()),
        };
        assert_eq!(mux.handle_event(stale), None);
        drop(listener);
    }

    #[tokio::test]
    async fn data_and_ack_are_tagged_with_stream_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, mut rx) = mux();

        let id = mux.open_stream(1, "127.0.0.1", port).unwrap();
        let (mut sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Opened { .. })).await;

        mux.route(
            id,
            BridgeCommand::Write {
                data: b"x".to_vec(),
                ack: Some(3),
            },
        );
        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Ack { .. })).await;
        assert_eq!(msgs.last(), Some(&Message::Ack { stream_id: id, ack: 3 }));

        sock.write_all(b"y").await.unwrap();
        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Data { .. })).await;
        assert_eq!(
            msgs.last(),
            Some(&Message::Data {
                stream_id: id,
                data: b"y".to_vec(),
                ack: None
            })
        );
    }

    #[tokio::test]
    async fn reset_on_open_stream_yields_error_without_request_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut mux, mut rx) = mux();

        let id = mux.open_stream(5, "127.0.0.1", port).unwrap();
        let (sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Opened { .. })).await;
        assert_eq!(
            msgs.last(),
            Some(&Message::Opened {
                request_id: 5,
                stream_id: id
            })
        );

        // Zero linger turns the close into a RST.
        #[allow(deprecated)]
        let linger = sock.set_linger(Some(Duration::ZERO));
        linger.unwrap();
        drop(sock);

        let msgs = pump_until(&mut mux, &mut rx, |m| matches!(m, Message::Close { .. })).await;
        assert_eq!(msgs.len(), 2, "got {msgs:?}");
        match &msgs[0] {
            Message::Error {
                stream_id,
                request_id,
                message,
            } => {
                assert_eq!(*stream_id, id);
                assert_eq!(*request_id, None);
                assert!(!message.is_empty());
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(msgs[1], Message::Close { stream_id: id });
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn exhausted_id_space_refuses_opens_without_reuse() {
        let port = refused_port().await;
        let (mut mux, _rx) = mux();
        mux.next_id = Some(StreamId::MAX);

        let last = mux.open_stream(1, "127.0.0.1", port).unwrap();
        assert_eq!(last, StreamId::MAX);

        let err = mux.open_stream(2, "127.0.0.1", port).unwrap_err();
        assert!(matches!(err, GateError::Connect(_)), "got {err:?}");
        assert!(mux.open_stream(3, "127.0.0.1", port).is_err());

        assert_eq!(mux.len(), 1);
        assert_eq!(mux.state(last), Some(StreamState::Connecting));
    }
}
