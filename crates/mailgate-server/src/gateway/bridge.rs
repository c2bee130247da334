//! TCP bridge: one outbound TCP connection per stream.
//!
//! The bridge runs as a spawned task. It connects to the destination, then
//! pumps bytes in both directions until either side is done:
//!
//! - **Destination → client**: socket reads become [`EventKind::Data`]; EOF
//!   becomes [`EventKind::End`] and tears the connection down.
//! - **Client → destination**: [`BridgeCommand::Write`] is written in order
//!   and acknowledged with [`EventKind::Ack`] when it carried a token;
//!   [`BridgeCommand::End`] shuts down the write side.
//!
//! Every bridge finishes with exactly one [`EventKind::Closed`], including
//! when the connect itself fails. Dropping or aborting the task closes the
//! socket.

use super::{BridgeCommand, EventKind, StreamEvent};
use mailgate_core::StreamId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default socket read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Owns the outbound TCP connection of a single stream.
pub struct TcpBridge {
    stream_id: StreamId,
    host: String,
    port: u16,
    read_buffer_size: usize,
    /// Session-wide event channel shared by all bridges of the session.
    events: mpsc::Sender<StreamEvent>,
}

impl TcpBridge {
    /// Create a bridge for `host:port`. Nothing happens until [`spawn`](Self::spawn).
    pub fn new(
        stream_id: StreamId,
        host: impl Into<String>,
        port: u16,
        events: mpsc::Sender<StreamEvent>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            stream_id,
            host: host.into(),
            port,
            read_buffer_size: read_buffer_size.max(1),
            events,
        }
    }

    /// Start connecting in the background and return the task handle.
    ///
    /// Completion of the connect is reported through the event channel, so
    /// the caller never waits on the network.
    pub fn spawn(self, commands: mpsc::UnboundedReceiver<BridgeCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    /// Connect, relay until the connection ends, then report `Closed`.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<BridgeCommand>) {
        let stream = match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    stream_id = self.stream_id,
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "TCP connect failed"
                );
                self.emit(EventKind::Error(e.to_string())).await;
                self.emit(EventKind::Closed).await;
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(stream_id = self.stream_id, error = %e, "could not set TCP_NODELAY");
        }

        debug!(
            stream_id = self.stream_id,
            host = %self.host,
            port = self.port,
            "opened TCP connection"
        );

        if self.emit(EventKind::Connected).await {
            self.relay(stream, &mut commands).await;
        }

        commands.close();
        let mut dropped = 0usize;
        while let Ok(command) = commands.try_recv() {
            if matches!(command, BridgeCommand::Write { .. }) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(stream_id = self.stream_id, dropped, "dropped writes after close");
        }

        debug!(
            stream_id = self.stream_id,
            host = %self.host,
            port = self.port,
            "closed TCP connection"
        );
        self.emit(EventKind::Closed).await;
    }

    /// Pump both directions until the destination finishes, an error occurs,
    /// or the session drops its command sender.
    async fn relay(
        &self,
        stream: TcpStream,
        commands: &mut mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let reader = self.pump_reads(read_half);
        let writer = self.pump_writes(write_half, commands);
        tokio::pin!(reader, writer);

        // Whichever side finishes first ends the stream; dropping the other
        // future drops its socket half.
        tokio::select! {
            _ = &mut reader => {}
            _ = &mut writer => {}
        }
    }

    /// Destination → client.
    async fn pump_reads(&self, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!(stream_id = self.stream_id, "destination ended its side");
                    self.emit(EventKind::End).await;
                    return;
                }
                Ok(n) => {
                    trace!(
                        stream_id = self.stream_id,
                        bytes = n,
                        host = %self.host,
                        port = self.port,
                        "received bytes from destination"
                    );
                    if !self.emit(EventKind::Data(buf[..n].to_vec())).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(stream_id = self.stream_id, error = %e, "TCP read error");
                    self.emit(EventKind::Error(e.to_string())).await;
                    return;
                }
            }
        }
    }

    /// Client → destination. Returns when the command channel closes or a
    /// write fails; after a half-close it keeps draining and discarding
    /// writes so the reader can run to EOF.
    async fn pump_writes(
        &self,
        mut write_half: OwnedWriteHalf,
        commands: &mut mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        let mut write_open = true;

        while let Some(command) = commands.recv().await {
            match command {
                BridgeCommand::Write { data, ack } => {
                    if !write_open {
                        debug!(
                            stream_id = self.stream_id,
                            bytes = data.len(),
                            "write after half-close dropped"
                        );
                        continue;
                    }
                    if !data.is_empty() {
                        trace!(
                            stream_id = self.stream_id,
                            bytes = data.len(),
                            host = %self.host,
                            port = self.port,
                            "sending bytes to destination"
                        );
                        if let Err(e) = write_half.write_all(&data).await {
                            debug!(stream_id = self.stream_id, error = %e, "TCP write error");
                            self.emit(EventKind::Error(e.to_string())).await;
                            return;
                        }
                    }
                    if let Some(ack) = ack {
                        self.emit(EventKind::Ack(ack)).await;
                    }
                }
                BridgeCommand::End => {
                    if !write_open {
                        continue;
                    }
                    debug!(
                        stream_id = self.stream_id,
                        host = %self.host,
                        port = self.port,
                        "received request to close connection"
                    );
                    write_open = false;
                    if let Err(e) = write_half.shutdown().await {
                        debug!(stream_id = self.stream_id, error = %e, "TCP shutdown error");
                        self.emit(EventKind::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        }

        debug!(stream_id = self.stream_id, "command channel closed, ending bridge");
    }

    /// Push an event to the session. Returns `false` once the session is gone.
    async fn emit(&self, kind: EventKind) -> bool {
        let event = StreamEvent {
            stream_id: self.stream_id,
            kind,
        };
        self.events.send(event).await.is_ok()
    }
}
