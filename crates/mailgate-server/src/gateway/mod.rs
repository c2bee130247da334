//! Gateway module: per-session stream multiplexing over outbound TCP.
//!
//! # Submodule Architecture
//!
//! - **[`bridge`]**: The [`TcpBridge`] owns one outbound TCP connection. It
//!   runs as its own task, turns socket activity into [`StreamEvent`]s and
//!   applies [`BridgeCommand`]s (writes, half-close) to the socket.
//!
//! - **[`multiplexer`]**: The [`StreamMultiplexer`] owns every bridge of
//!   one session keyed by stream id. It allocates ids, routes client
//!   commands to the right bridge and converts bridge events into protocol
//!   messages, forgetting a stream the moment it reports `Closed`.
//!
//! # Data Flow
//!
//! ```text
//! client message
//!   → SessionGateway::on_message (session.rs)
//!     → StreamMultiplexer::open_stream / route
//!       → BridgeCommand over the bridge's command channel
//!         → TcpBridge writes / shuts down the socket
//!
//! socket activity
//!   → TcpBridge emits StreamEvent on the session's event channel
//!     → StreamMultiplexer::handle_event
//!       → Message → transport → client
//! ```

pub mod bridge;
pub mod multiplexer;

pub use bridge::TcpBridge;
pub use multiplexer::StreamMultiplexer;

use mailgate_core::StreamId;

/// Something that happened on one stream's TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub kind: EventKind,
}

/// Kinds of bridge events, in the order a healthy stream produces them:
/// `Connected`, any number of `Data`/`Ack`, optionally `End`, then `Closed`.
/// `Error` may appear anywhere before `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The outbound connection is established.
    Connected,
    /// Bytes received from the destination.
    Data(Vec<u8>),
    /// The write carrying this token reached the socket.
    Ack(u32),
    /// Connect or socket error, as a human-readable message.
    Error(String),
    /// The destination closed its write side.
    End,
    /// The connection is gone. Always the last event of a stream.
    Closed,
}

/// Instructions from the session to one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    /// Write bytes to the destination, acknowledging `ack` once written.
    Write { data: Vec<u8>, ack: Option<u32> },
    /// Shut down the write side of the destination connection.
    End,
}
