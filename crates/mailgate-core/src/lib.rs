//! mailgate-core: Shared protocol library for the mailgate TCP tunnel.
//!
//! Provides the tunnel message types, the CBOR/JSON codec used on the
//! WebSocket transport, and the common error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, WireFormat};
pub use error::{GateError, GateResult};
pub use messages::{Message, StreamId};
