//! mailgate-client: Rust client library for the mailgate tunnel protocol.
//!
//! Connects to a gateway over WebSocket and opens any number of TCP tunnels
//! through the single session.
//!
//! # Quick Start
//!
//! ```no_run
//! use mailgate_client::{StreamEvent, TunnelClient};
//!
//! # async fn example() -> mailgate_client::GateResult<()> {
//! let client = TunnelClient::connect("ws://127.0.0.1:8585").await?;
//!
//! let mut smtp = client.open("smtp.example.com", 25).await?;
//! smtp.send(b"EHLO localhost\r\n".to_vec())?;
//!
//! while let Some(event) = smtp.next_event().await {
//!     match event {
//!         StreamEvent::Data(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
//!         StreamEvent::Close => break,
//!         _ => {}
//!     }
//! }
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod stream;

pub use client::TunnelClient;
pub use stream::{StreamEvent, TunnelStream};

pub use mailgate_core::{GateError, GateResult, StreamId, WireFormat};
