//! Client-facing transports.

pub mod websocket;

pub use websocket::{Frame, WebSocketConnection};
