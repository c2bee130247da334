//! mailgate-server: TCP tunnel gateway.
//!
//! Accepts one WebSocket session per client and, inside each session,
//! multiplexes any number of outbound TCP connections opened on demand. A
//! supervisor mode keeps a single worker process alive across crashes.

pub mod config;
pub mod gateway;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::{CliOverrides, GatewayConfig, ServerConfig};
pub use server::GatewayServer;
pub use supervisor::{ProcessSupervisor, WorkerCommand};
