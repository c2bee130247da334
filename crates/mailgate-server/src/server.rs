//! Core server: accepts WebSocket connections and runs one session each.
//!
//! Owns the listener and the shutdown broadcast. Sessions share nothing with
//! each other; the server only spawns them and, on shutdown, tells them to
//! close and waits until they have released their streams.

use crate::config::{GatewayConfig, ServerConfig};
use crate::session;
use crate::transport::websocket::{self, WebSocketConnection};
use mailgate_core::GateResult;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The gateway server instance, bound and ready to accept.
pub struct GatewayServer {
    /// Per-session tuning shared by all sessions.
    gateway: Arc<GatewayConfig>,
    /// Accepted, handshaken WebSocket connections.
    connections: mpsc::Receiver<WebSocketConnection>,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    /// Bind the listener described by `config`.
    pub async fn bind(config: &ServerConfig) -> GateResult<Self> {
        let (local_addr, connections) = websocket::start_listener(config.listen_addr()).await?;
        Ok(Self {
            gateway: Arc::new(config.gateway.clone()),
            connections,
            local_addr,
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept sessions until `shutdown` resolves, then close every session.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> GateResult<()> {
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        info!(addr = %self.local_addr, pid = std::process::id(), "worker ready");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }

                conn = self.connections.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let gateway = self.gateway.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    sessions.spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = session::run_session(conn, &gateway, shutdown_rx).await {
                            warn!(remote = %remote, error = %e, "session error");
                        }
                    });
                }

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "session task failed");
                    }
                }
            }
        }

        info!(sessions = sessions.len(), "worker terminating");
        let _ = self.shutdown_tx.send(());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                debug!(error = %e, "session task failed during shutdown");
            }
        }

        Ok(())
    }
}
