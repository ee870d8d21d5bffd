//! TCP server front-end.
//!
//! [`CoordinationServer`] accepts connections and runs each through the
//! framed dispatch loop in [`connection`]. Implement [`Handler`] to define
//! how requests are answered; [`CoreHandler`] is the production
//! implementation backed by the replicated log and session manager.

mod connection;
mod handler;

pub use connection::ClientConnection;
pub use handler::{CoreHandler, Handler, RequestContext};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// A coordination TCP server with graceful shutdown support.
pub struct CoordinationServer<H: Handler> {
    listener: TcpListener,
    handler: Arc<H>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    connections_per_ip: Arc<RwLock<HashMap<IpAddr, usize>>>,
    max_connections_per_ip: usize,
    max_total_connections: usize,
}

impl<H: Handler> CoordinationServer<H> {
    /// Bind a server with the given configuration.
    pub async fn new(config: &ServerConfig, handler: H) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join(", ")))?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            addr = %config.bind_addr,
            max_per_ip = config.max_connections_per_ip,
            max_total = config.max_total_connections,
            "Coordination server listening"
        );

        Ok(Self {
            listener,
            handler: Arc::new(handler),
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            connections_per_ip: Arc::new(RwLock::new(HashMap::new())),
            max_connections_per_ip: config.max_connections_per_ip,
            max_total_connections: config.max_total_connections,
        })
    }

    /// The address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| Error::IoError(e.kind()))
    }

    /// A sender that triggers graceful shutdown of the accept loop.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept and serve connections until shutdown.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = self.listener.accept() => {
                    accepted.map_err(|e| Error::IoError(e.kind()))?
                }
                _ = shutdown_rx.recv() => {
                    info!("Server shutting down");
                    return Ok(());
                }
            };

            if self.max_total_connections > 0
                && self.active_connections.load(Ordering::Relaxed) >= self.max_total_connections
            {
                warn!(client = %addr, "Connection limit reached, rejecting");
                continue;
            }

            let ip = addr.ip();
            {
                let mut per_ip = self.connections_per_ip.write().await;
                let count = per_ip.entry(ip).or_insert(0);
                if *count >= self.max_connections_per_ip {
                    warn!(client = %addr, "Per-IP connection limit reached, rejecting");
                    continue;
                }
                *count += 1;
            }
            self.active_connections.fetch_add(1, Ordering::Relaxed);

            let handler = self.handler.clone();
            let active = self.active_connections.clone();
            let per_ip_map = self.connections_per_ip.clone();
            tokio::spawn(async move {
                debug!(client = %addr, "Connection accepted");
                let connection = ClientConnection::new(stream, addr);
                if let Err(e) = connection.handle_requests(handler).await {
                    debug!(client = %addr, error = %e, "Connection closed with error");
                }

                active.fetch_sub(1, Ordering::Relaxed);
                let mut per_ip = per_ip_map.write().await;
                if let Some(count) = per_ip.get_mut(&ip) {
                    *count -= 1;
                    if *count == 0 {
                        per_ip.remove(&ip);
                    }
                }
            });
        }
    }
}
