//! TCP listener for incoming database connections

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::gateway::Gateway;
use crate::error::Result;
use crate::protocol::DatabaseProtocol;

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections rejected due to limit
    pub connections_rejected: AtomicU64,
}

/// Accepts connections for one protocol on one port
pub struct Listener {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    protocol: DatabaseProtocol,
    stats: Arc<ListenerStats>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Listener {
    /// Bind `listen_address:port` for `protocol`. Port 0 picks a free port.
    pub async fn bind(
        gateway: Arc<Gateway>,
        protocol: DatabaseProtocol,
        port: u16,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", gateway.config().server.listen_address, port);
        let listener = TcpListener::bind(&addr).await?;

        let max_connections = gateway.config().server.max_connections;
        if max_connections > 0 {
            info!(
                "Listening for {} on {} (max {} connections)",
                protocol,
                listener.local_addr()?,
                max_connections
            );
        } else {
            info!(
                "Listening for {} on {} (unlimited connections)",
                protocol,
                listener.local_addr()?
            );
        }

        Ok(Self {
            listener,
            gateway,
            protocol,
            stats: Arc::new(ListenerStats::default()),
            shutdown_rx,
        })
    }

    /// Get listener statistics
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Get the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown.
    ///
    /// Shutdown only stops accepting; connections already handed off keep
    /// running to completion.
    pub async fn run(mut self) -> Result<()> {
        let semaphore = self.gateway.connection_semaphore();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let permit = if let Some(ref semaphore) = semaphore {
                                match semaphore.clone().try_acquire_owned() {
                                    Ok(permit) => Some(permit),
                                    Err(_) => {
                                        warn!(
                                            "{} connection from {} rejected: max connections ({}) reached",
                                            self.protocol,
                                            addr,
                                            self.gateway.config().server.max_connections
                                        );
                                        self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                        drop(stream);
                                        continue;
                                    }
                                }
                            } else {
                                None
                            };

                            debug!("Accepted {} connection from {}", self.protocol, addr);
                            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let connection_id = self.gateway.next_connection_id();
                            let gateway = Arc::clone(&self.gateway);
                            let stats = Arc::clone(&self.stats);
                            let protocol = self.protocol;

                            tokio::spawn(async move {
                                // Held for the connection's lifetime
                                let _permit = permit;

                                if let Err(e) = gateway.handle_connection(stream, addr, protocol, connection_id).await {
                                    if e.is_peer_disconnect() {
                                        debug!("{} connection from {} closed early: {}", protocol, addr, e);
                                    } else {
                                        warn!("{} connection from {} error: {}", protocol, addr, e);
                                    }
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                debug!("{} connection from {} closed", protocol, addr);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping {} listener", self.protocol);
                    break;
                }
            }
        }

        info!(
            "{} listener stopped. Total: {}, Active: {}, Rejected: {}",
            self.protocol,
            self.stats.connections_accepted.load(Ordering::Relaxed),
            self.stats.connections_active.load(Ordering::Relaxed),
            self.stats.connections_rejected.load(Ordering::Relaxed)
        );

        Ok(())
    }
}
