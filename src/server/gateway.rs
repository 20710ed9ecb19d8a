//! Shared gateway state
//!
//! [`Gateway`] owns every handle a connection task needs. It is built once
//! in `main` (or a test), shared behind an `Arc`, and dropped at shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use super::handlers::{MySqlHandler, PostgresHandler};
use crate::audit::{build_storage, AuditStorage};
use crate::config::Config;
use crate::control_plane::{build_control_plane, ControlPlane};
use crate::error::Result;
use crate::protocol::DatabaseProtocol;
use crate::session::SessionRegistry;

pub struct Gateway {
    config: Arc<Config>,
    control_plane: Arc<dyn ControlPlane>,
    storage: Arc<dyn AuditStorage>,
    registry: Arc<SessionRegistry>,
    next_connection_id: AtomicU64,
    /// Connection limit shared by all listeners (None = unlimited)
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        control_plane: Arc<dyn ControlPlane>,
        storage: Arc<dyn AuditStorage>,
    ) -> Self {
        let connection_semaphore = (config.server.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.server.max_connections)));
        Self {
            config,
            control_plane,
            storage,
            registry: Arc::new(SessionRegistry::new()),
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Build the control plane from the config, then ask it where audit
    /// data goes.
    pub async fn from_config(config: Config) -> Result<Self> {
        let control_plane = build_control_plane(&config)?;
        let storage_config = control_plane.audit_storage_config().await?;
        info!("Audit storage: {:?}", storage_config);
        let storage = build_storage(&storage_config)?;
        Ok(Self::new(Arc::new(config), control_plane, storage))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    pub fn storage(&self) -> &Arc<dyn AuditStorage> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Next connection id; monotonic across all listeners, starting at 1.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection limit shared by all listeners (None = unlimited)
    pub fn connection_semaphore(&self) -> Option<Arc<Semaphore>> {
        self.connection_semaphore.clone()
    }

    /// Serve one accepted client connection to completion.
    ///
    /// `connection_id` comes from [`next_connection_id`](Self::next_connection_id)
    /// at accept time.
    pub async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        protocol: DatabaseProtocol,
        connection_id: u64,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        debug!("[{} #{}] connection from {}", protocol, connection_id, addr);

        match protocol {
            DatabaseProtocol::MySql => {
                MySqlHandler::new(self, stream, addr, connection_id)
                    .handle()
                    .await
            }
            DatabaseProtocol::Postgres => {
                PostgresHandler::new(self, stream, addr, connection_id)
                    .handle()
                    .await
            }
        }
    }
}
