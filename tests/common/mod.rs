//! Shared fixtures for the end-to-end gateway tests
//!
//! Each test runs a real [`Listener`] on an ephemeral port, a recording
//! control plane and an in-memory audit store, and talks to a scripted
//! fake backend instead of a real database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;
use zeroize::Zeroizing;

use tokendb_gateway::config::{load_config_from_str, StorageConfig};
use tokendb_gateway::{
    AuditStorage, Command, ControlPlane, DatabaseProtocol, Gateway, Listener, ProxyError,
    ReplayChunk, Result, Session, SessionLifecycle, TokenGrant,
};

/// Default test timeout
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A lifecycle transition seen by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(Uuid),
    Connected(Uuid),
    Failed(Uuid),
    Disconnected(Uuid),
}

/// Control plane with a fixed token table that records every lifecycle call
#[derive(Default)]
pub struct RecordingControlPlane {
    grants: HashMap<String, TokenGrant>,
    pub events: Mutex<Vec<Event>>,
}

impl RecordingControlPlane {
    pub fn with_grant(mut self, token: &str, grant: TokenGrant) -> Self {
        self.grants.insert(token.to_string(), grant);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| wanted(e)).count()
    }
}

#[async_trait]
impl SessionLifecycle for RecordingControlPlane {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.events.lock().unwrap().push(Event::Created(session.id));
        Ok(())
    }

    async fn mark_connected(&self, session_id: Uuid) -> Result<()> {
        self.events.lock().unwrap().push(Event::Connected(session_id));
        Ok(())
    }

    async fn mark_failed(&self, session_id: Uuid, _reason: &str) -> Result<()> {
        self.events.lock().unwrap().push(Event::Failed(session_id));
        Ok(())
    }

    async fn mark_disconnected(&self, session_id: Uuid) -> Result<()> {
        self.events.lock().unwrap().push(Event::Disconnected(session_id));
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn resolve_token(&self, token: &str) -> Result<TokenGrant> {
        self.grants
            .get(token)
            .cloned()
            .ok_or_else(|| ProxyError::Auth(format!("unknown token '{}'", token)))
    }

    async fn audit_storage_config(&self) -> Result<StorageConfig> {
        Ok(StorageConfig::Null)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Audit storage that keeps everything in memory
#[derive(Default)]
pub struct MemoryStorage {
    pub commands: Mutex<Vec<Command>>,
    pub replay: Mutex<Vec<(Uuid, ReplayChunk)>>,
    pub finalized: Mutex<Vec<Uuid>>,
}

impl MemoryStorage {
    pub fn inputs(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.input.clone())
            .collect()
    }

    pub fn finalized(&self) -> Vec<Uuid> {
        self.finalized.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn upload_commands(&self, commands: &[Command]) -> Result<()> {
        self.commands.lock().unwrap().extend_from_slice(commands);
        Ok(())
    }

    async fn append_replay(&self, session_id: Uuid, chunk: &ReplayChunk) -> Result<()> {
        self.replay.lock().unwrap().push((session_id, chunk.clone()));
        Ok(())
    }

    async fn finalize_replay(&self, session_id: Uuid) -> Result<()> {
        self.finalized.lock().unwrap().push(session_id);
        Ok(())
    }
}

/// Grant pointing at a fake backend on `port`
pub fn grant(secret: &str, username: &str, password: &str, port: u16) -> TokenGrant {
    TokenGrant {
        username: username.to_string(),
        secret: Zeroizing::new(secret.to_string()),
        password: Zeroizing::new(password.to_string()),
        host: "127.0.0.1".to_string(),
        port,
        database: None,
        permitted: true,
        user: "alice".to_string(),
        user_id: "u-1".to_string(),
        asset: "test-db".to_string(),
        org_id: "org-1".to_string(),
    }
}

/// A running gateway listener for one protocol
pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Start a listener on an ephemeral port.
///
/// The configured ports only satisfy validation; the listener binds port 0.
pub async fn start_gateway(
    protocol: DatabaseProtocol,
    plane: Arc<RecordingControlPlane>,
    storage: Arc<MemoryStorage>,
) -> TestGateway {
    let yaml = r#"
server:
  listen_address: "127.0.0.1"
  mysql_port: 13306
  postgres_port: 15432
  connect_timeout_secs: 5
  handshake_timeout_secs: 5
control_plane:
  type: static
audit:
  flush_interval_ms: 20
logging:
  level: "debug"
"#;
    let config = load_config_from_str(yaml).expect("test config must load");
    let gateway = Arc::new(Gateway::new(Arc::new(config), plane, storage));

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let listener = Listener::bind(Arc::clone(&gateway), protocol, 0, shutdown_rx)
        .await
        .expect("listener must bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.run().await;
    });

    TestGateway {
        gateway,
        addr,
        shutdown_tx,
    }
}

/// Poll `check` until it holds or [`TEST_TIMEOUT`] passes.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
