//! Control plane abstraction
//!
//! The control plane is the authority the gateway asks two questions:
//! what does this token grant, and where does audit data go. It also
//! receives the session lifecycle stream.
//!
//! # Implementations
//!
//! - [`StaticControlPlane`] - tokens from the YAML config, for development and tests
//! - [`HttpControlPlane`] - a remote management API over JSON
//!
//! Use [`build_control_plane`] to pick one from the configuration.

mod http;
mod static_plane;

pub use http::HttpControlPlane;
pub use static_plane::{LifecycleCounts, StaticControlPlane};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{Config, ControlPlaneConfig, StorageConfig};
use crate::error::Result;
use crate::session::{Session, SessionLifecycle};

/// What a token resolves to.
///
/// Carries both the proof material for the client (`secret`) and the real
/// backend credentials (`username`, `password`). Neither secret is ever
/// printed by `Debug`.
#[derive(Clone, Default)]
pub struct TokenGrant {
    /// Backend account
    pub username: String,
    /// Secret the client must prove knowledge of
    pub secret: Zeroizing<String>,
    /// Backend password
    pub password: Zeroizing<String>,
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    /// Whether the token holder may connect at all
    pub permitted: bool,
    pub user: String,
    pub user_id: String,
    pub asset: String,
    pub org_id: String,
}

impl TokenGrant {
    /// `host:port` of the backend
    pub fn backend_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("permitted", &self.permitted)
            .field("user", &self.user)
            .field("asset", &self.asset)
            .finish()
    }
}

/// Work the control plane pushes back on a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum ControlTask {
    /// Terminate a live session
    KillSession(Uuid),
}

/// Token resolution, audit configuration and session lifecycle sink.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the gateway shares one instance
/// across all connection tasks behind an `Arc<dyn ControlPlane>`.
///
/// # Example
///
/// ```ignore
/// let grant = control_plane.resolve_token(token).await?;
/// if !grant.permitted {
///     return Err(ProxyError::Auth("not permitted".into()));
/// }
/// ```
#[async_trait]
pub trait ControlPlane: SessionLifecycle {
    /// Resolve a client-presented token.
    ///
    /// # Returns
    ///
    /// * `Ok(TokenGrant)` - The token is known; `permitted` carries the verdict
    /// * `Err(ProxyError::Auth)` - The token is unknown
    /// * `Err(ProxyError::ControlPlane)` - The control plane could not answer
    async fn resolve_token(&self, token: &str) -> Result<TokenGrant>;

    /// Where audit data for new sessions should be stored.
    async fn audit_storage_config(&self) -> Result<StorageConfig>;

    /// Report live sessions and collect pending tasks.
    ///
    /// The default implementation reports nothing and receives no tasks.
    async fn heartbeat(&self, _active: &[Uuid]) -> Result<Vec<ControlTask>> {
        Ok(Vec::new())
    }

    /// Short name for log messages
    fn name(&self) -> &'static str;
}

/// A control plane viewed only as its lifecycle sink.
pub fn lifecycle_of(plane: Arc<dyn ControlPlane>) -> Arc<dyn SessionLifecycle> {
    Arc::new(PlaneLifecycle(plane))
}

struct PlaneLifecycle(Arc<dyn ControlPlane>);

#[async_trait]
impl SessionLifecycle for PlaneLifecycle {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.0.create_session(session).await
    }

    async fn mark_connected(&self, session_id: Uuid) -> Result<()> {
        self.0.mark_connected(session_id).await
    }

    async fn mark_failed(&self, session_id: Uuid, reason: &str) -> Result<()> {
        self.0.mark_failed(session_id, reason).await
    }

    async fn mark_disconnected(&self, session_id: Uuid) -> Result<()> {
        self.0.mark_disconnected(session_id).await
    }
}

/// Build the control plane selected by the configuration.
pub fn build_control_plane(config: &Config) -> Result<Arc<dyn ControlPlane>> {
    let plane: Arc<dyn ControlPlane> = match &config.control_plane {
        ControlPlaneConfig::Static { tokens } => Arc::new(StaticControlPlane::from_config(
            tokens,
            config.storage.clone(),
        )),
        ControlPlaneConfig::Http(http) => Arc::new(HttpControlPlane::new(http)?),
    };
    info!("Using {} control plane", plane.name());
    Ok(plane)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_is_object_safe() {
        fn _assert_object_safe(_: &dyn ControlPlane) {}
    }

    #[test]
    fn test_control_plane_is_send_sync() {
        fn _assert_send_sync<T: Send + Sync + ?Sized>() {}
        _assert_send_sync::<dyn ControlPlane>();
        _assert_send_sync::<Arc<dyn ControlPlane>>();
    }

    #[test]
    fn test_grant_debug_redacts_secrets() {
        let grant = TokenGrant {
            username: "app".into(),
            secret: Zeroizing::new("client-secret".into()),
            password: Zeroizing::new("backend-password".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", grant);
        assert!(debug.contains("app"));
        assert!(!debug.contains("client-secret"));
        assert!(!debug.contains("backend-password"));
    }

    #[test]
    fn test_control_task_deserialize() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"name":"kill_session","args":"{}"}}"#, id);
        let task: ControlTask = serde_json::from_str(&json).unwrap();
        assert_eq!(task, ControlTask::KillSession(id));
    }

    #[test]
    fn test_backend_address() {
        let grant = TokenGrant {
            host: "db.internal".into(),
            port: 5432,
            ..Default::default()
        };
        assert_eq!(grant.backend_address(), "db.internal:5432");
    }

    #[tokio::test]
    async fn test_build_static_control_plane() {
        let config = crate::config::load_config_from_str(
            r#"
server:
  postgres_port: 5432
control_plane:
  type: static
  tokens:
    - token: tok
      secret: s
      username: app
      password: p
      host: 127.0.0.1
      port: 5433
"#,
        )
        .unwrap();
        let plane = build_control_plane(&config).unwrap();
        assert_eq!(plane.name(), "static");
        assert_eq!(plane.resolve_token("tok").await.unwrap().username, "app");
    }
}
