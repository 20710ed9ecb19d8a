//! Static control plane.
//!
//! Serves tokens listed in the configuration file and keeps lifecycle
//! events in process. Useful for:
//!
//! - Development and testing
//! - Standalone deployment without a management API

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{ControlPlane, TokenGrant};
use crate::config::{StaticTokenConfig, StorageConfig};
use crate::error::{ProxyError, Result};
use crate::session::{Session, SessionLifecycle};

/// Lifecycle events seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleCounts {
    pub created: u64,
    pub connected: u64,
    pub failed: u64,
    pub disconnected: u64,
}

/// Control plane backed by a fixed token table.
///
/// # Example
///
/// ```ignore
/// let plane = StaticControlPlane::from_config(&tokens, StorageConfig::Null);
/// let grant = plane.resolve_token("tok-123").await?;
/// ```
pub struct StaticControlPlane {
    tokens: HashMap<String, TokenGrant>,
    storage: StorageConfig,
    created: AtomicU64,
    connected: AtomicU64,
    failed: AtomicU64,
    disconnected: AtomicU64,
}

impl StaticControlPlane {
    /// Build from the `control_plane.tokens` list.
    ///
    /// Labels missing from an entry fall back to the backend account for
    /// `user` and to `host:port` for `asset`.
    pub fn from_config(tokens: &[StaticTokenConfig], storage: StorageConfig) -> Self {
        let tokens = tokens
            .iter()
            .map(|t| {
                let grant = TokenGrant {
                    username: t.username.clone(),
                    secret: Zeroizing::new(t.secret.clone()),
                    password: Zeroizing::new(t.password.clone()),
                    host: t.host.clone(),
                    port: t.port,
                    database: t.database.clone(),
                    permitted: t.permitted,
                    user: t.user.clone().unwrap_or_else(|| t.username.clone()),
                    user_id: String::new(),
                    asset: t
                        .asset
                        .clone()
                        .unwrap_or_else(|| format!("{}:{}", t.host, t.port)),
                    org_id: t.org_id.clone().unwrap_or_default(),
                };
                (t.token.clone(), grant)
            })
            .collect();

        Self {
            tokens,
            storage,
            created: AtomicU64::new(0),
            connected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
        }
    }

    pub fn counts(&self) -> LifecycleCounts {
        LifecycleCounts {
            created: self.created.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SessionLifecycle for StaticControlPlane {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(
            "Session {} created: user={} asset={} account={} protocol={} from {}",
            session.id,
            session.user,
            session.asset,
            session.system_user,
            session.protocol,
            session.remote_addr
        );
        Ok(())
    }

    async fn mark_connected(&self, session_id: Uuid) -> Result<()> {
        self.connected.fetch_add(1, Ordering::Relaxed);
        debug!("Session {} connected", session_id);
        Ok(())
    }

    async fn mark_failed(&self, session_id: Uuid, reason: &str) -> Result<()> {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!("Session {} failed: {}", session_id, reason);
        Ok(())
    }

    async fn mark_disconnected(&self, session_id: Uuid) -> Result<()> {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
        info!("Session {} disconnected", session_id);
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for StaticControlPlane {
    async fn resolve_token(&self, token: &str) -> Result<TokenGrant> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| ProxyError::Auth("unknown token".into()))
    }

    async fn audit_storage_config(&self) -> Result<StorageConfig> {
        Ok(self.storage.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
