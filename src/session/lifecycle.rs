//! Session lifecycle reporting
//!
//! The [`SessionLifecycle`] trait is implemented by every control plane.
//! [`SessionTracker`] sits in front of it so that each transition reaches
//! the collaborator at most once per session, however many teardown paths
//! race to report it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::Session;
use crate::error::{ProxyError, Result};

/// Receiver of session lifecycle transitions.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// connection task.
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    /// A session reached Ready and is about to relay.
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// The relay for this session has started.
    async fn mark_connected(&self, session_id: Uuid) -> Result<()>;

    /// The session ended because of a fault.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The session that failed
    /// * `reason` - Human readable cause, suitable for an audit trail
    async fn mark_failed(&self, session_id: Uuid, reason: &str) -> Result<()>;

    /// The session is gone. Reported exactly once per created session.
    async fn mark_disconnected(&self, session_id: Uuid) -> Result<()>;
}

/// Once-only lifecycle reporting for one session.
pub struct SessionTracker {
    session: Session,
    lifecycle: Arc<dyn SessionLifecycle>,
    create_attempted: AtomicBool,
    created: AtomicBool,
    connected: AtomicBool,
    failed: AtomicBool,
    disconnected: AtomicBool,
}

impl SessionTracker {
    pub fn new(session: Session, lifecycle: Arc<dyn SessionLifecycle>) -> Self {
        Self {
            session,
            lifecycle,
            create_attempted: AtomicBool::new(false),
            created: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    /// Whether `create()` reached the collaborator successfully.
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    /// Report the new session. Later calls are no-ops.
    pub async fn create(&self) -> Result<()> {
        if self.create_attempted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.lifecycle.create_session(&self.session).await {
            Ok(()) => {
                self.created.store(true, Ordering::Release);
                debug!("Session {} created", self.session.id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to create session {}: {}", self.session.id, e);
                Err(e)
            }
        }
    }

    pub async fn connected(&self) -> Result<()> {
        if !self.is_created() || self.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.lifecycle
            .mark_connected(self.session.id)
            .await
            .inspect_err(|e| warn!("Failed to mark session {} connected: {}", self.session.id, e))
    }

    /// Report a fault before the relay started. No-op once connected.
    pub async fn failed(&self, error: &ProxyError) -> Result<()> {
        if !self.is_created()
            || self.connected.load(Ordering::Acquire)
            || self.failed.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        self.lifecycle
            .mark_failed(self.session.id, &error.to_string())
            .await
            .inspect_err(|e| warn!("Failed to mark session {} failed: {}", self.session.id, e))
    }

    /// Report the end of the session. No-op unless `create()` succeeded.
    pub async fn disconnected(&self) -> Result<()> {
        if !self.is_created() || self.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Session {} disconnected", self.session.id);
        self.lifecycle
            .mark_disconnected(self.session.id)
            .await
            .inspect_err(|e| {
                warn!(
                    "Failed to mark session {} disconnected: {}",
                    self.session.id, e
                )
            })
    }
}
