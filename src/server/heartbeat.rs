//! Periodic heartbeat to the control plane
//!
//! Reports the live session ids and applies whatever tasks come back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::control_plane::{ControlPlane, ControlTask};
use crate::session::SessionRegistry;

/// Start the heartbeat loop. It stops when `shutdown_rx` fires.
pub fn spawn_heartbeat(
    control_plane: Arc<dyn ControlPlane>,
    registry: Arc<SessionRegistry>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Heartbeat every {:?} to {} control plane", interval, control_plane.name());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let active = registry.active_ids();
                    match control_plane.heartbeat(&active).await {
                        Ok(tasks) => apply_tasks(&registry, tasks),
                        Err(e) => warn!("Heartbeat failed: {}", e),
                    }
                }
            }
        }
    })
}

/// Carry out tasks returned by a heartbeat.
pub fn apply_tasks(registry: &SessionRegistry, tasks: Vec<ControlTask>) {
    for task in tasks {
        match task {
            ControlTask::KillSession(id) => {
                if registry.cancel(&id) {
                    info!(session_id = %id, "Session killed by control plane");
                } else {
                    debug!(session_id = %id, "Kill requested for unknown session");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::control_plane::TokenGrant;
    use crate::error::Result;
    use crate::session::{CancellationSignal, Session, SessionLifecycle};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Kills every session it hears about, once
    #[derive(Default)]
    struct Killer {
        seen: Mutex<Vec<Vec<Uuid>>>,
    }

    #[async_trait]
    impl SessionLifecycle for Killer {
        async fn create_session(&self, _: &Session) -> Result<()> {
            Ok(())
        }
        async fn mark_connected(&self, _: Uuid) -> Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _: Uuid, _: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_disconnected(&self, _: Uuid) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ControlPlane for Killer {
        async fn resolve_token(&self, _: &str) -> Result<TokenGrant> {
            Ok(TokenGrant::default())
        }
        async fn audit_storage_config(&self) -> Result<StorageConfig> {
            Ok(StorageConfig::Null)
        }
        async fn heartbeat(&self, active: &[Uuid]) -> Result<Vec<ControlTask>> {
            self.seen.lock().unwrap().push(active.to_vec());
            Ok(active.iter().copied().map(ControlTask::KillSession).collect())
        }
        fn name(&self) -> &'static str {
            "killer"
        }
    }

    #[test]
    fn test_apply_kill_task() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let signal = CancellationSignal::new();
        registry.register(id, signal.clone());

        apply_tasks(&registry, vec![ControlTask::KillSession(id)]);
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_apply_kill_for_unknown_session_is_ignored() {
        let registry = SessionRegistry::new();
        apply_tasks(&registry, vec![ControlTask::KillSession(Uuid::new_v4())]);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_and_kills() {
        let plane = Arc::new(Killer::default());
        let registry = Arc::new(SessionRegistry::new());
        let id = Uuid::new_v4();
        let signal = CancellationSignal::new();
        registry.register(id, signal.clone());

        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_heartbeat(plane.clone(), registry.clone(), Duration::from_secs(30), rx);

        tokio::time::timeout(Duration::from_secs(60), signal.cancelled())
            .await
            .unwrap();
        assert_eq!(plane.seen.lock().unwrap()[0], vec![id]);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
