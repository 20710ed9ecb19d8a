//! Live session registry
//!
//! Owned by the gateway and handed to every connection task; the heartbeat
//! uses it to report active sessions and to apply kill tasks.

use dashmap::DashMap;
use uuid::Uuid;

use super::CancellationSignal;

/// Concurrent map from session id to its cancellation signal.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, CancellationSignal>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, signal: CancellationSignal) {
        if self.sessions.insert(id, signal).is_some() {
            warn!("Session {} registered twice", id);
        }
    }

    pub fn unregister(&self, id: &Uuid) {
        self.sessions.remove(id);
    }

    /// Fire the signal of a live session.
    ///
    /// Returns `false` if the session is unknown or was already cancelled.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.sessions.get(id) {
            Some(signal) => signal.cancel(),
            None => false,
        }
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
