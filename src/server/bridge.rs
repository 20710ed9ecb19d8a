//! Credential bridge state tracking
//!
//! Every connection walks the same states, whichever protocol it speaks:
//!
//! ```text
//! AwaitingClientHandshake -> ResolvingToken -> BackendDialing
//!     -> BackendHandshaking -> Ready
//! ```
//!
//! Any state may move to `Aborted`. Nothing moves backwards, and nothing
//! leaves `Aborted`.

use std::fmt;

use crate::error::{ProxyError, Result};
use crate::protocol::DatabaseProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BridgeState {
    AwaitingClientHandshake,
    ResolvingToken,
    BackendDialing,
    BackendHandshaking,
    Ready,
    Aborted,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::AwaitingClientHandshake => "awaiting-client-handshake",
            BridgeState::ResolvingToken => "resolving-token",
            BridgeState::BackendDialing => "backend-dialing",
            BridgeState::BackendHandshaking => "backend-handshaking",
            BridgeState::Ready => "ready",
            BridgeState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Forward-only state tracker for one connection's handshake.
#[derive(Debug)]
pub struct Bridge {
    connection_id: u64,
    protocol: DatabaseProtocol,
    state: BridgeState,
}

impl Bridge {
    pub fn new(connection_id: u64, protocol: DatabaseProtocol) -> Self {
        Self {
            connection_id,
            protocol,
            state: BridgeState::AwaitingClientHandshake,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BridgeState::Ready
    }

    /// Move to a later state.
    pub fn advance(&mut self, next: BridgeState) -> Result<()> {
        if self.state == BridgeState::Aborted || next <= self.state {
            return Err(ProxyError::Protocol(format!(
                "illegal bridge transition {} -> {}",
                self.state, next
            )));
        }
        debug!(
            "[{} #{}] {} -> {}",
            self.protocol, self.connection_id, self.state, next
        );
        self.state = next;
        Ok(())
    }

    /// Move to `Aborted`. A no-op if already there.
    pub fn abort(&mut self, reason: &str) {
        if self.state == BridgeState::Aborted {
            return;
        }
        debug!(
            "[{} #{}] {} -> aborted: {}",
            self.protocol, self.connection_id, self.state, reason
        );
        self.state = BridgeState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> Bridge {
        Bridge::new(1, DatabaseProtocol::MySql)
    }

    #[test]
    fn test_full_forward_walk() {
        let mut b = bridge();
        for next in [
            BridgeState::ResolvingToken,
            BridgeState::BackendDialing,
            BridgeState::BackendHandshaking,
            BridgeState::Ready,
        ] {
            b.advance(next).unwrap();
        }
        assert!(b.is_ready());
    }

    #[test]
    fn test_backward_and_repeat_transitions_rejected() {
        let mut b = bridge();
        b.advance(BridgeState::BackendDialing).unwrap();
        assert!(b.advance(BridgeState::ResolvingToken).is_err());
        assert!(b.advance(BridgeState::BackendDialing).is_err());
        assert_eq!(b.state(), BridgeState::BackendDialing);
    }

    #[test]
    fn test_abort_from_any_state_is_terminal() {
        let mut b = bridge();
        b.advance(BridgeState::Ready).unwrap();
        b.abort("relay failed");
        assert_eq!(b.state(), BridgeState::Aborted);
        b.abort("again");
        assert!(b.advance(BridgeState::Ready).is_err());
    }

    #[test]
    fn test_illegal_transition_is_protocol_error() {
        let mut b = bridge();
        b.abort("x");
        let err = b.advance(BridgeState::ResolvingToken).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }
}
