//! Audit record types

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::session::Session;

/// One recorded statement, in the shape the audit store expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub session_id: Uuid,
    pub org_id: String,
    pub input: String,
    /// Result text; the gateway does not capture results
    pub output: String,
    pub user: String,
    pub asset: String,
    pub system_user: String,
    /// Unix seconds
    pub timestamp: i64,
    pub risk_level: u8,
}

impl Command {
    pub fn new(session: &Session, input: impl Into<String>) -> Self {
        Self {
            session_id: session.id,
            org_id: session.org_id.clone(),
            input: input.into(),
            output: String::new(),
            user: session.user.clone(),
            asset: session.asset.clone(),
            system_user: session.system_user.clone(),
            timestamp: Utc::now().timestamp(),
            risk_level: 0,
        }
    }
}

/// A slice of the replay stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayChunk {
    /// Milliseconds since the recording started
    pub elapsed_ms: u64,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPolicyConfig;
    use crate::control_plane::TokenGrant;
    use crate::protocol::DatabaseProtocol;

    #[test]
    fn test_command_copies_session_labels() {
        let grant = TokenGrant {
            username: "app".into(),
            user: "alice".into(),
            asset: "orders".into(),
            org_id: "org".into(),
            ..Default::default()
        };
        let session = Session::new(
            &grant,
            DatabaseProtocol::MySql,
            "127.0.0.1:1".parse().unwrap(),
            &SessionPolicyConfig::default(),
        );
        let cmd = Command::new(&session, "SELECT 1");
        assert_eq!(cmd.session_id, session.id);
        assert_eq!(cmd.input, "SELECT 1");
        assert_eq!(cmd.output, "");
        assert_eq!(cmd.system_user, "app");
        assert_eq!(cmd.user, "alice");
        assert_eq!(cmd.risk_level, 0);
        assert!(cmd.timestamp > 1_600_000_000);
    }
}
