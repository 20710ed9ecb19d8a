//! Sessions: the audited unit of work behind one client connection
//!
//! A [`Session`] only exists once the credential bridge reaches Ready.
//! Around it live the pieces that track and stop it:
//!
//! - [`SessionTracker`] reports lifecycle transitions, each at most once
//! - [`CancellationSignal`] stops the relay from the outside
//! - [`SessionRegistry`] maps live session ids to their signals
//! - [`IdleWatchdog`] cancels sessions that stop moving bytes

mod cancel;
mod lifecycle;
mod registry;
mod watchdog;

pub use cancel::CancellationSignal;
pub use lifecycle::{SessionLifecycle, SessionTracker};
pub use registry::SessionRegistry;
pub use watchdog::{ActivityClock, IdleWatchdog};

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SessionPolicyConfig;
use crate::control_plane::TokenGrant;
use crate::protocol::DatabaseProtocol;

/// One audited database session.
///
/// Serialized as-is when reported to an HTTP control plane.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user: String,
    pub user_id: String,
    /// Backend account the gateway logged in as
    pub system_user: String,
    pub asset: String,
    pub protocol: DatabaseProtocol,
    pub remote_addr: String,
    pub org_id: String,
    pub date_start: DateTime<Utc>,
    /// Idle limit in seconds, 0 for none
    pub max_idle: u64,
    pub keep_alive: u64,
}

impl Session {
    /// Build the session record for a connection that just reached Ready.
    pub fn new(
        grant: &TokenGrant,
        protocol: DatabaseProtocol,
        remote_addr: SocketAddr,
        policy: &SessionPolicyConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: grant.user.clone(),
            user_id: grant.user_id.clone(),
            system_user: grant.username.clone(),
            asset: grant.asset.clone(),
            protocol,
            remote_addr: remote_addr.to_string(),
            org_id: grant.org_id.clone(),
            date_start: Utc::now(),
            max_idle: policy.max_idle_secs,
            keep_alive: policy.keep_alive_secs,
        }
    }
}
