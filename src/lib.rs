//! tokendb-gateway - Token-authenticated database gateway
//!
//! This library provides the core functionality for a bastion gateway that:
//! - Accepts MySQL and PostgreSQL clients that log in with an access token
//! - Resolves the token to real backend credentials through a control plane
//! - Logs in to the backend with those credentials on the client's behalf
//! - Relays the session frame by frame and records every statement for audit

#[macro_use]
mod logging;

pub mod audit;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use audit::{AuditRecorder, AuditStorage, Command, FileStorage, NullStorage, ReplayChunk};
pub use config::Config;
pub use control_plane::{
    ControlPlane, ControlTask, HttpControlPlane, StaticControlPlane, TokenGrant,
};
pub use error::{ProxyError, Result};
pub use protocol::DatabaseProtocol;
pub use server::{spawn_heartbeat, Gateway, Listener, ListenerStats};
pub use session::{CancellationSignal, Session, SessionLifecycle, SessionRegistry};
