//! PostgreSQL protocol implementation (wire protocol 3.0)
//!
//! - Constants and message tags
//! - Frames and their typed views
//! - Async codec for the startup and typed phases
//! - SCRAM-SHA-256 for both roles, MD5 for legacy backends

pub mod auth;
pub mod codec;
pub mod constants;
pub mod messages;
pub mod scram;

pub use auth::md5_password;
pub use codec::*;
pub use messages::*;
pub use scram::{ScramConversation, ScramRole, ScramStep};
