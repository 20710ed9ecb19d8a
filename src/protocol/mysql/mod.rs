//! MySQL protocol implementation
//!
//! This module contains:
//! - Packet structures and the command-phase view
//! - Packet parser (read/write, decode/build)
//! - Challenge-response helpers

pub mod auth;
pub mod packets;
pub mod parser;

pub use auth::*;
pub use packets::*;
pub use parser::*;
