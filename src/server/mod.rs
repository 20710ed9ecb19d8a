//! Server module for tokendb-gateway
//!
//! This module contains:
//! - The shared [`Gateway`] state
//! - TCP listeners, one per protocol port
//! - The credential bridge and per-protocol handshake handlers
//! - The frame relay
//! - The control plane heartbeat

pub mod bridge;
pub mod gateway;
pub mod handlers;
pub mod heartbeat;
pub mod listener;
pub mod relay;

pub use bridge::{Bridge, BridgeState};
pub use gateway::Gateway;
pub use handlers::{MySqlHandler, PostgresHandler};
pub use heartbeat::{apply_tasks, spawn_heartbeat};
pub use listener::{Listener, ListenerStats};
pub use relay::{run_relay, spawn_reader, DirectionPump, FrameSource, Flow, RelayHandler, RelayOutcome};
