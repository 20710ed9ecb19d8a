//! Logging macros that pin the tracing target to "tokendb_gateway".
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "tokendb_gateway::server::handlers::postgres"), which makes
//! per-crate filtering in `RUST_LOG` awkward. These macros keep every
//! event from this crate under a single target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "tokendb_gateway", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "tokendb_gateway", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "tokendb_gateway", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "tokendb_gateway", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "tokendb_gateway", $($arg)*) };
}

/// Per-frame relay tracing under its own target, switched on by
/// `logging.protocol_debug`.
macro_rules! wire {
    ($($arg:tt)*) => { ::tracing::trace!(target: "tokendb_gateway::wire", $($arg)*) };
}
