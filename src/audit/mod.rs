//! Session audit: statement capture and replay streams
//!
//! ## Design
//!
//! - The relay calls [`AuditRecorder::record_query`] and never blocks on it.
//! - Per-session background tasks batch records into an [`AuditStorage`].
//! - Storage failures are logged and counted, never propagated to the relay.

mod record;
mod recorder;
mod storage;

pub use record::{Command, ReplayChunk};
pub use recorder::{AuditRecorder, CommandRecorder, ReplayRecorder};
pub use storage::{build_storage, AuditStorage, FileStorage, NullStorage};
