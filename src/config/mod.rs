//! Configuration module for tokendb-gateway
//!
//! One process serves both adapters; either port may be omitted.
//!
//! ## Static control plane
//! ```yaml
//! server:
//!   mysql_port: 33060
//!   postgres_port: 54320
//! control_plane:
//!   type: static
//!   tokens:
//!     - token: "tok-1"
//!       secret: "s3cr3t"
//!       username: "app"
//!       password: "${APP_PASSWORD}"
//!       host: "db.internal"
//!       port: 5432
//!       database: "app"
//! ```
//!
//! ## Remote control plane
//! ```yaml
//! server:
//!   postgres_port: 54320
//! control_plane:
//!   type: http
//!   base_url: "https://core.example.com"
//!   access_key: "${TOKENDB_ACCESS_KEY}"
//! ```

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str};
pub use types::*;
