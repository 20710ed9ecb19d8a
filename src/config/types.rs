//! Configuration types

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::postgres::constants::MAX_SCRAM_ITERATIONS;

/// Root configuration structure
///
/// # Example
///
/// ```yaml
/// server:
///   listen_address: "0.0.0.0"
///   mysql_port: 33060
///   postgres_port: 54320
///
/// control_plane:
///   type: static
///   tokens:
///     - token: "6b73919f-2890-4ee0-8807-984e09e54d32"
///       secret: "s3cr3t"
///       username: "app_rw"
///       password: "${APP_RW_PASSWORD}"
///       host: "db.internal"
///       port: 5432
///       database: "app"
///
/// storage:
///   type: file
///   directory: "/var/lib/tokendb-gateway/audit"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// MySQL adapter settings
    #[serde(default)]
    pub mysql: MySqlConfig,

    /// PostgreSQL adapter settings
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Session idle/keep-alive policy
    #[serde(default)]
    pub session: SessionPolicyConfig,

    /// Audit queue tuning
    #[serde(default)]
    pub audit: AuditConfig,

    /// Where tokens are resolved and sessions are reported
    pub control_plane: ControlPlaneConfig,

    /// Audit storage used when the control plane does not dictate one
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.mysql_port.is_none() && self.server.postgres_port.is_none() {
            return Err("At least one of server.mysql_port or server.postgres_port must be set".into());
        }
        if self.server.mysql_port.is_some() && self.server.mysql_port == self.server.postgres_port {
            return Err("server.mysql_port and server.postgres_port must differ".into());
        }
        if self.mysql.server_version.is_empty() || self.mysql.server_version.contains('\0') {
            return Err("mysql.server_version must be a non-empty string without NUL".into());
        }
        if !(4096..=MAX_SCRAM_ITERATIONS).contains(&self.postgres.scram_iterations) {
            return Err(format!(
                "postgres.scram_iterations must be between 4096 and {} (got {})",
                MAX_SCRAM_ITERATIONS, self.postgres.scram_iterations
            ));
        }
        if self.audit.command_queue_size == 0 || self.audit.replay_queue_size == 0 {
            return Err("audit queue sizes must be greater than zero".into());
        }
        if self.audit.command_batch_size == 0 {
            return Err("audit.command_batch_size must be greater than zero".into());
        }

        match &self.control_plane {
            ControlPlaneConfig::Static { tokens } => {
                for (i, t) in tokens.iter().enumerate() {
                    if t.token.is_empty() {
                        return Err(format!("control_plane.tokens[{}].token is empty", i));
                    }
                    if t.host.is_empty() {
                        return Err(format!("control_plane.tokens[{}].host is empty", i));
                    }
                }
            }
            ControlPlaneConfig::Http(http) => {
                if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://")) {
                    return Err(format!(
                        "control_plane.base_url must be an http(s) URL (got '{}')",
                        http.base_url
                    ));
                }
            }
        }

        if let StorageConfig::File { directory } = &self.storage {
            if directory.as_os_str().is_empty() {
                return Err("storage.directory must not be empty".into());
            }
        }

        Ok(())
    }
}

/// Server listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// MySQL adapter port (disabled when absent)
    #[serde(default)]
    pub mysql_port: Option<u16>,
    /// PostgreSQL adapter port (disabled when absent)
    #[serde(default)]
    pub postgres_port: Option<u16>,
    /// Backend connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound on any single handshake read, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Maximum number of concurrent connections per listener (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// MySQL adapter settings
#[derive(Debug, Clone, Deserialize)]
pub struct MySqlConfig {
    /// Version string advertised in the synthetic handshake
    #[serde(default = "default_mysql_server_version")]
    pub server_version: String,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            server_version: default_mysql_server_version(),
        }
    }
}

/// PostgreSQL adapter settings
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// PBKDF2 iteration count for the client-facing SCRAM exchange
    #[serde(default = "default_scram_iterations")]
    pub scram_iterations: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            scram_iterations: default_scram_iterations(),
        }
    }
}

/// Session idle policy
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPolicyConfig {
    /// Cancel a session after this many seconds without traffic (0 = never)
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
    /// Interval at which the idle watchdog checks activity
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: default_max_idle(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl SessionPolicyConfig {
    pub fn max_idle(&self) -> Option<Duration> {
        (self.max_idle_secs > 0).then(|| Duration::from_secs(self.max_idle_secs))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }
}

/// Audit queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Bounded command queue depth per session
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,
    /// Bounded replay queue depth per session
    #[serde(default = "default_replay_queue_size")]
    pub replay_queue_size: usize,
    /// Commands uploaded per storage call
    #[serde(default = "default_command_batch_size")]
    pub command_batch_size: usize,
    /// Maximum delay before a partial batch is uploaded, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            command_queue_size: default_command_queue_size(),
            replay_queue_size: default_replay_queue_size(),
            command_batch_size: default_command_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Control plane selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlPlaneConfig {
    /// Tokens listed in the configuration file
    Static {
        #[serde(default)]
        tokens: Vec<StaticTokenConfig>,
    },
    /// Remote control plane over HTTP
    Http(HttpControlPlaneConfig),
}

/// A token served by the static control plane
#[derive(Clone, Deserialize)]
pub struct StaticTokenConfig {
    /// Opaque token the client presents as its user name
    pub token: String,
    /// Secret the client proves knowledge of
    pub secret: String,
    /// Backend account
    pub username: String,
    /// Backend password
    pub password: String,
    /// Backend host
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Backend database
    #[serde(default)]
    pub database: Option<String>,
    /// Permission verdict
    #[serde(default = "default_true")]
    pub permitted: bool,
    /// Human user label recorded in the audit trail
    #[serde(default)]
    pub user: Option<String>,
    /// Asset label recorded in the audit trail
    #[serde(default)]
    pub asset: Option<String>,
    /// Organization scope
    #[serde(default)]
    pub org_id: Option<String>,
}

// Secrets must never reach the logs
impl std::fmt::Debug for StaticTokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenConfig")
            .field("token", &"[REDACTED]")
            .field("username", &self.username)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("permitted", &self.permitted)
            .finish()
    }
}

/// Remote control plane settings
#[derive(Clone, Deserialize)]
pub struct HttpControlPlaneConfig {
    /// Base URL, e.g. `https://core.example.com`
    pub base_url: String,
    /// Bearer credential for the gateway itself
    #[serde(default)]
    pub access_key: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Heartbeat period in seconds (0 disables the heartbeat task)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl std::fmt::Debug for HttpControlPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlaneConfig")
            .field("base_url", &self.base_url)
            .field("access_key", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .finish()
    }
}

/// Audit storage selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Discard everything (logged)
    #[default]
    Null,
    /// JSON Lines files under a directory
    File { directory: PathBuf },
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log every relayed frame at trace level
    #[serde(default)]
    pub protocol_debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            protocol_debug: false,
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_mysql_server_version() -> String {
    "8.0.30".to_string()
}

fn default_scram_iterations() -> u32 {
    4096
}

fn default_max_idle() -> u64 {
    7200
}

fn default_keep_alive() -> u64 {
    10
}

fn default_command_queue_size() -> usize {
    10
}

fn default_replay_queue_size() -> usize {
    256
}

fn default_command_batch_size() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_http_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
