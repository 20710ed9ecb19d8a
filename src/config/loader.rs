//! Configuration loader

use super::{Config, ControlPlaneConfig};
use crate::error::{ProxyError, Result};
use std::path::Path;

/// Load configuration from a YAML file
///
/// Also applies TOKENDB_GATEWAY_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
///
/// Also applies TOKENDB_GATEWAY_* env var overrides after loading.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    resolve_config_env_vars(&mut config);
    apply_env_overrides(&mut config);
    config.validate().map_err(ProxyError::Config)?;
    Ok(config)
}

/// Apply TOKENDB_GATEWAY_* environment variable overrides to a config.
///
/// Supported env vars:
/// - `TOKENDB_GATEWAY_LISTEN_ADDRESS` - Override listen address
/// - `TOKENDB_GATEWAY_MYSQL_PORT` - Override MySQL listener port
/// - `TOKENDB_GATEWAY_POSTGRES_PORT` - Override PostgreSQL listener port
/// - `TOKENDB_GATEWAY_LOG_LEVEL` - Override log level
/// - `TOKENDB_GATEWAY_CONNECT_TIMEOUT_SECS` - Override backend connect timeout
/// - `TOKENDB_GATEWAY_MAX_CONNECTIONS` - Override max connections
/// - `TOKENDB_GATEWAY_CONTROL_PLANE_URL` - Override the HTTP control plane base URL
/// - `TOKENDB_GATEWAY_ACCESS_KEY` - Override the HTTP control plane access key
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("TOKENDB_GATEWAY_LISTEN_ADDRESS") {
        debug!("Overriding listen_address from TOKENDB_GATEWAY_LISTEN_ADDRESS");
        config.server.listen_address = val;
    }
    if let Some(port) = lookup("TOKENDB_GATEWAY_MYSQL_PORT").and_then(|v| v.parse::<u16>().ok()) {
        debug!("Overriding mysql_port from TOKENDB_GATEWAY_MYSQL_PORT");
        config.server.mysql_port = Some(port);
    }
    if let Some(port) = lookup("TOKENDB_GATEWAY_POSTGRES_PORT").and_then(|v| v.parse::<u16>().ok())
    {
        debug!("Overriding postgres_port from TOKENDB_GATEWAY_POSTGRES_PORT");
        config.server.postgres_port = Some(port);
    }
    if let Some(val) = lookup("TOKENDB_GATEWAY_LOG_LEVEL") {
        debug!("Overriding log level from TOKENDB_GATEWAY_LOG_LEVEL");
        config.logging.level = val;
    }
    if let Some(secs) =
        lookup("TOKENDB_GATEWAY_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
    {
        debug!("Overriding connect_timeout from TOKENDB_GATEWAY_CONNECT_TIMEOUT_SECS");
        config.server.connect_timeout_secs = secs;
    }
    if let Some(max) = lookup("TOKENDB_GATEWAY_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
        debug!("Overriding max_connections from TOKENDB_GATEWAY_MAX_CONNECTIONS");
        config.server.max_connections = max;
    }
    if let ControlPlaneConfig::Http(ref mut http) = config.control_plane {
        if let Some(val) = lookup("TOKENDB_GATEWAY_CONTROL_PLANE_URL") {
            debug!("Overriding control_plane.base_url from TOKENDB_GATEWAY_CONTROL_PLANE_URL");
            http.base_url = val;
        }
        if let Some(val) = lookup("TOKENDB_GATEWAY_ACCESS_KEY") {
            debug!("Overriding control_plane.access_key from TOKENDB_GATEWAY_ACCESS_KEY");
            http.access_key = val;
        }
    }
}

/// Resolve environment variables in a string value
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - curly brace syntax
/// - `$VAR_NAME` - simple syntax (whole value must be the reference)
///
/// If the environment variable is not set, the original value is preserved.
fn resolve_env_var(value: &str) -> String {
    let var_name = if let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        inner
    } else if let Some(inner) = value.strip_prefix('$') {
        if inner.is_empty() || inner.contains(' ') {
            return value.to_string();
        }
        inner
    } else {
        return value.to_string();
    };

    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            env_value
        }
        Err(_) => {
            debug!("Env var {} not set, keeping original value", var_name);
            value.to_string()
        }
    }
}

/// Resolve environment variables in all secret-bearing fields
fn resolve_config_env_vars(config: &mut Config) {
    match config.control_plane {
        ControlPlaneConfig::Static { ref mut tokens } => {
            for t in tokens.iter_mut() {
                t.secret = resolve_env_var(&t.secret);
                t.username = resolve_env_var(&t.username);
                t.password = resolve_env_var(&t.password);
                t.host = resolve_env_var(&t.host);
                if let Some(ref db) = t.database {
                    t.database = Some(resolve_env_var(db));
                }
            }
        }
        ControlPlaneConfig::Http(ref mut http) => {
            http.base_url = resolve_env_var(&http.base_url);
            http.access_key = resolve_env_var(&http.access_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL: &str = r#"
server:
  mysql_port: 33060

control_plane:
  type: static
  tokens:
    - token: "tok-1"
      secret: "s3cr3t"
      username: "alice"
      password: "pw"
      host: "127.0.0.1"
      port: 3306
"#;

    #[test]
    fn test_load_config_minimal() {
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.server.mysql_port, Some(33060));
        assert_eq!(config.server.postgres_port, None);
        assert_eq!(config.server.listen_address, "127.0.0.1");
        assert_eq!(config.mysql.server_version, "8.0.30");
        assert_eq!(config.postgres.scram_iterations, 4096);
        assert_eq!(config.session.max_idle_secs, 7200);
        assert_eq!(config.audit.command_queue_size, 10);
        assert_eq!(config.storage, StorageConfig::Null);

        match &config.control_plane {
            ControlPlaneConfig::Static { tokens } => {
                assert_eq!(tokens.len(), 1);
                assert!(tokens[0].permitted);
                assert_eq!(tokens[0].database, None);
            }
            other => panic!("unexpected control plane: {:?}", other),
        }
    }

    #[test]
    fn test_load_config_http_and_file_storage() {
        let yaml = r#"
server:
  listen_address: "0.0.0.0"
  mysql_port: 33060
  postgres_port: 54320
  max_connections: 0

control_plane:
  type: http
  base_url: "https://core.example.com"
  access_key: "ak"
  heartbeat_interval_secs: 5

storage:
  type: file
  directory: "/tmp/audit"

logging:
  level: debug
  protocol_debug: true
"#;
        let config = load_config_from_str(yaml).unwrap();
        assert_eq!(config.server.max_connections, 0);
        match &config.control_plane {
            ControlPlaneConfig::Http(http) => {
                assert_eq!(http.base_url, "https://core.example.com");
                assert_eq!(http.timeout_secs, 10);
                assert_eq!(http.heartbeat_interval_secs, 5);
            }
            other => panic!("unexpected control plane: {:?}", other),
        }
        assert_eq!(
            config.storage,
            StorageConfig::File {
                directory: "/tmp/audit".into()
            }
        );
        assert!(config.logging.protocol_debug);
    }

    #[test]
    fn test_load_config_requires_a_port() {
        let yaml = r#"
server:
  listen_address: "127.0.0.1"
control_plane:
  type: static
"#;
        let err = load_config_from_str(yaml).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn test_load_config_rejects_weak_scram_iterations() {
        let yaml = format!("{}\npostgres:\n  scram_iterations: 10\n", MINIMAL);
        assert!(load_config_from_str(&yaml).is_err());
        let yaml = format!("{}\npostgres:\n  scram_iterations: 50000000\n", MINIMAL);
        assert!(load_config_from_str(&yaml).is_err());
    }

    #[test]
    fn test_load_config_rejects_unknown_control_plane() {
        let yaml = r#"
server:
  mysql_port: 33060
control_plane:
  type: carrier_pigeon
"#;
        assert!(matches!(
            load_config_from_str(yaml),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.mysql_port, Some(33060));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/tokendb.yaml")).unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_resolve_env_var_syntaxes() {
        std::env::set_var("TOKENDB_TEST_RESOLVE_PW", "from-env");
        assert_eq!(resolve_env_var("${TOKENDB_TEST_RESOLVE_PW}"), "from-env");
        assert_eq!(resolve_env_var("$TOKENDB_TEST_RESOLVE_PW"), "from-env");
        assert_eq!(resolve_env_var("plain"), "plain");
        assert_eq!(resolve_env_var("$"), "$");
        assert_eq!(
            resolve_env_var("${TOKENDB_TEST_RESOLVE_UNSET}"),
            "${TOKENDB_TEST_RESOLVE_UNSET}"
        );
    }

    #[test]
    fn test_secret_fields_resolved_from_env() {
        std::env::set_var("TOKENDB_TEST_BACKEND_PW", "hunter2");
        let yaml = MINIMAL.replace("password: \"pw\"", "password: \"${TOKENDB_TEST_BACKEND_PW}\"");
        let config = load_config_from_str(&yaml).unwrap();
        match &config.control_plane {
            ControlPlaneConfig::Static { tokens } => assert_eq!(tokens[0].password, "hunter2"),
            other => panic!("unexpected control plane: {:?}", other),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = load_config_from_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("TOKENDB_GATEWAY_LISTEN_ADDRESS", "0.0.0.0"),
            ("TOKENDB_GATEWAY_POSTGRES_PORT", "54321"),
            ("TOKENDB_GATEWAY_MYSQL_PORT", "not-a-port"),
            ("TOKENDB_GATEWAY_MAX_CONNECTIONS", "5"),
        ]
        .into_iter()
        .collect();

        apply_overrides_from(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.listen_address, "0.0.0.0");
        assert_eq!(config.server.postgres_port, Some(54321));
        // unparsable values are ignored
        assert_eq!(config.server.mysql_port, Some(33060));
        assert_eq!(config.server.max_connections, 5);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load_config_from_str(MINIMAL).unwrap();
        let rendered = format!("{:?}", config.control_plane);
        assert!(!rendered.contains("s3cr3t"));
        assert!(!rendered.contains("tok-1"));
        assert!(rendered.contains("REDACTED"));
    }
}
