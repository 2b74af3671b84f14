//! Control plane configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/agent-plane/control-plane.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default, so an empty config with just the schema
//! version is a runnable development setup.

use crate::controller::ControllerConfig;
use crate::forwarder::ForwarderConfig;
use crate::http::auth::AuthConfig;
use crate::status::StatusManagerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default config path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/agent-plane/control-plane.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub status: StatusConfig,
    pub forwarder: ForwarderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
    pub payload_dir: String,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub timeout_ms: u64,
    pub async_wait_ms: u64,
    pub inline_threshold: usize,
    pub queue_capacity: usize,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub heartbeat_horizon_secs: u64,
    pub reconcile_interval_secs: u64,
    pub max_transition_secs: u64,
    pub probe_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub worker_count: usize,
    pub queue_size: usize,
    pub response_body_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_version: 1,
            server: ServerConfig {
                bind: "0.0.0.0:8081".to_owned(),
            },
            auth: AuthConfig::default(),
            storage: StorageConfig {
                sqlite_path: "/var/lib/agent-plane/control-plane.sqlite3".to_owned(),
                payload_dir: "/var/lib/agent-plane/payloads".to_owned(),
            },
            dispatch: DispatchConfig {
                timeout_ms: 60_000,
                async_wait_ms: 120_000,
                inline_threshold: 256 * 1024,
                queue_capacity: crate::pool::DEFAULT_QUEUE_CAPACITY,
                workers: crate::pool::default_worker_count(),
            },
            status: StatusConfig {
                heartbeat_horizon_secs: 30,
                reconcile_interval_secs: 30,
                max_transition_secs: 120,
                probe_enabled: true,
            },
            forwarder: ForwarderSettings {
                batch_size: 10,
                batch_timeout_ms: 1000,
                http_timeout_ms: 10_000,
                max_attempts: 3,
                retry_backoff_ms: 1000,
                max_retry_backoff_ms: 30_000,
                worker_count: 2,
                queue_size: 1000,
                response_body_limit: 16 * 1024,
            },
        }
    }
}

impl Config {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            dispatch_timeout: Duration::from_millis(self.dispatch.timeout_ms),
            async_wait_timeout: Duration::from_millis(self.dispatch.async_wait_ms),
            inline_threshold: self.dispatch.inline_threshold,
        }
    }

    pub fn status_manager_config(&self) -> StatusManagerConfig {
        StatusManagerConfig {
            heartbeat_horizon: Duration::from_secs(self.status.heartbeat_horizon_secs),
            reconcile_interval: Duration::from_secs(self.status.reconcile_interval_secs),
            max_transition_time: Duration::from_secs(self.status.max_transition_secs),
            ..StatusManagerConfig::default()
        }
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            batch_size: self.forwarder.batch_size,
            batch_timeout: Duration::from_millis(self.forwarder.batch_timeout_ms),
            http_timeout: Duration::from_millis(self.forwarder.http_timeout_ms),
            max_attempts: self.forwarder.max_attempts,
            retry_backoff: Duration::from_millis(self.forwarder.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(self.forwarder.max_retry_backoff_ms),
            worker_count: self.forwarder.worker_count,
            queue_size: self.forwarder.queue_size,
            response_body_limit: self.forwarder.response_body_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    storage: Option<RawStorageConfig>,
    dispatch: Option<RawDispatchConfig>,
    status: Option<RawStatusConfig>,
    forwarder: Option<RawForwarderConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    api_key: Option<String>,
    skip_paths: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
    payload_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDispatchConfig {
    timeout_ms: Option<u64>,
    async_wait_ms: Option<u64>,
    inline_threshold: Option<usize>,
    queue_capacity: Option<usize>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawStatusConfig {
    heartbeat_horizon_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    max_transition_secs: Option<u64>,
    probe_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawForwarderConfig {
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    http_timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_retry_backoff_ms: Option<u64>,
    worker_count: Option<usize>,
    queue_size: Option<usize>,
    response_body_limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let defaults = Config::default();

    let server = ServerConfig {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or(defaults.server.bind),
    };

    let auth = match raw.auth {
        Some(a) => AuthConfig {
            api_key: a.api_key,
            skip_paths: a.skip_paths.unwrap_or_default(),
        },
        None => AuthConfig::default(),
    };

    let storage = match raw.storage {
        Some(s) => StorageConfig {
            sqlite_path: s.sqlite_path.unwrap_or(defaults.storage.sqlite_path),
            payload_dir: s.payload_dir.unwrap_or(defaults.storage.payload_dir),
        },
        None => defaults.storage,
    };

    let dispatch = match raw.dispatch {
        Some(d) => {
            if d.workers == Some(0) {
                return Err(ConfigError::InvalidValue(
                    "dispatch.workers must be at least 1".to_owned(),
                ));
            }
            DispatchConfig {
                timeout_ms: d.timeout_ms.unwrap_or(defaults.dispatch.timeout_ms),
                async_wait_ms: d.async_wait_ms.unwrap_or(defaults.dispatch.async_wait_ms),
                inline_threshold: d
                    .inline_threshold
                    .unwrap_or(defaults.dispatch.inline_threshold),
                queue_capacity: d
                    .queue_capacity
                    .unwrap_or(defaults.dispatch.queue_capacity),
                workers: d.workers.unwrap_or(defaults.dispatch.workers),
            }
        }
        None => defaults.dispatch,
    };

    let status = match raw.status {
        Some(s) => StatusConfig {
            heartbeat_horizon_secs: s
                .heartbeat_horizon_secs
                .unwrap_or(defaults.status.heartbeat_horizon_secs),
            reconcile_interval_secs: s
                .reconcile_interval_secs
                .unwrap_or(defaults.status.reconcile_interval_secs),
            max_transition_secs: s
                .max_transition_secs
                .unwrap_or(defaults.status.max_transition_secs),
            probe_enabled: s.probe_enabled.unwrap_or(true),
        },
        None => defaults.status,
    };

    let forwarder = match raw.forwarder {
        Some(f) => ForwarderSettings {
            batch_size: f.batch_size.unwrap_or(defaults.forwarder.batch_size),
            batch_timeout_ms: f
                .batch_timeout_ms
                .unwrap_or(defaults.forwarder.batch_timeout_ms),
            http_timeout_ms: f
                .http_timeout_ms
                .unwrap_or(defaults.forwarder.http_timeout_ms),
            max_attempts: f.max_attempts.unwrap_or(defaults.forwarder.max_attempts),
            retry_backoff_ms: f
                .retry_backoff_ms
                .unwrap_or(defaults.forwarder.retry_backoff_ms),
            max_retry_backoff_ms: f
                .max_retry_backoff_ms
                .unwrap_or(defaults.forwarder.max_retry_backoff_ms),
            worker_count: f.worker_count.unwrap_or(defaults.forwarder.worker_count),
            queue_size: f.queue_size.unwrap_or(defaults.forwarder.queue_size),
            response_body_limit: f
                .response_body_limit
                .unwrap_or(defaults.forwarder.response_body_limit),
        },
        None => defaults.forwarder,
    };

    Ok(Config {
        schema_version,
        server,
        auth,
        storage,
        dispatch,
        status,
        forwarder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_all_defaults() {
        let config = load_config_from_str("schema_version = 1").expect("load");
        assert_eq!(config.server.bind, "0.0.0.0:8081");
        assert_eq!(config.forwarder.batch_size, 10);
        assert_eq!(config.dispatch.inline_threshold, 256 * 1024);
        assert!(config.status.probe_enabled);
        assert!(config.auth.api_key.is_none());
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let result = load_config_from_str("[server]\nbind = \"127.0.0.1:0\"");
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let result = load_config_from_str("schema_version = 2");
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let toml_str = r#"
schema_version = 1

[server]
bind = "127.0.0.1:9090"

[auth]
api_key = "k-123"
skip_paths = ["/docs"]

[forwarder]
batch_size = 25
max_attempts = 5

[status]
heartbeat_horizon_secs = 60
probe_enabled = false
"#;
        let config = load_config_from_str(toml_str).expect("load");
        assert_eq!(config.server.bind, "127.0.0.1:9090");
        assert_eq!(config.auth.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.auth.skip_paths, vec!["/docs".to_owned()]);
        assert_eq!(config.forwarder.batch_size, 25);
        assert_eq!(config.forwarder.max_attempts, 5);
        assert_eq!(config.forwarder.queue_size, 1000);
        assert_eq!(config.status.heartbeat_horizon_secs, 60);
        assert!(!config.status.probe_enabled);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = load_config_from_str("schema_version = 1\n[dispatch]\nworkers = 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
