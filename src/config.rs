//! Application configuration

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use tracing::warn;

use crate::errors::AvlRecorderError;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub tcp: TcpConfig,
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub logs: LogsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            logs: LogsConfig::default(),
        }
    }
}

/// Device-facing TCP listener.
#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TcpConfig {
    pub port: u16,
    /// Unauthenticated sessions are closed after this long.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub login_timeout: Duration,
    /// Liveness poll period; observability only, never writes to the wire.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub liveness_interval: Duration,
    /// Drop frames whose CRC field disagrees with the payload. Off by
    /// default: observed field traffic includes such frames.
    pub reject_bad_crc: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port: 5027,
            login_timeout: Duration::from_secs(15),
            liveness_interval: Duration::from_secs(5),
            reject_bad_crc: false,
        }
    }
}

/// Read-only HTTP API.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    /// Shared secret required in the `X-API-Key` header.
    pub api_key: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            api_key: String::new(),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub flush_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("avl-recorder.db"),
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Raw frame capture directory.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogsConfig {
    pub directory: PathBuf,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::with_prefix("AVLRECORDER").separator("__"))
            .build()?;

        let mut config: AppConfig = config.try_deserialize()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Well-known deployment variables take precedence over the prefixed
    /// form: `API_PORT`, `API_KEY`, `LOGS_DIR`.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("API_PORT") {
            match port.parse() {
                Ok(port) => self.http.port = port,
                Err(_) => warn!("Ignoring unparseable API_PORT={}", port),
            }
        }
        if let Ok(key) = std::env::var("API_KEY") {
            self.http.api_key = key;
        }
        if let Ok(dir) = std::env::var("LOGS_DIR") {
            self.logs.directory = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), AvlRecorderError> {
        self.database.validate()?;
        if self.http.api_key.is_empty() {
            warn!("http.api_key is empty; all authenticated routes will reject");
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), AvlRecorderError> {
        // Validate path
        if self.path.to_str().unwrap_or("").is_empty() {
            return Err(AvlRecorderError::ConfigurationError {
                message: "Database path cannot be empty".to_string(),
            });
        }

        // Validate flush interval
        if self.flush_interval.as_secs() == 0 {
            return Err(AvlRecorderError::ConfigurationError {
                message: "Flush interval must be greater than zero".to_string(),
            });
        }

        // Optional: Check if parent directory is writable
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && (!parent.exists() || !parent.is_dir()) {
                warn!(
                    "Database path parent directory does not exist: {}",
                    parent.display()
                );
            }
        }

        Ok(())
    }
}
