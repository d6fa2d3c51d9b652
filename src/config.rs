//! Application configuration
//!
//! Stored as TOML. Every field has a default, so an empty or partial file is
//! valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_HOST, DEFAULT_PORT};
use crate::error::{Error, Result};

/// Environment variable overriding the client's server host
pub const ENV_SERVER: &str = "RSD_SERVER";

/// Environment variable overriding the client's server port
pub const ENV_PORT: &str = "RSD_PORT";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Settings for the `rsd` daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Backend name, see [`crate::backend::available_backends`]
    pub backend: String,
    /// Output device for backends that can pick one
    pub device: Option<String>,
    /// Serve one client at a time
    pub single_connection: bool,
    pub control_grace_ms: u64,
    pub header_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backend: crate::backend::default_backend_name().to_string(),
            device: None,
            single_connection: false,
            control_grace_ms: 200,
            header_timeout_ms: 10_000,
            poll_interval_ms: 50,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn control_grace(&self) -> Duration {
        Duration::from_millis(self.control_grace_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    /// Never zero; a zero read timeout means "block forever" to the OS.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn bind_endpoint(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Defaults for streaming clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Requested ring capacity in bytes; 0 picks one from the chunk size
    pub buffer_size: usize,
    /// Latency bound for `delay_wait`; 0 disables it
    pub max_latency_ms: u32,
    pub identity: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            buffer_size: 0,
            max_latency_ms: 0,
            identity: None,
        }
    }
}

impl ClientConfig {
    /// Replace host and port with `RSD_SERVER` / `RSD_PORT` when set.
    pub fn apply_env(&mut self) {
        self.apply_overrides(std::env::var(ENV_SERVER).ok(), std::env::var(ENV_PORT).ok());
    }

    fn apply_overrides(&mut self, host: Option<String>, port: Option<String>) {
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            self.host = host;
        }
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring invalid {}={:?}", ENV_PORT, port),
            }
        }
    }
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "rsound", "rsd")
            .map(|dirs| dirs.config_dir().join("rsd.toml"))
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, or from the default location.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
