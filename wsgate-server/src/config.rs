//! Server configuration.
//!
//! Resolution order, later wins: built-in defaults, then the YAML file
//! named by `WSGATE_CONFIG`, then individual `WSGATE_*` variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub tls: TlsConfig,
}

impl Config {
    /// Resolves the full configuration: defaults, optional file, env.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("WSGATE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.override_from_env();
        Ok(config)
    }

    /// Parses a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Defaults plus env overrides, no file involved.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.override_from_env();
        config
    }

    fn override_from_env(&mut self) {
        self.network.override_from_env();
        self.tls.override_from_env();
    }
}

/// Reads an env var and parses it, ignoring unset or malformed values.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Worker task count, 0 picks the default.
    pub pool_size: usize,
    /// Request and reply queue capacity, 0 picks the default.
    pub queue_capacity: usize,
    /// Listen backlog, 0 picks the default.
    pub backlog: u32,
    /// Per-connection read buffer in bytes.
    pub read_buffer_size: usize,
    /// Payloads above this many bytes are split into continuation
    /// frames, 0 picks the default.
    pub fragment_size: usize,
    /// Per-write timeout in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9800".parse().unwrap(),
            pool_size: 0,
            queue_capacity: 0,
            backlog: 0,
            read_buffer_size: 8192,
            fragment_size: 0,
            write_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    fn override_from_env(&mut self) {
        if let Some(addr) = env_parse("WSGATE_BIND") {
            self.bind_addr = addr;
        }
        if let Some(n) = env_parse("WSGATE_POOL_SIZE") {
            self.pool_size = n;
        }
        if let Some(n) = env_parse("WSGATE_QUEUE_CAPACITY") {
            self.queue_capacity = n;
        }
        if let Some(ms) = env_parse("WSGATE_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = ms;
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM-encoded certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM-encoded private key.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    fn override_from_env(&mut self) {
        if let Ok(enabled) = std::env::var("WSGATE_TLS_ENABLED") {
            self.enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        }
        if let Some(path) = env_parse::<PathBuf>("WSGATE_TLS_CERT") {
            self.cert_path = Some(path);
        }
        if let Some(path) = env_parse::<PathBuf>("WSGATE_TLS_KEY") {
            self.key_path = Some(path);
        }
    }

    /// Checks that an enabled TLS section names both PEM files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled {
            if self.cert_path.is_none() {
                return Err(ConfigError::Invalid("tls enabled but cert_path not set"));
            }
            if self.key_path.is_none() {
                return Err(ConfigError::Invalid("tls enabled but key_path not set"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {1}", .0.display())]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// YAML carries the listen address as a plain string.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SocketAddr, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}
