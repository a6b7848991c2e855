use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings shared by every component of a test run. Built by the caller and
/// passed explicitly into peers and sync clients.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Federation base URLs of the servers under test, keyed by server name.
    #[serde(default)]
    pub destinations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Hostname the server under test uses to reach the peer. The advertised
    /// server name is `host:port` once the listener is bound.
    #[serde(default = "default_host")]
    pub host: String,
    /// Fixed server name, overriding `host:port`.
    pub server_name: Option<String>,
    #[serde(default = "default_key_id")]
    pub key_id: String,
    #[serde(default = "default_false")]
    pub tls: bool,
    #[serde(default = "default_true")]
    pub unexpected_requests_are_errors: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            host: default_host(),
            server_name: None,
            key_id: default_key_id(),
            tls: false,
            unexpected_requests_are_errors: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Overall deadline for one `sync_until` assertion.
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
    /// Server-side long-poll budget passed as the `timeout` query parameter.
    #[serde(default = "default_long_poll_ms")]
    pub long_poll_ms: u64,
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sync_timeout_ms(),
            long_poll_ms: default_long_poll_ms(),
            transport_retries: default_transport_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn long_poll(&self) -> Duration {
        Duration::from_millis(self.long_poll_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaitConfig {
    #[serde(default = "default_wait_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    #[serde(default = "default_false")]
    pub json: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:0".into()
}
fn default_host() -> String {
    "localhost".into()
}
fn default_key_id() -> String {
    "ed25519:1".into()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_sync_timeout_ms() -> u64 {
    5_000
}
fn default_long_poll_ms() -> u64 {
    1_000
}
fn default_transport_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_wait_timeout_ms() -> u64 {
    5_000
}

impl HarnessConfig {
    /// Load from an optional TOML file, then apply `MESHCHECK_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_toml_str(&fs::read_to_string(path)?)?,
            Some(path) => {
                tracing::info!(
                    "config: '{}' not found, using defaults",
                    path.display()
                );
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`. Unparseable values
    /// are logged and ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MESHCHECK_PEER_BIND_ADDRESS") {
            self.peer.bind_address = value;
        }
        if let Some(value) = lookup("MESHCHECK_PEER_HOST") {
            self.peer.host = value;
        }
        if let Some(value) = lookup("MESHCHECK_PEER_SERVER_NAME") {
            self.peer.server_name = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup("MESHCHECK_PEER_TLS") {
            match value.parse::<bool>() {
                Ok(parsed) => self.peer.tls = parsed,
                Err(_) => tracing::warn!("config: ignoring invalid MESHCHECK_PEER_TLS '{}'", value),
            }
        }
        if let Some(value) = lookup("MESHCHECK_UNEXPECTED_REQUESTS_ARE_ERRORS") {
            match value.parse::<bool>() {
                Ok(parsed) => self.peer.unexpected_requests_are_errors = parsed,
                Err(_) => tracing::warn!(
                    "config: ignoring invalid MESHCHECK_UNEXPECTED_REQUESTS_ARE_ERRORS '{}'",
                    value
                ),
            }
        }
        if let Some(value) = lookup("MESHCHECK_SYNC_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.sync.timeout_ms = parsed;
            }
        }
        if let Some(value) = lookup("MESHCHECK_SYNC_LONG_POLL_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.sync.long_poll_ms = parsed;
            }
        }
        if let Some(value) = lookup("MESHCHECK_SYNC_TRANSPORT_RETRIES") {
            if let Ok(parsed) = value.parse::<u32>() {
                self.sync.transport_retries = parsed.clamp(1, 10);
            }
        }
        if let Some(value) = lookup("MESHCHECK_WAIT_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.wait.timeout_ms = parsed;
            }
        }
        if let Some(value) = lookup("MESHCHECK_LOG_JSON") {
            if let Ok(parsed) = value.parse::<bool>() {
                self.log.json = parsed;
            }
        }
        // "hs1=http://localhost:8008,hs2=http://localhost:8009"
        if let Some(value) = lookup("MESHCHECK_DESTINATIONS") {
            for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                match entry.split_once('=') {
                    Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                        self.destinations
                            .insert(name.trim().to_string(), url.trim().to_string());
                    }
                    _ => tracing::warn!("config: ignoring malformed destination '{}'", entry),
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.peer.bind_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!(
                "peer.bind_address '{}': {e}",
                self.peer.bind_address
            ))
        })?;
        if !self.peer.key_id.starts_with("ed25519:") {
            return Err(ConfigError::Invalid(format!(
                "peer.key_id '{}' must use the ed25519 algorithm",
                self.peer.key_id
            )));
        }
        if self.sync.transport_retries == 0 {
            return Err(ConfigError::Invalid(
                "sync.transport_retries must be at least 1".into(),
            ));
        }
        for (name, url) in &self.destinations {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "destination '{name}' has non-http url '{url}'"
                )));
            }
        }
        Ok(())
    }

    /// Federation base URL for a server under test.
    pub fn destination_url(&self, server_name: &str) -> Option<&str> {
        self.destinations.get(server_name).map(String::as_str)
    }
}
