use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DaemonError;
use crate::paths;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 65432;
/// How long each poll cycle waits for a client before refreshing snapshots.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 2_000;
/// Upper bound on one client exchange. `0` removes the bound.
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 30_000;

/// Daemon configuration. Deserialized from [`paths::config_file_path`]
/// and overridable from the command line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Interface the command socket listens on.
    pub host: String,
    /// TCP port of the command socket; `0` picks an ephemeral port.
    pub port: u16,
    pub accept_timeout_ms: u64,
    pub client_timeout_ms: u64,
    /// Activity log that transitions are appended to and served from.
    pub log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
            client_timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
            log_path: paths::default_log_path(),
        }
    }
}

impl Config {
    /// Rejects settings the poll loop cannot run with. A zero accept timeout
    /// would take a full process snapshot on every spin of the loop.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.accept_timeout_ms == 0 {
            return Err(DaemonError::InvalidConfig(
                "accept_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves `host:port` to the first matching socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, DaemonError> {
        let spec = format!("{}:{}", self.host, self.port);
        spec.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(DaemonError::InvalidAddress(spec))
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// `None` when client exchanges are unbounded.
    pub fn client_timeout(&self) -> Option<Duration> {
        (self.client_timeout_ms > 0).then(|| Duration::from_millis(self.client_timeout_ms))
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}
