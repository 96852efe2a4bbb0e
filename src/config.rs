//! Persisted configuration.
//!
//! Stored as TOML in `~/.config/upctl/config.toml` (or `$UPCTL_CONFIG`).
//! A missing file is not an error: every key has a default, and an absent
//! endpoint just means the session reports "not configured".

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "UPCTL_CONFIG";

/// Default bound on a single remote call (pause, register, ...)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;

/// Default bound on spawning the worker and completing the handshake
pub const DEFAULT_BIND_TIMEOUT_MS: u64 = 10_000;

/// Default capacity of the controller's inbound queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Upload endpoint address, `host[:port]`.
///
/// Only syntactic validity matters here; the worker is the one that
/// actually talks to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let rest = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        if rest.is_empty() {
            return Err(Error::Config("endpoint is empty".to_string()));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port in endpoint: {}", raw)))?;
                if port == 0 {
                    return Err(Error::Config(format!("port 0 in endpoint: {}", raw)));
                }
                (host, Some(port))
            }
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("missing host in endpoint: {}", raw)));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
            return Err(Error::Config(format!("invalid host in endpoint: {}", raw)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Where the worker lives. `address` (a running worker) wins over
/// `program` (spawn one).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// `host:port` of a worker already listening
    pub address: Option<String>,
    /// Worker executable
    pub program: Option<PathBuf>,
    /// Extra arguments passed to the worker
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upload endpoint, `host[:port]`
    pub endpoint: Option<String>,
    pub worker: WorkerConfig,
    pub call_timeout_ms: u64,
    pub bind_timeout_ms: u64,
    pub queue_capacity: usize,
    /// Reconnect this long after an unexpected disconnect. Absent = wait
    /// for the next `start()`.
    pub reconnect_delay_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            worker: WorkerConfig::default(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            bind_timeout_ms: DEFAULT_BIND_TIMEOUT_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_delay_ms: None,
        }
    }
}

impl Config {
    /// Default config location (`~/.config/upctl/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("upctl").join("config.toml"))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from the default location.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        if config.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        Ok(config)
    }

    /// Parsed endpoint, `None` when missing or syntactically invalid.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
            .as_deref()
            .and_then(|raw| Endpoint::parse(raw).ok())
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint().is_some()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay_ms.map(Duration::from_millis)
    }
}
