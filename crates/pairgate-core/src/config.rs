//! Configuration types for pairgate

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Origins accepted by default, on top of whatever the deployment adds
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "https://localhost:3000",
];

/// Main configuration for pairgate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port
    pub port: u16,
    /// How long a pairing artifact stays valid after issue
    pub artifact_ttl: Duration,
    /// Delay before restarting a session after a non-terminal close
    pub reconnect_backoff: Duration,
    /// Upper bound on a single transport open
    pub connect_timeout: Duration,
    /// Upper bound on each best-effort teardown step (logout, close)
    pub teardown_timeout: Duration,
    /// How long the QR endpoint waits for a fresh artifact
    pub artifact_wait_timeout: Duration,
    /// Polling interval of that wait
    pub artifact_poll_interval: Duration,
    /// Directory holding per-tenant credential files
    pub credentials_dir: PathBuf,
    /// Exact origins or `*.suffix` patterns accepted for cross-origin requests
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            artifact_ttl: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(1500),
            connect_timeout: Duration::from_secs(20),
            teardown_timeout: Duration::from_secs(5),
            artifact_wait_timeout: Duration::from_secs(5),
            artifact_poll_interval: Duration::from_millis(250),
            credentials_dir: default_credentials_dir(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// `<config dir>/pairgate/auth`, falling back to `./auth_info`
fn default_credentials_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("pairgate").join("auth"))
        .unwrap_or_else(|| PathBuf::from("auth_info"))
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set artifact TTL
    pub fn with_artifact_ttl(mut self, ttl: Duration) -> Self {
        self.artifact_ttl = ttl;
        self
    }

    /// Builder pattern: set reconnect backoff
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Builder pattern: set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder pattern: set teardown timeout
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Builder pattern: set the artifact wait used by the QR endpoint
    pub fn with_artifact_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.artifact_wait_timeout = timeout;
        self.artifact_poll_interval = poll_interval;
        self
    }

    /// Builder pattern: set credentials directory
    pub fn with_credentials_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credentials_dir = dir.into();
        self
    }

    /// Builder pattern: add allowed origins (defaults are kept)
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for origin in origins {
            let origin = origin.into();
            let origin = origin.trim();
            if !origin.is_empty() && !self.allowed_origins.iter().any(|o| o == origin) {
                self.allowed_origins.push(origin.to_string());
            }
        }
        self
    }

    /// Reject values the lifecycle controller cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.artifact_ttl.is_zero() {
            return Err(crate::Error::Config("artifact TTL must be non-zero".into()));
        }
        if self.artifact_poll_interval.is_zero() {
            return Err(crate::Error::Config(
                "artifact poll interval must be non-zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(crate::Error::Config("connect timeout must be non-zero".into()));
        }
        Ok(())
    }
}
