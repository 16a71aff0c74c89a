//! Proxy configuration.
//!
//! One TOML file configures both the listener and the admission pipeline:
//!
//! ```toml
//! listen = "0.0.0.0:25565"
//! backend = "127.0.0.1:25566"
//!
//! [shield.limiter]
//! max_events_per_window = 10
//!
//! [shield.detection]
//! failure_policy = "fail_open"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bastion_admission::ShieldConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Configuration for the proxy binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to accept player connections on.
    pub listen: SocketAddr,
    /// Protected backend, as `host:port`.
    pub backend: String,
    /// Maximum concurrent connections, admitted or pending.
    pub max_connections: usize,
    /// Time allowed to connect to the backend.
    pub backend_connect_timeout_ms: u64,
    /// Forwarded sessions with no traffic for this long are closed.
    pub idle_timeout_ms: u64,
    /// Interval between maintenance sweeps.
    pub sweep_interval_ms: u64,
    /// Admission pipeline settings.
    pub shield: ShieldConfig,
}

impl ProxyConfig {
    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml(content: &str) -> ProxyResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> ProxyResult<String> {
        toml::to_string_pretty(self).map_err(|e| ProxyError::Config(format!("cannot serialize: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.backend.trim().is_empty() {
            return Err(ProxyError::Config("backend cannot be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ProxyError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("backend_connect_timeout_ms", self.backend_connect_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(ProxyError::Config(format!("{name} cannot be zero")));
            }
        }
        self.shield.validate()?;
        Ok(())
    }

    /// Backend connect timeout.
    #[must_use]
    pub const fn backend_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_connect_timeout_ms)
    }

    /// Idle timeout for forwarded sessions.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 25565)),
            backend: "127.0.0.1:25566".to_string(),
            max_connections: 4096,
            backend_connect_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
            sweep_interval_ms: 10_000,
            shield: ShieldConfig::default(),
        }
    }
}
