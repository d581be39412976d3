//! Gateway configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the gateway process.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "GatewayConfig::default_listen_addr")]
    pub listen_addr: String,

    /// `RocksDB` data directory.
    #[serde(default = "GatewayConfig::default_data_dir")]
    pub data_dir: String,

    /// Allowed CORS origins for UI clients.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Request timeout in seconds. Upgraded WebSockets are not bound by it.
    #[serde(default = "GatewayConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl GatewayConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_data_dir() -> String {
        "/data/streamspace".to_string()
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    /// Defaults overridden by `LISTEN_ADDR` and `DATA_DIR`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = dir;
        }
        config
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            data_dir: Self::default_data_dir(),
            cors_origins: vec!["*".to_string()],
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}
