//! Control plane configuration.

use std::time::Duration;

use crate::error::{ControlError, Result};

/// Upper bound accepted for any configured duration (ten years).
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Configuration for the control plane core.
///
/// The stuck and force-cleanup thresholds are policy, not correctness
/// constants; deployments tune them per environment.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Period of the session reconciler (seconds).
    pub reconcile_interval_seconds: u64,
    /// How long a session may sit in `pending` or `terminating` before the
    /// reconciler acts (seconds).
    pub stuck_threshold_seconds: u64,
    /// How long a stuck session with a disconnected agent is waited on before
    /// being force-resolved (seconds).
    pub force_cleanup_threshold_seconds: u64,
    /// Upper bound on a single send to an agent channel (milliseconds).
    pub dispatch_timeout_ms: u64,
    /// Capacity of each agent's outbound queue.
    pub agent_channel_capacity: usize,
    /// A connection with no heartbeat for this long is swept (seconds).
    pub heartbeat_timeout_seconds: u64,
    /// Interval between `ping` messages on idle agent channels (seconds).
    pub ping_interval_seconds: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: 60,
            stuck_threshold_seconds: 300,         // 5 minutes
            force_cleanup_threshold_seconds: 600, // 10 minutes
            dispatch_timeout_ms: 5000,
            agent_channel_capacity: 64,
            heartbeat_timeout_seconds: 30,
            ping_interval_seconds: 10,
        }
    }
}

impl ControlConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval_seconds = n;
        }
        if let Some(n) = env_parse("STUCK_THRESHOLD_SECS") {
            config.stuck_threshold_seconds = n;
        }
        if let Some(n) = env_parse("FORCE_CLEANUP_THRESHOLD_SECS") {
            config.force_cleanup_threshold_seconds = n;
        }
        if let Some(n) = env_parse("DISPATCH_TIMEOUT_MS") {
            config.dispatch_timeout_ms = n;
        }
        if let Some(n) = env_parse("AGENT_CHANNEL_CAPACITY") {
            config.agent_channel_capacity = n;
        }
        if let Some(n) = env_parse("HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout_seconds = n;
        }
        if let Some(n) = env_parse("PING_INTERVAL_SECS") {
            config.ping_interval_seconds = n;
        }

        config
    }

    /// Check the configuration for values the control plane cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` for zero durations, a zero channel
    /// capacity, out-of-range durations, or a force-cleanup threshold shorter
    /// than the stuck threshold.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("reconcile_interval_seconds", self.reconcile_interval_seconds),
            ("stuck_threshold_seconds", self.stuck_threshold_seconds),
            (
                "force_cleanup_threshold_seconds",
                self.force_cleanup_threshold_seconds,
            ),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
            ("heartbeat_timeout_seconds", self.heartbeat_timeout_seconds),
            ("ping_interval_seconds", self.ping_interval_seconds),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ControlError::Config(format!("{name} must be non-zero")));
            }
            if value > MAX_DURATION_SECS {
                return Err(ControlError::Config(format!("{name} is out of range")));
            }
        }
        if self.agent_channel_capacity == 0 {
            return Err(ControlError::Config(
                "agent_channel_capacity must be non-zero".to_string(),
            ));
        }
        if self.force_cleanup_threshold_seconds < self.stuck_threshold_seconds {
            return Err(ControlError::Config(format!(
                "force_cleanup_threshold_seconds ({}) must not be shorter than stuck_threshold_seconds ({})",
                self.force_cleanup_threshold_seconds, self.stuck_threshold_seconds
            )));
        }
        Ok(())
    }

    /// Reconciler tick period.
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    /// Stuck threshold as a wall-clock offset.
    #[must_use]
    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono_seconds(self.stuck_threshold_seconds)
    }

    /// Force-cleanup threshold as a wall-clock offset.
    #[must_use]
    pub fn force_cleanup_threshold(&self) -> chrono::Duration {
        chrono_seconds(self.force_cleanup_threshold_seconds)
    }

    /// Bound on a single channel send.
    #[must_use]
    pub const fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Heartbeat age after which a connection is swept.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono_seconds(self.heartbeat_timeout_seconds)
    }

    /// Interval between pings on agent channels.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

fn chrono_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(0))
}
