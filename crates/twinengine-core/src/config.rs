//! Engine configuration
//!
//! Configuration comes from two layers: explicit builder calls and
//! `TWINENGINE_*` environment variables (`from_env`). Callers such as the CLI
//! layer their own flags on top.

use std::time::Duration;

use crate::error::{TwinError, TwinResult};
use crate::types::DEFAULT_TYPE_HEADER;

/// Default number of initial-connect attempts
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Reconnection strategy applied after an involuntary disconnect
///
/// The engine reconnects in a background loop; the policy decides how long to
/// wait before each attempt and when to give up. `Immediate` retries
/// unconditionally and forever with no backoff, which produces a tight loop
/// against a persistently unreachable service; `Delayed` is the hardened
/// alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Reconnect immediately and forever
    Immediate,
    /// Fixed delay between attempts, optionally bounded
    Delayed {
        /// Wait before each attempt
        delay: Duration,
        /// Give up after this many attempts (`None` = unbounded)
        max_attempts: Option<u32>,
    },
    /// Never reconnect automatically
    Never,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// when the policy says to stop
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Immediate => Some(Duration::ZERO),
            ReconnectPolicy::Delayed {
                delay,
                max_attempts,
            } => match max_attempts {
                Some(max) if attempt > *max => None,
                _ => Some(*delay),
            },
            ReconnectPolicy::Never => None,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Immediate
    }
}

/// Configuration for a [`TwinEngine`](crate::engine::TwinEngine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bounded retry count for the initial connect
    pub connect_attempts: u32,
    /// Header name carrying the telemetry message type
    pub type_header: String,
    /// Strategy for automatic reconnection
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            type_header: DEFAULT_TYPE_HEADER.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial-connect attempt count (minimum 1)
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Set the telemetry type header name
    pub fn with_type_header(mut self, header: impl Into<String>) -> Self {
        self.type_header = header.into();
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Build configuration from `TWINENGINE_*` environment variables
    ///
    /// Recognized keys, all optional:
    /// - `TWINENGINE_CONNECT_ATTEMPTS` — initial-connect retry count
    /// - `TWINENGINE_TYPE_HEADER` — telemetry type header name
    /// - `TWINENGINE_RECONNECT_DELAY_MS` — switches to the delayed policy
    /// - `TWINENGINE_RECONNECT_MAX_ATTEMPTS` — bounds the delayed policy
    ///
    /// # Errors
    ///
    /// Returns `TwinError::Configuration` if a set variable fails to parse.
    pub fn from_env() -> TwinResult<Self> {
        let mut config = Self::default();

        if let Some(attempts) = env_parse::<u32>("TWINENGINE_CONNECT_ATTEMPTS")? {
            config.connect_attempts = attempts.max(1);
        }
        if let Ok(header) = std::env::var("TWINENGINE_TYPE_HEADER") {
            if !header.is_empty() {
                config.type_header = header;
            }
        }
        if let Some(delay_ms) = env_parse::<u64>("TWINENGINE_RECONNECT_DELAY_MS")? {
            let max_attempts = env_parse::<u32>("TWINENGINE_RECONNECT_MAX_ATTEMPTS")?;
            config.reconnect = ReconnectPolicy::Delayed {
                delay: Duration::from_millis(delay_ms),
                max_attempts,
            };
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> TwinResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| TwinError::Configuration(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.type_header, "x-message-type");
        assert_eq!(config.reconnect, ReconnectPolicy::Immediate);
    }

    #[test]
    fn test_builder_overrides() {
        let config = EngineConfig::new()
            .with_connect_attempts(5)
            .with_type_header("msg-kind")
            .with_reconnect(ReconnectPolicy::Never);
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.type_header, "msg-kind");
        assert_eq!(config.reconnect, ReconnectPolicy::Never);
    }

    #[test]
    fn test_connect_attempts_floor_is_one() {
        let config = EngineConfig::new().with_connect_attempts(0);
        assert_eq!(config.connect_attempts, 1);
    }

    #[test]
    fn test_immediate_policy_never_stops() {
        let policy = ReconnectPolicy::Immediate;
        assert_eq!(policy.next_delay(1), Some(Duration::ZERO));
        assert_eq!(policy.next_delay(10_000), Some(Duration::ZERO));
    }

    #[test]
    fn test_delayed_policy_bounds_attempts() {
        let policy = ReconnectPolicy::Delayed {
            delay: Duration::from_millis(100),
            max_attempts: Some(2),
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_never_policy() {
        assert_eq!(ReconnectPolicy::Never.next_delay(1), None);
    }
}
