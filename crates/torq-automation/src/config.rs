// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for torq-automation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use torq_core::broadcast::BroadcastConfig;
use torq_core::cache::{ChannelStateConfig, DEFAULT_DOWNTIME_TOLERANCE};

use crate::lightning::RateLimitConfig;
use crate::supervisor::SupervisorConfig;

/// Interval between evaluations of interval and cron triggers.
pub const TRIGGER_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Automation configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON file seeding the in-memory workflow repository
    pub workflows_file: Option<PathBuf>,
    /// Downtime tolerated before channel-state reads report "not ready"
    pub channel_state_downtime_tolerance: Duration,
    /// Supervisor reconcile and readiness re-poll interval
    pub service_poll_interval: Duration,
    /// Back-off after a recorded failure before a service is relaunched
    pub service_failure_backoff: Duration,
    /// Routing policy updates allowed per channel per window
    pub routing_policy_rate_limit_count: usize,
    /// Routing policy rate-limit window
    pub routing_policy_rate_limit_window: Duration,
    /// Per-subscriber buffer of the broadcast
    pub broadcast_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflows_file: None,
            channel_state_downtime_tolerance: DEFAULT_DOWNTIME_TOLERANCE,
            service_poll_interval: Duration::from_secs(1),
            service_failure_backoff: Duration::from_secs(10),
            routing_policy_rate_limit_count: 2,
            routing_policy_rate_limit_window: Duration::from_secs(300),
            broadcast_capacity: 100,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workflows_file = lookup("TORQ_WORKFLOWS_FILE")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            let value: u64 = parse(&lookup, name, default.as_secs())?;
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero".to_string()));
            }
            Ok(Duration::from_secs(value))
        };

        let routing_policy_rate_limit_count = parse(
            &lookup,
            "TORQ_ROUTING_POLICY_RATE_LIMIT_COUNT",
            defaults.routing_policy_rate_limit_count,
        )?;
        let broadcast_capacity = parse(&lookup, "TORQ_BROADCAST_CAPACITY", defaults.broadcast_capacity)?;
        if broadcast_capacity == 0 {
            return Err(ConfigError::Invalid(
                "TORQ_BROADCAST_CAPACITY",
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            workflows_file,
            channel_state_downtime_tolerance: secs(
                "TORQ_CHANNEL_STATE_DOWNTIME_TOLERANCE_SECS",
                defaults.channel_state_downtime_tolerance,
            )?,
            service_poll_interval: secs("TORQ_SERVICE_POLL_INTERVAL_SECS", defaults.service_poll_interval)?,
            service_failure_backoff: secs(
                "TORQ_SERVICE_FAILURE_BACKOFF_SECS",
                defaults.service_failure_backoff,
            )?,
            routing_policy_rate_limit_count,
            routing_policy_rate_limit_window: secs(
                "TORQ_ROUTING_POLICY_RATE_LIMIT_WINDOW_SECS",
                defaults.routing_policy_rate_limit_window,
            )?,
            broadcast_capacity,
        })
    }

    /// Channel-state cache settings.
    pub fn channel_state(&self) -> ChannelStateConfig {
        ChannelStateConfig {
            downtime_tolerance: self.channel_state_downtime_tolerance,
        }
    }

    /// Supervisor settings.
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: self.service_poll_interval,
            failure_backoff: self.service_failure_backoff,
        }
    }

    /// Routing policy rate limiter settings.
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_updates: self.routing_policy_rate_limit_count,
            window: self.routing_policy_rate_limit_window,
        }
    }

    /// Broadcast settings.
    pub fn broadcast(&self) -> BroadcastConfig {
        BroadcastConfig {
            capacity: self.broadcast_capacity,
            ..BroadcastConfig::default()
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, format!("{raw:?}: {e}"))),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.workflows_file.is_none());
        assert_eq!(config.channel_state_downtime_tolerance, Duration::from_secs(15));
        assert_eq!(config.service_poll_interval, Duration::from_secs(1));
        assert_eq!(config.service_failure_backoff, Duration::from_secs(10));
        assert_eq!(config.routing_policy_rate_limit_count, 2);
        assert_eq!(config.routing_policy_rate_limit_window, Duration::from_secs(300));
        assert_eq!(config.broadcast_capacity, 100);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TORQ_WORKFLOWS_FILE", "/tmp/workflows.json"),
            ("TORQ_SERVICE_POLL_INTERVAL_SECS", "5"),
            ("TORQ_ROUTING_POLICY_RATE_LIMIT_COUNT", "4"),
        ]))
        .unwrap();
        assert_eq!(config.workflows_file, Some(PathBuf::from("/tmp/workflows.json")));
        assert_eq!(config.supervisor().poll_interval, Duration::from_secs(5));
        assert_eq!(config.rate_limit().max_updates, 4);
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("TORQ_BROADCAST_CAPACITY", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TORQ_BROADCAST_CAPACITY", _)));

        let err = Config::from_lookup(lookup(&[("TORQ_SERVICE_POLL_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TORQ_SERVICE_POLL_INTERVAL_SECS", _)));
    }
}
