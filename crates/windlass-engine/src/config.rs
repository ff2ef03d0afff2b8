//! Runtime configuration for engine components.
//!
//! All configuration is injected through [`EngineConfig`]; no component reads
//! process-wide globals. The environment loader validates strictly so a typo
//! fails startup rather than silently falling back.

use chrono::Duration;

use crate::error::{Error, Result};

const ENV_HISTORY_TABLE: &str = "WINDLASS_HISTORY_TABLE";
const ENV_QUEUE_NAME: &str = "WINDLASS_QUEUE_NAME";
const ENV_TIMER_QUEUE_NAME: &str = "WINDLASS_TIMER_QUEUE_NAME";
const ENV_SHORT_TIMER_THRESHOLD_SECS: &str = "WINDLASS_SHORT_TIMER_THRESHOLD_SECS";
const ENV_WORKER_HEARTBEAT_GRACE_SECS: &str = "WINDLASS_WORKER_HEARTBEAT_GRACE_SECS";
const ENV_ROUTER_MAX_ATTEMPTS: &str = "WINDLASS_ROUTER_MAX_ATTEMPTS";

const DEFAULT_SHORT_TIMER_THRESHOLD_SECS: u64 = 120;
const DEFAULT_WORKER_HEARTBEAT_GRACE_SECS: u64 = 10;
const DEFAULT_ROUTER_MAX_ATTEMPTS: u64 = 3;

/// Engine-wide runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name of the history table / blob prefix (backend-specific).
    pub history_table: String,
    /// Name of the workflow-task queue.
    pub queue_name: String,
    /// Name of the timer delivery queue.
    pub timer_queue_name: String,
    /// Timers at or under this duration use the in-process short tier.
    pub short_timer_threshold: Duration,
    /// Grace added on top of a task's heartbeat window before it is failed.
    pub worker_heartbeat_grace: Duration,
    /// Maximum delivery attempts per subscriber before dead-lettering.
    pub router_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_table: "windlass-history".into(),
            queue_name: "windlass-tasks".into(),
            timer_queue_name: "windlass-timers".into(),
            short_timer_threshold: Duration::seconds(
                i64::try_from(DEFAULT_SHORT_TIMER_THRESHOLD_SECS).unwrap_or(120),
            ),
            worker_heartbeat_grace: Duration::seconds(
                i64::try_from(DEFAULT_WORKER_HEARTBEAT_GRACE_SECS).unwrap_or(10),
            ),
            router_max_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment with strict
    /// validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is present but
    /// not a positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is present but
    /// not a positive integer.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let short_timer_threshold_secs = parse_positive_u64_env(
            &get_env,
            ENV_SHORT_TIMER_THRESHOLD_SECS,
            DEFAULT_SHORT_TIMER_THRESHOLD_SECS,
        )?;
        let heartbeat_grace_secs = parse_positive_u64_env(
            &get_env,
            ENV_WORKER_HEARTBEAT_GRACE_SECS,
            DEFAULT_WORKER_HEARTBEAT_GRACE_SECS,
        )?;
        let router_max_attempts = parse_positive_u64_env(
            &get_env,
            ENV_ROUTER_MAX_ATTEMPTS,
            DEFAULT_ROUTER_MAX_ATTEMPTS,
        )?;

        Ok(Self {
            history_table: get_env(ENV_HISTORY_TABLE).unwrap_or(defaults.history_table),
            queue_name: get_env(ENV_QUEUE_NAME).unwrap_or(defaults.queue_name),
            timer_queue_name: get_env(ENV_TIMER_QUEUE_NAME).unwrap_or(defaults.timer_queue_name),
            short_timer_threshold: duration_secs(
                short_timer_threshold_secs,
                ENV_SHORT_TIMER_THRESHOLD_SECS,
            )?,
            worker_heartbeat_grace: duration_secs(
                heartbeat_grace_secs,
                ENV_WORKER_HEARTBEAT_GRACE_SECS,
            )?,
            router_max_attempts: u32::try_from(router_max_attempts).map_err(|_| {
                Error::configuration(format!(
                    "{ENV_ROUTER_MAX_ATTEMPTS} value {router_max_attempts} exceeds supported range"
                ))
            })?,
        })
    }
}

fn duration_secs(secs: u64, key: &str) -> Result<Duration> {
    i64::try_from(secs).map(Duration::seconds).map_err(|_| {
        Error::configuration(format!("{key} value {secs} exceeds supported range"))
    })
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_is_empty() {
        let config = EngineConfig::from_env_with(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = EngineConfig::from_env_with(|key| match key {
            ENV_QUEUE_NAME => Some("orders-queue".to_string()),
            ENV_SHORT_TIMER_THRESHOLD_SECS => Some("300".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.queue_name, "orders-queue");
        assert_eq!(config.short_timer_threshold, Duration::seconds(300));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let result = EngineConfig::from_env_with(|key| {
            (key == ENV_SHORT_TIMER_THRESHOLD_SECS).then(|| "0".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn non_numeric_threshold_is_rejected() {
        let result = EngineConfig::from_env_with(|key| {
            (key == ENV_ROUTER_MAX_ATTEMPTS).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
