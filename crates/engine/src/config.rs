//! Engine configuration.
//!
//! Defaults are usable as-is; `from_env` overlays `AGENTJOBS_*` variables.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use agentjobs_core::WorkerId;

use crate::checkpoint::CheckpointPolicy;
use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "AGENTJOBS_";

/// Upper bound for every configured duration.
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease owner identity of this process
    pub worker_id: WorkerId,
    /// Must cover one checkpoint interval and stay below the trigger period
    pub lease_ttl: Duration,
    /// Handler deadline is lease expiry minus this margin
    pub deadline_margin: Duration,
    /// Candidates scanned per trigger
    pub batch_size: usize,
    /// Concurrent executions per dispatcher
    pub max_concurrent: usize,
    /// Period of the in-process trigger
    pub trigger_interval: Duration,
    pub retry: RetryPolicy,
    pub checkpoint: CheckpointPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(),
            lease_ttl: Duration::from_secs(120),
            deadline_margin: Duration::from_secs(10),
            batch_size: 32,
            max_concurrent: 4,
            trigger_interval: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `AGENTJOBS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `AGENTJOBS_*` key. Missing keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(id) = env.get("WORKER_ID") {
            config.worker_id = id.parse().map_err(|e: agentjobs_core::DomainError| {
                invalid("WORKER_ID", &id, e.to_string())
            })?;
        }
        if let Some(secs) = env.parse::<u64>("LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("DEADLINE_MARGIN_SECS")? {
            config.deadline_margin = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse::<usize>("BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(n) = env.parse::<usize>("MAX_CONCURRENT")? {
            config.max_concurrent = n;
        }
        if let Some(secs) = env.parse::<u64>("TRIGGER_INTERVAL_SECS")? {
            config.trigger_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse::<u64>("RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("RETRY_MAX_DELAY_SECS")? {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse::<u32>("MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(n) = env.parse::<u32>("CHECKPOINT_EVERY_STEPS")? {
            config.checkpoint.every_steps = n;
        }
        if let Some(secs) = env.parse::<u64>("CHECKPOINT_EVERY_SECS")? {
            config.checkpoint.every = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("lease ttl", self.lease_ttl),
            ("deadline margin", self.deadline_margin),
            ("trigger interval", self.trigger_interval),
            ("retry base delay", self.retry.base_delay),
            ("retry max delay", self.retry.max_delay),
            ("checkpoint interval", self.checkpoint.every),
        ];
        for (name, value) in durations {
            if value > MAX_CONFIGURED_DURATION {
                return Err(ConfigError::Inconsistent(format!(
                    "{name} {value:?} exceeds the limit of {MAX_CONFIGURED_DURATION:?}"
                )));
            }
        }
        if self.deadline_margin >= self.lease_ttl {
            return Err(ConfigError::Inconsistent(format!(
                "deadline margin {:?} must be shorter than lease ttl {:?}",
                self.deadline_margin, self.lease_ttl
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Inconsistent("batch size must be at least 1".into()));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Inconsistent("max concurrent must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent("max attempts must be at least 1".into()));
        }
        if self.lease_ttl >= self.trigger_interval {
            warn!(
                lease_ttl = ?self.lease_ttl,
                trigger_interval = ?self.trigger_interval,
                "lease ttl not shorter than trigger interval; crashed jobs wait an extra cycle"
            );
        }
        Ok(())
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| invalid(key, &raw, e.to_string())),
            None => Ok(None),
        }
    }
}

fn invalid(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
        reason,
    }
}
