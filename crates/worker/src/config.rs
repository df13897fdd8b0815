//! Worker pool configuration.
//!
//! Loaded from TOML or the environment. Every field can be overridden with a
//! `SLUICE_WORKER_*` variable; values are validated after overrides apply.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of tasks dispatched and awaiting a response.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long the execution context may take to report ready.
    #[serde(default = "default_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Once dispatch or responses finish, how long the other side may take.
    /// Zero disables.
    #[serde(default = "default_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// Per-task response deadline. Zero disables.
    #[serde(default)]
    pub task_timeout_ms: u64,

    /// How long to wait for the terminate handshake and context exit.
    #[serde(default = "default_timeout_ms")]
    pub terminate_timeout_ms: u64,

    /// Frame buffer between the pool and its context.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            init_timeout_ms: default_timeout_ms(),
            completion_timeout_ms: default_timeout_ms(),
            task_timeout_ms: 0,
            terminate_timeout_ms: default_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl PoolConfig {
    /// Defaults with `concurrency` set.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults overridden by the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `SLUICE_WORKER_*` overrides. Unparseable values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| -> Option<u64> { lookup(key).and_then(|v| parse_trimmed(&v)) };
        let counted = |key: &str| -> Option<usize> { lookup(key).and_then(|v| parse_trimmed(&v)) };

        if let Some(v) = counted("SLUICE_WORKER_CONCURRENCY") {
            self.concurrency = v;
        }
        if let Some(v) = parsed("SLUICE_WORKER_INIT_TIMEOUT_MS") {
            self.init_timeout_ms = v;
        }
        if let Some(v) = parsed("SLUICE_WORKER_COMPLETION_TIMEOUT_MS") {
            self.completion_timeout_ms = v;
        }
        if let Some(v) = parsed("SLUICE_WORKER_TASK_TIMEOUT_MS") {
            self.task_timeout_ms = v;
        }
        if let Some(v) = parsed("SLUICE_WORKER_TERMINATE_TIMEOUT_MS") {
            self.terminate_timeout_ms = v;
        }
        if let Some(v) = counted("SLUICE_WORKER_CHANNEL_CAPACITY") {
            self.channel_capacity = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be greater than 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be greater than 0".into()));
        }
        if self.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid("init_timeout_ms must be greater than 0".into()));
        }
        if self.terminate_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "terminate_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

fn parse_trimmed<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_toml_uses_defaults() {
        let config: PoolConfig = toml::from_str("").unwrap();
        assert_eq!(config, PoolConfig::default());
        assert_eq!(config.init_timeout(), Duration::from_secs(5));
        assert!(config.task_timeout().is_zero());
    }

    #[test]
    fn toml_fields_are_read() {
        let config: PoolConfig = toml::from_str(
            r#"
concurrency = 12
task_timeout_ms = 250
channel_capacity = 8
"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 12);
        assert_eq!(config.task_timeout(), Duration::from_millis(250));
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.terminate_timeout_ms, 5000);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = PoolConfig::with_concurrency(0).validate().unwrap_err();
        assert_eq!(err.to_string(), "config error: concurrency must be greater than 0");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = toml::from_str::<PoolConfig>("concurrency = \"many\"")
            .map_err(ConfigError::from)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn overrides_replace_parsed_values() {
        let env = HashMap::from([
            ("SLUICE_WORKER_CONCURRENCY", "3"),
            ("SLUICE_WORKER_TASK_TIMEOUT_MS", " 900 "),
            ("SLUICE_WORKER_INIT_TIMEOUT_MS", "soon"),
        ]);
        let mut config = PoolConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.concurrency, 3);
        assert_eq!(config.task_timeout_ms, 900);
        // Unparseable values leave the field alone.
        assert_eq!(config.init_timeout_ms, 5000);
    }

    #[test]
    fn count_overrides_out_of_range_are_ignored() {
        let env = HashMap::from([
            ("SLUICE_WORKER_CHANNEL_CAPACITY", "340282366920938463463374607431768211456"),
            ("SLUICE_WORKER_CONCURRENCY", "-2"),
        ]);
        let mut config = PoolConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.concurrency, 4);
    }
}
