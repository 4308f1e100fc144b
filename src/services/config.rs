//! Runtime configuration with hierarchical loading.
//!
//! Precedence (lowest to highest): programmatic defaults, project config
//! (`.overmind/config.yaml`), local overrides (`.overmind/local.yaml`),
//! then `OVERMIND_*` environment variables. Configuration is always
//! project-local so multiple runtimes can coexist on one machine.

use anyhow::{Context as _, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::task::{LoopDetectionConf, RunConf};

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid poll_interval_ms: {0}. Must be greater than 0")]
    InvalidPollInterval(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid loop detection window: {0}. Must be greater than 0")]
    InvalidLoopWindow(usize),

    #[error("Invalid loop threshold: {0}. Must be at least 2")]
    InvalidLoopThreshold(usize),
}

/// Runner loop knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How often the loop re-checks external status while idle (ms).
    pub poll_interval_ms: u64,
    /// Default wall-clock budget per task; 0 means unlimited (ms).
    pub default_timeout_ms: u64,
    /// Default dispatched-message budget per task; 0 means unlimited.
    pub default_max_steps: u64,
    /// Deadline for group/RPC-style node waits (ms).
    pub node_wait_timeout_ms: u64,
    /// Grace period for draining background handler tasks at shutdown (ms).
    pub drain_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            default_timeout_ms: 0,
            default_max_steps: 0,
            node_wait_timeout_ms: 60_000,
            drain_timeout_ms: 2_000,
        }
    }
}

/// Logging knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter.
    pub level: String,
    /// Output format.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runner loop knobs.
    pub runner: RunnerConfig,
    /// Endless-loop detection knobs.
    pub loop_detection: LoopDetectionConf,
    /// Logging knobs.
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Derive a per-task [`RunConf`] from these defaults.
    pub fn run_conf(&self) -> RunConf {
        RunConf {
            timeout_ms: self.runner.default_timeout_ms,
            max_steps: self.runner.default_max_steps,
            node_wait_timeout_ms: self.runner.node_wait_timeout_ms,
            loop_detection: self.loop_detection.clone(),
        }
    }

    /// Sample YAML for `overmind init`-style scaffolding.
    pub fn sample_yaml() -> String {
        serde_yaml::to_string(&RuntimeConfig::default()).unwrap_or_default()
    }
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .overmind/config.yaml (project config)
    /// 3. .overmind/local.yaml (local overrides, optional)
    /// 4. Environment variables (OVERMIND_* prefix, highest priority)
    pub fn load() -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(".overmind/config.yaml"))
            .merge(Yaml::file(".overmind/local.yaml"))
            .merge(Env::prefixed("OVERMIND_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &RuntimeConfig) -> Result<(), ConfigError> {
        if config.runner.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval(
                config.runner.poll_interval_ms,
            ));
        }

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }

        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }

        if config.loop_detection.window == 0 {
            return Err(ConfigError::InvalidLoopWindow(config.loop_detection.window));
        }
        if config.loop_detection.enabled {
            for threshold in [
                config.loop_detection.single_repeat_threshold,
                config.loop_detection.pair_repeat_threshold,
            ] {
                if threshold < 2 {
                    return Err(ConfigError::InvalidLoopThreshold(threshold));
                }
            }
        }

        Ok(())
    }
}
