// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collectives configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/collectives.toml
//! 3. TOML file from the `DYN_COLLECTIVES_CONFIG_PATH` environment variable
//! 4. Environment variables (`DYN_COLLECTIVES_*` prefixed)
//!
//! The engine consumes a validated [`CollectivesConfig`] value; nothing outside
//! this module parses configuration.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV used to point at a TOML configuration file
const CONFIG_PATH_ENV: &str = "DYN_COLLECTIVES_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/collectives.toml";

/// Default tensor fusion threshold (64 MiB)
pub const DEFAULT_FUSION_THRESHOLD_BYTES: usize = 64 * 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Cannot open timeline {}: {source}", .path.display())]
    Timeline {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level collectives configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CollectivesConfig {
    /// Length of one coordination cycle in milliseconds.
    #[validate(range(min = 0.01, max = 60000.0))]
    pub cycle_time_ms: f64,

    /// Upper bound on the payload of one fused batch. Zero disables fusion.
    pub fusion_threshold_bytes: usize,

    /// Number of negotiated plans to memoize. Zero disables the plan cache.
    pub cache_capacity: usize,

    /// Use the node-local/cross-node allreduce when running on more than one node.
    #[serde(default)]
    pub hierarchical_allreduce: bool,

    /// Use the node-local/cross-node allgather when running on more than one node.
    #[serde(default)]
    pub hierarchical_allgather: bool,

    /// Sleep granularity while polling producer readiness, in microseconds.
    #[validate(range(min = 1, max = 1_000_000))]
    pub ready_poll_interval_us: u64,

    #[validate(nested)]
    #[serde(default)]
    pub timeline: TimelineConfig,

    #[validate(nested)]
    #[serde(default)]
    pub stall_check: StallCheckConfig,
}

/// Chrome-trace timeline output, written by the coordinator rank.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct TimelineConfig {
    /// Output file. None = timeline disabled.
    pub path: Option<PathBuf>,

    /// Emit a marker at the start of every cycle.
    #[serde(default)]
    pub mark_cycles: bool,
}

/// Coordinator-side detection of operations that only some ranks submitted.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StallCheckConfig {
    pub enabled: bool,

    #[validate(range(min = 1))]
    pub warning_secs: u64,
}

impl Default for StallCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_secs: 60,
        }
    }
}

impl StallCheckConfig {
    pub fn warning_time(&self) -> Duration {
        Duration::from_secs(self.warning_secs)
    }
}

impl Default for CollectivesConfig {
    fn default() -> Self {
        Self {
            cycle_time_ms: 5.0,
            fusion_threshold_bytes: DEFAULT_FUSION_THRESHOLD_BYTES,
            cache_capacity: 1024,
            hierarchical_allreduce: false,
            hierarchical_allgather: false,
            ready_poll_interval_us: 50,
            timeline: TimelineConfig::default(),
            stall_check: StallCheckConfig::default(),
        }
    }
}

impl CollectivesConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(CollectivesConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // Timeline config: DYN_COLLECTIVES_TIMELINE_PATH, DYN_COLLECTIVES_TIMELINE_MARK_CYCLES
            .merge(
                Env::prefixed("DYN_COLLECTIVES_TIMELINE_")
                    .map(|k| format!("timeline.{}", k.as_str().to_lowercase()).into()),
            )
            // Stall check config: DYN_COLLECTIVES_STALL_CHECK_ENABLED, DYN_COLLECTIVES_STALL_CHECK_WARNING_SECS
            .merge(
                Env::prefixed("DYN_COLLECTIVES_STALL_CHECK_")
                    .map(|k| format!("stall_check.{}", k.as_str().to_lowercase()).into()),
            )
            // Top-level knobs: DYN_COLLECTIVES_CYCLE_TIME_MS, DYN_COLLECTIVES_FUSION_THRESHOLD_BYTES, ...
            .merge(
                Env::prefixed("DYN_COLLECTIVES_")
                    .ignore(&["CONFIG_PATH"])
                    .filter(|k| {
                        let k = k.as_str().to_lowercase();
                        !k.starts_with("timeline_") && !k.starts_with("stall_check_")
                    })
                    .map(|k| k.as_str().to_lowercase().into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = CollectivesConfig::extract_from(
    ///     CollectivesConfig::figment()
    ///         .merge(("cycle_time_ms", 1.0))
    ///         .merge(("cache_capacity", 0usize))
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Load configuration merging JSON overrides with the highest priority.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }

    pub fn cycle_time(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_time_ms / 1000.0)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_micros(self.ready_poll_interval_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = CollectivesConfig::default();
        assert_eq!(config.cycle_time(), Duration::from_millis(5));
        assert_eq!(config.fusion_threshold_bytes, 64 * 1024 * 1024);
        assert_eq!(config.cache_capacity, 1024);
        assert!(!config.hierarchical_allreduce);
        assert!(config.timeline.path.is_none());
        assert!(config.stall_check.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("DYN_COLLECTIVES_CYCLE_TIME_MS", "2.5");
            jail.set_env("DYN_COLLECTIVES_CACHE_CAPACITY", "0");
            jail.set_env("DYN_COLLECTIVES_HIERARCHICAL_ALLREDUCE", "true");
            jail.set_env("DYN_COLLECTIVES_TIMELINE_PATH", "/tmp/timeline.json");
            jail.set_env("DYN_COLLECTIVES_STALL_CHECK_WARNING_SECS", "5");

            let config = CollectivesConfig::from_env().expect("config");
            assert_eq!(config.cycle_time_ms, 2.5);
            assert_eq!(config.cache_capacity, 0);
            assert!(config.hierarchical_allreduce);
            assert_eq!(
                config.timeline.path,
                Some(PathBuf::from("/tmp/timeline.json"))
            );
            assert_eq!(config.stall_check.warning_secs, 5);
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_from_env_path() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "collectives.toml",
                r#"
                fusion_threshold_bytes = 1024
                [timeline]
                mark_cycles = true
                "#,
            )?;
            jail.set_env("DYN_COLLECTIVES_CONFIG_PATH", "collectives.toml");

            let config = CollectivesConfig::from_env().expect("config");
            assert_eq!(config.fusion_threshold_bytes, 1024);
            assert!(config.timeline.mark_cycles);
            Ok(())
        });
    }

    #[test]
    fn test_json_overrides_win() {
        let config =
            CollectivesConfig::from_figment_with_json(r#"{"cycle_time_ms": 1.0}"#).unwrap();
        assert_eq!(config.cycle_time(), Duration::from_millis(1));
    }

    #[test]
    fn test_validation_rejects_zero_cycle_time() {
        let result =
            CollectivesConfig::extract_from(CollectivesConfig::figment_with(("cycle_time_ms", 0.0)));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
