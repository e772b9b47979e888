// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process group configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `DYN_PG_CONFIG_PATH` environment variable
//! 3. Environment variables (`DYN_PG_*` prefixed)

use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::FailurePolicy;

const ENV_PREFIX: &str = "DYN_PG_";
const ENV_CONFIG_PATH: &str = "DYN_PG_CONFIG_PATH";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Tunables for rendezvous, task waiting and failure handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_retry_window"))]
pub struct ProcessGroupConfig {
    /// Prefix of every rendezvous key. Groups sharing a store must use
    /// distinct ids.
    ///
    /// Default: "pg"
    #[serde(default = "default_group_id")]
    #[validate(length(min = 1))]
    pub group_id: String,

    /// How long a non-root rank polls for unique ids before giving up.
    ///
    /// Default: 300000ms
    #[serde(default = "default_rendezvous_timeout_ms")]
    #[validate(range(min = 1))]
    pub rendezvous_timeout_ms: u64,

    /// Initial polling interval. Doubles after every miss.
    ///
    /// Default: 10ms
    #[serde(default = "default_rendezvous_retry_ms")]
    #[validate(range(min = 1))]
    pub rendezvous_retry_ms: u64,

    /// Upper bound on the polling interval.
    ///
    /// Default: 1000ms
    #[serde(default = "default_rendezvous_max_retry_ms")]
    #[validate(range(min = 1))]
    pub rendezvous_max_retry_ms: u64,

    /// Timeout used by `Task::wait_default` and `Task::synchronize`.
    ///
    /// Default: 1800000ms (30 minutes)
    #[serde(default = "default_wait_timeout_ms")]
    #[validate(range(min = 1))]
    pub wait_timeout_ms: u64,

    /// Interval between completion checks while waiting on a task.
    ///
    /// Default: 100us
    #[serde(default = "default_wait_poll_interval_us")]
    #[validate(range(min = 1, max = 1000000))]
    pub wait_poll_interval_us: u64,

    /// What to do with setup and backend failures.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for ProcessGroupConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
            rendezvous_retry_ms: default_rendezvous_retry_ms(),
            rendezvous_max_retry_ms: default_rendezvous_max_retry_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            wait_poll_interval_us: default_wait_poll_interval_us(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_group_id() -> String {
    "pg".to_string()
}

fn default_rendezvous_timeout_ms() -> u64 {
    300_000
}

fn default_rendezvous_retry_ms() -> u64 {
    10
}

fn default_rendezvous_max_retry_ms() -> u64 {
    1000
}

fn default_wait_timeout_ms() -> u64 {
    1_800_000
}

fn default_wait_poll_interval_us() -> u64 {
    100
}

fn validate_retry_window(config: &ProcessGroupConfig) -> Result<(), ValidationError> {
    if config.rendezvous_retry_ms > config.rendezvous_max_retry_ms {
        let mut err = ValidationError::new("retry_window");
        err.message = Some("rendezvous_retry_ms exceeds rendezvous_max_retry_ms".into());
        return Err(err);
    }
    Ok(())
}

impl ProcessGroupConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(ENV_CONFIG_PATH).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(ProcessGroupConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config_path"]))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = ProcessGroupConfig::extract_from(
    ///     ProcessGroupConfig::figment().merge(("wait_timeout_ms", 5_000u64)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration merging JSON overrides with highest priority.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn rendezvous_retry(&self) -> Duration {
        Duration::from_millis(self.rendezvous_retry_ms)
    }

    pub fn rendezvous_max_retry(&self) -> Duration {
        Duration::from_millis(self.rendezvous_max_retry_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_micros(self.wait_poll_interval_us)
    }
}
