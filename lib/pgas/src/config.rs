// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! PGAS configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/dynamo/etc/pgas.toml`
//! 3. TOML file from the `PGAS_CONFIG_PATH` environment variable
//! 4. Environment variables (`PGAS_HEAP_*`, `PGAS_COLLECTIVE_*`)

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV pointing at an optional TOML configuration file
const CONFIG_PATH_ENV: &str = "PGAS_CONFIG_PATH";

/// Message payload bound used by vector reductions when none is configured.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 2048;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Top-level PGAS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct PgasConfig {
    #[validate(nested)]
    #[serde(default)]
    pub heap: HeapConfig,

    #[validate(nested)]
    #[serde(default)]
    pub collective: CollectiveConfig,
}

/// Sizing of each node's share of the global heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct HeapConfig {
    /// Bytes of arena managed by each node's allocator.
    #[validate(range(min = 1))]
    pub arena_bytes: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_bytes: 64 << 20,
        }
    }
}

/// Collective reduction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CollectiveConfig {
    /// Node that folds contributions and broadcasts results.
    pub home_node: u16,

    /// Upper bound on the payload of a single vector-reduction message. Slices
    /// are split into chunks of `max_message_bytes / size_of::<T>()` elements.
    #[validate(range(min = 1))]
    pub max_message_bytes: usize,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            home_node: 0,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl PgasConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(PgasConfig::default()))
            .merge(Toml::file("/opt/dynamo/etc/pgas.toml"))
            .merge(Toml::file(&config_path))
            // Heap config: PGAS_HEAP_ARENA_BYTES
            .merge(
                Env::prefixed("PGAS_HEAP_")
                    .map(|k| format!("heap.{}", k.as_str().to_lowercase()).into()),
            )
            // Collective config: PGAS_COLLECTIVE_HOME_NODE, PGAS_COLLECTIVE_MAX_MESSAGE_BYTES
            .merge(
                Env::prefixed("PGAS_COLLECTIVE_")
                    .map(|k| format!("collective.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = PgasConfig::extract_from(
    ///     PgasConfig::figment().merge(("collective.home_node", 2u16))
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Returns true if the environment variable is set to a truthy value.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => false,
    }
}

/// Check whether JSONL logging is enabled via `DYN_LOGGING_JSONL`.
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy("DYN_LOGGING_JSONL")
}

/// Check whether ANSI colors should be disabled via `DYN_SDK_DISABLE_ANSI_LOGGING`.
pub fn disable_ansi_logging() -> bool {
    env_is_truthy("DYN_SDK_DISABLE_ANSI_LOGGING")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: [&str; 4] = [
        "PGAS_CONFIG_PATH",
        "PGAS_HEAP_ARENA_BYTES",
        "PGAS_COLLECTIVE_HOME_NODE",
        "PGAS_COLLECTIVE_MAX_MESSAGE_BYTES",
    ];

    #[test]
    fn test_default_config() {
        let config = PgasConfig::default();
        assert_eq!(config.heap.arena_bytes, 64 << 20);
        assert_eq!(config.collective.home_node, 0);
        assert_eq!(config.collective.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let config = PgasConfig::from_env().unwrap();
            assert_eq!(config.heap, HeapConfig::default());
            assert_eq!(config.collective, CollectiveConfig::default());
        });
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("PGAS_CONFIG_PATH", None),
                ("PGAS_HEAP_ARENA_BYTES", Some("4096")),
                ("PGAS_COLLECTIVE_HOME_NODE", Some("3")),
                ("PGAS_COLLECTIVE_MAX_MESSAGE_BYTES", Some("512")),
            ],
            || {
                let config = PgasConfig::from_env().unwrap();
                assert_eq!(config.heap.arena_bytes, 4096);
                assert_eq!(config.collective.home_node, 3);
                assert_eq!(config.collective.max_message_bytes, 512);
            },
        );
    }

    #[test]
    fn test_extract_from_with_tuple_override() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let config = PgasConfig::extract_from(
                PgasConfig::figment().merge(("collective.home_node", 5u16)),
            )
            .unwrap();
            assert_eq!(config.collective.home_node, 5);
            assert_eq!(config.heap.arena_bytes, 64 << 20);
        });
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let result = PgasConfig::extract_from(
                PgasConfig::figment().merge(("heap.arena_bytes", 0u64)),
            );
            assert!(matches!(result, Err(ConfigError::Validation(_))));

            let result = PgasConfig::extract_from(
                PgasConfig::figment().merge(("collective.max_message_bytes", 0usize)),
            );
            assert!(matches!(result, Err(ConfigError::Validation(_))));
        });
    }

    #[test]
    fn test_env_is_truthy() {
        temp_env::with_var("PGAS_TEST_FLAG", Some("TRUE"), || {
            assert!(env_is_truthy("PGAS_TEST_FLAG"));
        });
        temp_env::with_var("PGAS_TEST_FLAG", Some("0"), || {
            assert!(!env_is_truthy("PGAS_TEST_FLAG"));
        });
        temp_env::with_var_unset("PGAS_TEST_FLAG", || {
            assert!(!env_is_truthy("PGAS_TEST_FLAG"));
        });
    }
}
