// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for processes hosting PGAS nodes.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `DYN_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/opt/dynamo/etc/logging.toml`.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. `JSONL` is enabled by setting
//! `DYN_LOGGING_JSONL` to `1`. Filters come from the `DYN_LOG` environment variable
//! or the `log_filters` table of the TOML file, e.g.
//!
//! ```toml
//! log_level = "info"
//!
//! [log_filters]
//! "dynamo_pgas::combining" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::{disable_ansi_logging, jsonl_logging_enabled};

/// ENV used to set the log level
const FILTER_ENV: &str = "DYN_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "DYN_LOGGING_CONFIG_PATH";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("tokio".to_string(), "error".to_string())]),
        }
    }
}

/// Initialize the logger
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // The generics mean we have to repeat everything. Each builder method returns a
    // specialized type.
    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_ansi(false)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .compact()
            .with_ansi(!disable_ansi_logging())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_level = config.log_level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!(
            "Invalid log_level '{}', using '{DEFAULT_FILTER_LEVEL}'",
            config.log_level
        );
        LevelFilter::INFO
    });
    let default_directive: Directive = default_level.into();

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config files
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file("/opt/dynamo/etc/logging.toml"))
        .merge(Toml::file(config_path));

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Failed loading logging config, using defaults: {e}");
        LoggingConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_filters() {
        temp_env::with_vars_unset([FILTER_ENV, CONFIG_PATH_ENV], || {
            let config = load_config();
            assert_eq!(config.log_level, "info");
            let filter = filters(config).to_string();
            assert!(filter.contains("tokio=error"));
            assert!(filter.contains("info"));
        });
    }

    #[rstest::rstest]
    #[case("loud")]
    #[case("debg")]
    fn test_bad_level_falls_back_to_info(#[case] level: &str) {
        let config = LoggingConfig {
            log_level: level.to_string(),
            log_filters: HashMap::new(),
        };
        temp_env::with_var_unset(FILTER_ENV, || {
            let filter = filters(config);
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
            assert!(!filter.to_string().contains(level));
        });
    }

    #[test]
    fn test_level_is_honored() {
        let config = LoggingConfig {
            log_level: "debug".to_string(),
            log_filters: HashMap::new(),
        };
        temp_env::with_var_unset(FILTER_ENV, || {
            assert_eq!(filters(config).max_level_hint(), Some(LevelFilter::DEBUG));
        });
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        assert!(INIT.is_completed());
        init();
        assert!(INIT.is_completed());
    }
}
