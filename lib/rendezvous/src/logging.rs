// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for processes that host a coordinator or a container peer.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `RENDEZVOUS_LOGGING_CONFIG_PATH` environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `RENDEZVOUS_LOGGING_JSONL` environment variable to `1`.
//!
//! To use local timezone for logging timestamps, set `RENDEZVOUS_LOG_USE_LOCAL_TZ` to `1`.
//!
//! Filters can be configured using the `RENDEZVOUS_LOG` environment variable or by setting the
//! `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "rendezvous::reactor" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive, filter::LevelFilter, fmt};

use crate::config::{disable_ansi_logging, jsonl_logging_enabled, use_local_timezone};

/// ENV used to set the log level
const FILTER_ENV: &str = "RENDEZVOUS_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "RENDEZVOUS_LOGGING_CONFIG_PATH";

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
            log_filters: HashMap::from([
                ("tokio_util".to_string(), "error".to_string()),
                ("mio".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Install the global subscriber. Safe to call more than once.
///
/// A subscriber installed by someone else first is left in place.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // Each builder method returns a specialized type, so both branches are spelled out.
    let result = if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_timer(TimeFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    } else {
        let l = fmt::layer()
            .with_ansi(!disable_ansi_logging())
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging not initialized, a global subscriber is already set: {e}");
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_level = config.log_level.parse::<LevelFilter>().unwrap_or_else(|e| {
        eprintln!("Invalid log level '{}': {e}", config.log_level);
        LevelFilter::INFO
    });

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config file
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
    let mut figment = Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        figment = figment.merge(Toml::file(config_path));
    }

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Failed to load logging config, using defaults: {e}");
        LoggingConfig::default()
    })
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: use_local_timezone(),
        }
    }

    fn format_now(&self) -> String {
        if self.use_local_tz {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_now())
    }
}
