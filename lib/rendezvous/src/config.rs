// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Server configuration.
//!
//! Values are layered, later sources winning:
//!   1. Built-in defaults.
//!   2. TOML file at `RENDEZVOUS_CONFIG_PATH` (default `rendezvous.toml`, optional).
//!   3. Environment variables prefixed with `RENDEZVOUS_`, e.g. `RENDEZVOUS_EXPECTED_CONTAINERS=4`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use crate::{
    codec::DEFAULT_MAX_FRAME_SIZE,
    error::{RendezvousError, Result},
    net,
};

/// Prefix shared by every environment variable this crate reads.
pub const ENV_PREFIX: &str = "RENDEZVOUS_";

/// ENV used to point at the configuration file
const CONFIG_PATH_ENV: &str = "RENDEZVOUS_CONFIG_PATH";

const DEFAULT_CONFIG_PATH: &str = "rendezvous.toml";

/// ENV enabling JSON lines logging
pub const JSONL_LOGGING_ENV: &str = "RENDEZVOUS_LOGGING_JSONL";

/// ENV disabling ANSI colors in readable logs
pub const DISABLE_ANSI_LOGGING_ENV: &str = "RENDEZVOUS_DISABLE_ANSI_LOGGING";

/// ENV switching log timestamps to the local timezone
pub const USE_LOCAL_TZ_ENV: &str = "RENDEZVOUS_LOG_USE_LOCAL_TZ";

/// Settings for a [`ContainerServer`](crate::ContainerServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind. Resolved to a routable local address when unset.
    pub host: Option<String>,
    /// Port to bind; `0` lets the OS pick.
    pub port: u16,
    /// Number of containers expected to connect after the master.
    pub expected_containers: usize,
    /// Close each container after its first reply.
    pub finite: bool,
    /// How long launchers wait for every peer to join.
    pub join_timeout_secs: u64,
    /// Poll interval of the graceful drain loop.
    pub drain_poll_interval_ms: u64,
    /// Largest accepted frame, length field included.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            expected_containers: 1,
            finite: false,
            join_timeout_secs: 300,
            drain_poll_interval_ms: 10,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Figment with every configuration source merged.
    pub fn figment() -> Figment {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Figment::new()
            .merge(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load and validate the configuration from all sources.
    pub fn from_settings() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Extract and validate the configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| RendezvousError::config_with_source("failed to load server config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.expected_containers == 0 {
            return Err(RendezvousError::config(
                "expected_containers must be greater than zero",
            ));
        }
        if self.max_frame_size < crate::codec::LENGTH_FIELD_SIZE {
            return Err(RendezvousError::config(format!(
                "max_frame_size must be at least {} bytes",
                crate::codec::LENGTH_FIELD_SIZE
            )));
        }
        Ok(())
    }

    /// Address to bind, resolving the local IP when no host is configured.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        match &self.host {
            None => Ok(SocketAddr::new(net::resolve_local_ip(), self.port)),
            Some(host) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let addr = net::format_socket_addr(host, self.port);
                if let Ok(parsed) = addr.parse() {
                    return Ok(parsed);
                }
                addr.to_socket_addrs()
                    .map_err(|e| {
                        RendezvousError::config_with_source(format!("invalid bind address {addr}"), e)
                    })?
                    .next()
                    .ok_or_else(|| RendezvousError::config(format!("{addr} resolved to no address")))
            }
        }
    }

    /// [`join_timeout_secs`](Self::join_timeout_secs) as a [`Duration`].
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// [`drain_poll_interval_ms`](Self::drain_poll_interval_ms) as a [`Duration`].
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check if a string is truthy: `1`, `true`, `on` or `yes`, case-insensitive.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Whether logs should be emitted as JSON lines.
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(JSONL_LOGGING_ENV)
}

/// Whether ANSI colors should be stripped from readable logs.
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(DISABLE_ANSI_LOGGING_ENV)
}

/// Whether log timestamps use the local timezone instead of UTC.
pub fn use_local_timezone() -> bool {
    env_is_truthy(USE_LOCAL_TZ_ENV)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let config = ServerConfig::from_settings().unwrap();
            assert_eq!(config, ServerConfig::default());
            assert_eq!(config.join_timeout(), Duration::from_secs(300));
            assert_eq!(config.drain_poll_interval(), Duration::from_millis(10));
            assert_eq!(config.max_frame_size, 64 * 1024 * 1024);
            Ok(())
        });
    }

    #[test]
    fn test_toml_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rendezvous.toml",
                r#"
                host = "127.0.0.1"
                port = 7070
                expected_containers = 3
                finite = true
                "#,
            )?;
            jail.set_env("RENDEZVOUS_EXPECTED_CONTAINERS", "5");
            jail.set_env("RENDEZVOUS_DRAIN_POLL_INTERVAL_MS", "25");

            let config = ServerConfig::from_settings().unwrap();
            assert_eq!(config.expected_containers, 5);
            assert!(config.finite);
            assert_eq!(config.drain_poll_interval(), Duration::from_millis(25));
            assert_eq!(
                config.bind_addr().unwrap(),
                "127.0.0.1:7070".parse::<SocketAddr>().unwrap()
            );
            Ok(())
        });
    }

    #[test]
    fn test_custom_config_path() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "join_timeout_secs = 12")?;
            jail.set_env("RENDEZVOUS_CONFIG_PATH", "custom.toml");

            let config = ServerConfig::from_settings().unwrap();
            assert_eq!(config.join_timeout(), Duration::from_secs(12));
            Ok(())
        });
    }

    #[test]
    fn test_zero_containers_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("RENDEZVOUS_EXPECTED_CONTAINERS", "0");
            assert!(matches!(
                ServerConfig::from_settings(),
                Err(RendezvousError::Config { .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_value_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("RENDEZVOUS_PORT", "not-a-port");
            let err = ServerConfig::from_settings().unwrap_err();
            assert!(matches!(err, RendezvousError::Config { source: Some(_), .. }));
            Ok(())
        });
    }

    #[test]
    fn test_ipv6_host() {
        let config = ServerConfig {
            host: Some("::1".to_string()),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(
            config.bind_addr().unwrap(),
            "[::1]:9000".parse::<SocketAddr>().unwrap()
        );

        let bracketed = ServerConfig {
            host: Some("[::1]".to_string()),
            ..config
        };
        assert_eq!(bracketed.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_unparsable_host() {
        let config = ServerConfig {
            host: Some("not a host".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.bind_addr(),
            Err(RendezvousError::Config { .. })
        ));
    }

    #[test]
    fn test_truthy_values() {
        for val in ["1", "true", "TRUE", "on", "Yes"] {
            assert!(is_truthy(val), "{val} should be truthy");
        }
        for val in ["0", "false", "off", "", "2"] {
            assert!(!is_truthy(val), "{val} should not be truthy");
        }
    }

    #[test]
    fn test_logging_flags_from_env() {
        Jail::expect_with(|jail| {
            assert!(!jsonl_logging_enabled());
            jail.set_env(JSONL_LOGGING_ENV, "1");
            jail.set_env(DISABLE_ANSI_LOGGING_ENV, "true");
            assert!(jsonl_logging_enabled());
            assert!(disable_ansi_logging());
            assert!(!use_local_timezone());
            Ok(())
        });
    }
}
