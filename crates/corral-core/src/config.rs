// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub http_addr: SocketAddr,
    /// SQLite connection string; `None` selects the in-memory store
    /// (development only).
    pub database_url: Option<String>,
    /// Subject prefix for published events.
    pub event_subject_prefix: String,
    /// How often the health monitor scans active runs.
    pub health_scan_interval: Duration,
    /// Heartbeat age past which a run is `heartbeat_stale`.
    pub heartbeat_stale_after: Duration,
    /// Heartbeat age past which a run is `unresponsive`.
    pub heartbeat_unresponsive_after: Duration,
    /// Whether unresponsive runs get a system terminate command.
    pub auto_terminate_unresponsive: bool,
    /// Minimum spacing between accepted heartbeats per run.
    pub heartbeat_min_interval: Duration,
    /// Server-side deadline applied to every request.
    pub request_timeout: Duration,
    /// Whether the first `running` heartbeat promotes a queued run.
    pub queued_to_running_on_heartbeat: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `CORRAL_HTTP_ADDR`: listen address (default: `0.0.0.0:8080`)
    /// - `CORRAL_DATABASE_URL`: SQLite connection string; unset selects the
    ///   in-memory store
    /// - `CORRAL_EVENT_SUBJECT_PREFIX`: event subject prefix (default: `runs`)
    /// - `CORRAL_HEALTH_SCAN_INTERVAL_SECS`: scan cadence (default: 15)
    /// - `CORRAL_HEARTBEAT_STALE_SECS`: stale threshold (default: 45)
    /// - `CORRAL_HEARTBEAT_UNRESPONSIVE_SECS`: unresponsive threshold
    ///   (default: 135)
    /// - `CORRAL_AUTO_TERMINATE_UNRESPONSIVE`: `true`/`false` (default: false)
    /// - `CORRAL_HEARTBEAT_MIN_INTERVAL_SECS`: throttle floor (default: 5)
    /// - `CORRAL_REQUEST_TIMEOUT_SECS`: request deadline (default: 30)
    /// - `CORRAL_QUEUED_TO_RUNNING_ON_HEARTBEAT`: ready-signal trigger
    ///   (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_addr: SocketAddr = std::env::var("CORRAL_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CORRAL_HTTP_ADDR", "must be a socket address"))?;

        let database_url = std::env::var("CORRAL_DATABASE_URL").ok().filter(|v| !v.is_empty());

        let event_subject_prefix =
            std::env::var("CORRAL_EVENT_SUBJECT_PREFIX").unwrap_or_else(|_| "runs".to_string());

        Ok(Self {
            http_addr,
            database_url,
            event_subject_prefix,
            health_scan_interval: env_secs("CORRAL_HEALTH_SCAN_INTERVAL_SECS", 15)?,
            heartbeat_stale_after: env_secs("CORRAL_HEARTBEAT_STALE_SECS", 45)?,
            heartbeat_unresponsive_after: env_secs("CORRAL_HEARTBEAT_UNRESPONSIVE_SECS", 135)?,
            auto_terminate_unresponsive: env_bool("CORRAL_AUTO_TERMINATE_UNRESPONSIVE", false)?,
            heartbeat_min_interval: env_secs("CORRAL_HEARTBEAT_MIN_INTERVAL_SECS", 5)?,
            request_timeout: env_secs("CORRAL_REQUEST_TIMEOUT_SECS", 30)?,
            queued_to_running_on_heartbeat: env_bool(
                "CORRAL_QUEUED_TO_RUNNING_ON_HEARTBEAT",
                true,
            )?,
        })
    }
}

fn env_secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .map_err(|_| ConfigError::Invalid(key, "must be a number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
