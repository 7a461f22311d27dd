// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker deriving run health from heartbeat freshness.
//!
//! Every scan interval the monitor lists non-terminal runs that have
//! heartbeated, computes the heartbeat age, and drives the
//! `healthy → heartbeat_stale → unresponsive` ladder. Escalations are
//! keyed by the stored health value, so re-entering the same health on
//! consecutive scans emits nothing; a fresh heartbeat restores `healthy`
//! through the lifecycle service.
//!
//! The thresholds must satisfy `stale < unresponsive`; the scan interval
//! should be comfortably below the stale threshold so escalations land
//! close to the crossing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::lifecycle::Lifecycle;
use crate::types::RunHealth;

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to scan active runs.
    pub scan_interval: Duration,
    /// Heartbeat age past which a run is `heartbeat_stale`.
    pub stale_after: Duration,
    /// Heartbeat age past which a run is `unresponsive`.
    pub unresponsive_after: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(45),
            unresponsive_after: Duration::from_secs(135),
        }
    }
}

/// Background worker that escalates run health.
pub struct HealthMonitor {
    lifecycle: Arc<Lifecycle>,
    clock: Arc<dyn Clock>,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        clock: Arc<dyn Clock>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            lifecycle,
            clock,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until shutdown.
    ///
    /// Cancellation is observed between scans, never mid-scan; each scan is
    /// a sequence of per-run atomic updates.
    pub async fn run(&self) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_secs = self.config.stale_after.as_secs(),
            unresponsive_secs = self.config.unresponsive_after.as_secs(),
            "health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.scan_interval) => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "health scan failed");
                    }
                }
            }
        }

        info!("health monitor stopped");
    }

    /// One scan over all active runs.
    ///
    /// Public so tests (and embedders with their own schedulers) can drive
    /// scans deterministically.
    pub async fn scan(&self) -> crate::error::Result<()> {
        let now = self.clock.now();
        let stale_after =
            chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::MAX);
        let unresponsive_after = chrono::Duration::from_std(self.config.unresponsive_after)
            .unwrap_or(chrono::Duration::MAX);

        let runs = self.lifecycle.list_active_runs().await?;
        if runs.is_empty() {
            debug!("no active runs to scan");
            return Ok(());
        }

        for run in runs {
            // list_active_runs only returns heartbeated runs.
            let Some(last_heartbeat_at) = run.last_heartbeat_at else {
                continue;
            };
            let age = now - last_heartbeat_at;

            let target = if age >= unresponsive_after {
                RunHealth::Unresponsive
            } else if age >= stale_after {
                RunHealth::HeartbeatStale
            } else {
                RunHealth::Healthy
            };

            match self.lifecycle.apply_health(&run.id, target, age).await {
                Ok(changed) => {
                    if changed {
                        debug!(run_id = %run.id, target = %target, "health updated");
                    }
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to apply health");
                }
            }
        }

        Ok(())
    }
}
