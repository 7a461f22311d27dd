// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run heartbeat throttle.
//!
//! Heartbeats arriving faster than the configured floor are rejected with a
//! retry-after hint. The target cadence is one heartbeat every fifteen
//! seconds; the floor defaults to five.
//!
//! State is an in-memory map keyed by run ID. To bound memory growth the
//! throttle runs a cleanup sweep every Nth check and caps the number of
//! tracked runs; at the cap, unknown runs are admitted without tracking
//! rather than rejected, since the floor is a politeness limit, not an
//! abuse defense.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::OrchestratorError;

/// Configuration for the heartbeat throttle.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum spacing between accepted heartbeats per run.
    pub min_interval: Duration,
    /// How often to run cleanup (every N checks).
    pub cleanup_interval: u64,
    /// Maximum number of run IDs to track.
    pub max_tracked_runs: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            cleanup_interval: 1000,
            max_tracked_runs: 100_000,
        }
    }
}

/// Tracks the last accepted heartbeat per run and enforces the floor.
pub struct HeartbeatThrottle {
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    last_accepted: RwLock<HashMap<String, DateTime<Utc>>>,
    check_count: AtomicU64,
}

impl HeartbeatThrottle {
    /// Create a throttle with the given configuration and clock.
    pub fn new(config: ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            last_accepted: RwLock::new(HashMap::new()),
            check_count: AtomicU64::new(0),
        }
    }

    /// Check whether a heartbeat for `run_id` may proceed, recording it if so.
    ///
    /// Rejected heartbeats are not recorded, so the spacing is always
    /// measured against the last accepted one.
    pub fn check(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let min_interval =
            chrono::Duration::from_std(self.config.min_interval).unwrap_or(chrono::Duration::zero());

        let count = self.check_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            self.cleanup(now, min_interval);
        }

        let mut map = self.last_accepted.write().expect("throttle lock poisoned");
        if let Some(last) = map.get(run_id) {
            let elapsed = now - *last;
            if elapsed < min_interval {
                let remaining = (min_interval - elapsed)
                    .to_std()
                    .unwrap_or(self.config.min_interval);
                return Err(OrchestratorError::RateLimited {
                    retry_after: remaining,
                });
            }
            map.insert(run_id.to_string(), now);
            return Ok(());
        }

        if map.len() >= self.config.max_tracked_runs {
            // Over the cap: admit without tracking.
            return Ok(());
        }
        map.insert(run_id.to_string(), now);
        Ok(())
    }

    /// Forget a run (terminal runs no longer heartbeat).
    pub fn forget(&self, run_id: &str) {
        self.last_accepted
            .write()
            .expect("throttle lock poisoned")
            .remove(run_id);
    }

    fn cleanup(&self, now: DateTime<Utc>, min_interval: chrono::Duration) {
        let mut map = self.last_accepted.write().expect("throttle lock poisoned");
        map.retain(|_, last| now - *last < min_interval);
    }
}
