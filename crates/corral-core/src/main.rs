// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Corral Orchestrator Core server binary.
//!
//! Startup order: configuration, store (migrations), event publisher,
//! audit log, lifecycle service, health monitor task, HTTP listener.
//! Shutdown drains the listener first, then stops the monitor.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use corral_core::audit::AuditLog;
use corral_core::clock::SystemClock;
use corral_core::config::Config;
use corral_core::events::ChannelPublisher;
use corral_core::health::{HealthMonitor, HealthMonitorConfig};
use corral_core::http::{build_router, AppState};
use corral_core::lifecycle::{Lifecycle, LifecycleOptions};
use corral_core::store::{MemoryStore, RunStore, SqliteStore};
use corral_core::throttle::{HeartbeatThrottle, ThrottleConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corral_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Corral Orchestrator Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        scan_interval_secs = config.health_scan_interval.as_secs(),
        auto_terminate = config.auto_terminate_unresponsive,
        "Configuration loaded"
    );

    let store: Arc<dyn RunStore> = match &config.database_url {
        Some(url) => {
            info!(url = %url, "Connecting to SQLite store");
            Arc::new(SqliteStore::connect(url).await?)
        }
        None => {
            warn!("CORRAL_DATABASE_URL not set, using the in-memory store (development only)");
            Arc::new(MemoryStore::new())
        }
    };

    let clock = Arc::new(SystemClock);
    let publisher = Arc::new(ChannelPublisher::new(
        config.event_subject_prefix.clone(),
        256,
    ));
    let audit = AuditLog::new(store.clone());
    let throttle = HeartbeatThrottle::new(
        ThrottleConfig {
            min_interval: config.heartbeat_min_interval,
            ..ThrottleConfig::default()
        },
        clock.clone(),
    );

    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        publisher.clone(),
        audit,
        clock.clone(),
        throttle,
        LifecycleOptions {
            queued_to_running_on_heartbeat: config.queued_to_running_on_heartbeat,
            auto_terminate_unresponsive: config.auto_terminate_unresponsive,
        },
    ));

    let monitor = HealthMonitor::new(
        lifecycle.clone(),
        clock,
        HealthMonitorConfig {
            scan_interval: config.health_scan_interval,
            stale_after: config.heartbeat_stale_after,
            unresponsive_after: config.heartbeat_unresponsive_after,
        },
    );
    let monitor_shutdown = monitor.shutdown_handle();
    let monitor_handle = tokio::spawn(async move { monitor.run().await });

    let app = build_router(AppState::new(lifecycle), config.request_timeout);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP server listening");

    // Drain in-flight requests before stopping background tasks.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
        }
        info!("shutdown signal received");
    })
    .await?;

    monitor_shutdown.notify_one();
    if let Err(e) = monitor_handle.await {
        error!("health monitor task panicked: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
