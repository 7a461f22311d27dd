// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface for the orchestrator core.
//!
//! Routes under `/api/v1` wrap the lifecycle service; `/healthz` reports
//! liveness. Requests get a correlation ID on ingress (echoed as
//! `x-correlation-id`), a 32 KiB body limit, and a server-side deadline.

pub mod api_error;
pub mod handlers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use uuid::Uuid;

use crate::lifecycle::Lifecycle;

use self::api_error::ApiError;

/// Maximum accepted request body: 32 KiB, boundary inclusive.
pub const MAX_BODY_BYTES: usize = 32 * 1024;

/// Correlation ID assigned to (or propagated from) each request.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The lifecycle service all writes flow through.
    pub lifecycle: Arc<Lifecycle>,
    /// Server version string.
    pub version: &'static str,
    /// When the server started (for uptime reporting).
    pub started_at: Instant,
}

impl AppState {
    /// Create handler state over a lifecycle service.
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            version: env!("CARGO_PKG_VERSION"),
            started_at: Instant::now(),
        }
    }
}

/// Build the router with correlation, deadline, and body-limit middleware.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/runs", post(handlers::create_run))
        .route("/runs/:run_id", get(handlers::get_run))
        .route("/runs/:run_id/heartbeat", post(handlers::heartbeat))
        .route("/runs/:run_id/commands", post(handlers::submit_command))
        .route(
            "/runs/:run_id/commands/next",
            get(handlers::next_command),
        )
        .route(
            "/runs/:run_id/commands/:command_id/ack",
            post(handlers::ack_command),
        );

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(handlers::healthz))
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            async move {
                match tokio::time::timeout(request_timeout, next.run(req)).await {
                    Ok(response) => response,
                    Err(_) => ApiError::deadline_exceeded().into_response(),
                }
            }
        }))
        .layer(middleware::from_fn(correlation))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Assign or propagate the request correlation ID and echo it back.
async fn correlation(mut req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}
