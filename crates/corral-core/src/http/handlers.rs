// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint handlers.
//!
//! Thin decode/validate/delegate wrappers over the lifecycle service. All
//! domain rules live in the service; handlers own only wire concerns
//! (defaults, ID generation, request metadata extraction).

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::lifecycle::{CommandDraft, CreateRunInput, RequestContext};
use crate::types::{CommandActor, CommandKind, HeartbeatPayload};

use super::api_error::ApiError;
use super::{AppState, CorrelationId};

/// Request body for `POST /runs`.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    /// Client-supplied run ID; generated when absent.
    #[serde(default)]
    pub id: String,
    /// Experiment to execute.
    pub experiment_id: String,
    /// Experiment-version identifier.
    pub version_id: String,
    /// Resolved launch manifest.
    pub launch_manifest: Value,
    /// Optional overrides.
    #[serde(default)]
    pub overrides: Option<Value>,
    /// Scheduling priority (default 0).
    #[serde(default)]
    pub priority: i32,
    /// Creator identity.
    pub created_by: String,
}

/// Request body for `POST /runs/{run_id}/commands`.
#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    /// Client-supplied command ID; generated when absent.
    #[serde(default)]
    pub id: String,
    /// Command kind.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Who issued the command.
    pub actor: CommandActor,
    /// Issue timestamp; defaults to the server clock.
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

fn request_context(
    headers: &HeaderMap,
    correlation_id: &CorrelationId,
    addr: Option<&ConnectInfo<SocketAddr>>,
) -> RequestContext {
    let credential_fingerprint = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|credential| {
            let mut hasher = Sha256::new();
            hasher.update(credential.as_bytes());
            format!("{:x}", hasher.finalize())
        });

    RequestContext {
        correlation_id: correlation_id.0.clone(),
        source_addr: addr.map(|ConnectInfo(addr)| addr.to_string()),
        client_id: headers
            .get("x-client-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        credential_fingerprint,
    }
}

fn generated_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `POST /api/v1/runs`
pub async fn create_run(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut request) = body?;
    if request.id.is_empty() {
        request.id = generated_id();
    }

    let ctx = request_context(&headers, &correlation_id, addr.as_ref());
    let run = state
        .lifecycle
        .create_run(
            CreateRunInput {
                id: request.id,
                experiment_id: request.experiment_id,
                version_id: request.version_id,
                launch_manifest: request.launch_manifest,
                overrides: request.overrides,
                priority: request.priority,
                created_by: request.created_by,
            },
            &ctx,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(run)).into_response())
}

/// `GET /api/v1/runs/{run_id}`
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let run = state.lifecycle.get_run(&run_id).await?;
    Ok(Json(run).into_response())
}

/// `POST /api/v1/runs/{run_id}/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Result<Json<HeartbeatPayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = body?;
    let run = state.lifecycle.heartbeat(&run_id, &payload).await?;
    Ok(Json(run).into_response())
}

/// `POST /api/v1/runs/{run_id}/commands`
pub async fn submit_command(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<SubmitCommandRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut request) = body?;
    if request.id.is_empty() {
        request.id = generated_id();
    }

    let ctx = request_context(&headers, &correlation_id, addr.as_ref());
    let draft = CommandDraft {
        id: request.id,
        kind: request.kind,
        payload: request.payload,
        actor: request.actor,
        issued_at: request.issued_at.unwrap_or_else(Utc::now),
    };
    let command = state.lifecycle.submit_command(&run_id, draft, &ctx).await?;

    Ok((StatusCode::ACCEPTED, Json(command)).into_response())
}

/// `GET /api/v1/runs/{run_id}/commands/next`
pub async fn next_command(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers, &correlation_id, addr.as_ref());
    match state.lifecycle.next_command(&run_id, &ctx).await? {
        Some(command) => Ok(Json(command).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// `POST /api/v1/runs/{run_id}/commands/{command_id}/ack`
pub async fn ack_command(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path((run_id, command_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers, &correlation_id, addr.as_ref());
    let command = state
        .lifecycle
        .ack_command(&run_id, &command_id, &ctx)
        .await?;
    Ok(Json(command).into_response())
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Response {
    let store_healthy = state
        .lifecycle
        .store()
        .health_check()
        .await
        .unwrap_or(false);

    let body = json!({
        "status": if store_healthy { "ok" } else { "degraded" },
        "version": state.version,
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
        "store_healthy": store_healthy,
    });

    if store_healthy {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
