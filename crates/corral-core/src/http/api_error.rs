// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP error mapping.
//!
//! Every failure is rendered as `{"error": {"code", "message", "details"}}`
//! with a machine-readable code from the error taxonomy. Rate-limited
//! responses carry a `Retry-After` header.

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::OrchestratorError;

/// Wire-level error payload.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Machine-readable tag (`invalid`, `not_found`, ...).
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail (e.g. the failing field).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// An HTTP-mapped error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
            retry_after_secs: None,
        }
    }

    /// 400 for malformed requests (unparseable JSON).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid", message)
    }

    /// 422 for well-formed requests violating a rule.
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", message)
    }

    /// 404.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 409.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    /// 413 for bodies over the configured limit.
    pub fn payload_too_large() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid",
            "request body exceeds the size limit",
        )
    }

    /// 415 for non-JSON content types.
    pub fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid",
            "content type must be application/json",
        )
    }

    /// 503 for an expired server-side deadline.
    pub fn deadline_exceeded() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "request deadline exceeded",
        )
    }

    /// Attach structured detail.
    pub fn with_details(mut self, details: Value) -> Self {
        self.body.details = Some(details);
        self
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::NotFound { .. } => Self::not_found(message),
            OrchestratorError::Conflict { .. } => Self::conflict(message),
            OrchestratorError::Validation { field, .. } => {
                Self::unprocessable(message).with_details(json!({"field": field}))
            }
            OrchestratorError::RateLimited { retry_after } => {
                let mut api = Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message);
                api.retry_after_secs = Some(retry_after.as_secs().max(1));
                api
            }
            OrchestratorError::Storage { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            OrchestratorError::Internal { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match &rejection {
            JsonRejection::MissingJsonContentType(_) => Self::unsupported_media_type(),
            JsonRejection::JsonSyntaxError(_) => Self::bad_request("invalid JSON payload"),
            JsonRejection::JsonDataError(e) => Self::unprocessable(e.to_string()),
            _ if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => Self::payload_too_large(),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(json!({"error": self.body}))).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
