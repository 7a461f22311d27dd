// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the orchestrator core.
//!
//! Provides a unified error type with machine-readable codes matching the
//! wire-level error taxonomy (`invalid`, `not_found`, `conflict`,
//! `rate_limited`, `unavailable`, `internal`).

use std::fmt;
use std::time::Duration;

/// Result type using OrchestratorError.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by the orchestrator's write and read paths.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The requested run or command does not exist.
    NotFound {
        /// What kind of resource was looked up ("run", "command").
        resource: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// Uniqueness, monotonicity, or state-precondition violation.
    Conflict {
        /// Human-readable description of the clash.
        message: String,
    },

    /// Malformed or rule-violating input.
    Validation {
        /// The field that failed validation.
        field: String,
        /// Why it failed.
        message: String,
    },

    /// The caller is sending heartbeats faster than the per-run floor.
    RateLimited {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },

    /// Storage failed after exhausting the local retry budget.
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Unclassified defect.
    Internal {
        /// Error details.
        details: String,
    },
}

impl OrchestratorError {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Shorthand for a missing-resource error.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Shorthand for a storage error.
    pub fn storage(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Machine-readable error code for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Validation { .. } => "invalid",
            Self::RateLimited { .. } => "rate_limited",
            Self::Storage { .. } => "unavailable",
            Self::Internal { .. } => "internal",
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { resource, id } => write!(f, "{resource} '{id}' not found"),
            Self::Conflict { message } => write!(f, "{message}"),
            Self::Validation { field, message } => {
                write!(f, "validation error for '{field}': {message}")
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}s", retry_after.as_secs())
            }
            Self::Storage { operation, details } => {
                write!(f, "storage error during '{operation}': {details}")
            }
            Self::Internal { details } => write!(f, "internal error: {details}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Internal {
            details: format!("json: {err}"),
        }
    }
}
