// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types for the orchestrator core.
//!
//! Runs, lifecycle states, learner-reported runtime status, derived health,
//! control commands, and the heartbeat wire payload, together with the
//! validation rules they enforce at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorError;

/// Maximum length for free-text fields carried in command payloads.
pub const MAX_NOTES_LEN: usize = 256;

/// Canonical lifecycle state of a run, owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, waiting for a scheduler/learner to pick it up.
    Queued,
    /// Resources are being provisioned by an external scheduler.
    Provisioning,
    /// Learner is training.
    Running,
    /// Paused by an acknowledged pause command.
    Paused,
    /// Shutdown in progress.
    Terminating,
    /// Finished normally. Terminal.
    Completed,
    /// Learner reported an unrecoverable error. Terminal.
    Failed,
    /// Stopped by an acknowledged terminate command. Terminal.
    Terminated,
}

impl RunState {
    /// Terminal states absorb all further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Stable string form, matching the wire and storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "queued" => Self::Queued,
            "provisioning" => Self::Provisioning,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "terminating" => Self::Terminating,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "terminated" => Self::Terminated,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Learner-reported execution state, reconciled via heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// Actively training.
    Running,
    /// Paused in place.
    Paused,
    /// Winding down (normal completion path).
    Terminating,
    /// Hit an unrecoverable error.
    Errored,
}

impl RuntimeStatus {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
            Self::Errored => "errored",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "terminating" => Self::Terminating,
            "errored" => Self::Errored,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator-derived heartbeat freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunHealth {
    /// Heartbeats arriving within the stale threshold.
    Healthy,
    /// No heartbeat past the stale threshold.
    HeartbeatStale,
    /// No heartbeat past the unresponsive threshold.
    Unresponsive,
}

impl RunHealth {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::HeartbeatStale => "heartbeat_stale",
            Self::Unresponsive => "unresponsive",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "healthy" => Self::Healthy,
            "heartbeat_stale" => Self::HeartbeatStale,
            "unresponsive" => Self::Unresponsive,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control command kinds the orchestrator can deliver to a learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Bounded numeric overrides applied without a restart.
    Tune,
    /// Pause training in place.
    Pause,
    /// Resume a paused run.
    Resume,
    /// Stop the run.
    Terminate,
}

impl CommandKind {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tune => "tune",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Terminate => "terminate",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "tune" => Self::Tune,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "terminate" => Self::Terminate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Differentiates human operators from automated initiators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// A human operator.
    Operator,
    /// An automated component (e.g. the health monitor).
    System,
}

impl ActorKind {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::System => "system",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "operator" => Self::Operator,
            "system" => Self::System,
            _ => return None,
        })
    }
}

/// Who issued a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandActor {
    /// Operator or system.
    #[serde(rename = "type")]
    pub kind: ActorKind,
    /// Principal identifier (username or component name).
    pub id: String,
}

/// Canonical run record, the unit of coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Globally unique run identifier.
    pub id: String,
    /// Experiment this run executes.
    pub experiment_id: String,
    /// Immutable experiment-version identifier.
    pub version_id: String,
    /// Orchestrator-owned lifecycle state.
    pub state: RunState,
    /// Free-text operational note surfaced alongside the state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Scheduling priority (higher is more urgent).
    pub priority: i32,
    /// Resolved launch manifest (opaque to the core).
    pub launch_manifest: Value,
    /// Optional overrides applied on top of the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    /// When the last heartbeat was accepted (server clock).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Learner-reported runtime status.
    pub runtime_status: RuntimeStatus,
    /// Orchestrator-derived health.
    pub health_status: RunHealth,
    /// Latest training step. Monotonically non-decreasing.
    pub current_step: i64,
    /// Rolling throughput.
    pub samples_per_sec: f64,
    /// Last reported loss scalar.
    pub loss: f64,
    /// Highest checkpoint version. Monotonically non-decreasing.
    pub checkpoint_version: i64,
    /// When the run left `queued`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Creator identity.
    pub created_by: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp; optimistic-concurrency token.
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Apply an accepted heartbeat's counters and status to this run.
    ///
    /// Monotonicity has already been validated by the caller.
    pub fn merge_heartbeat(&mut self, payload: &HeartbeatPayload, received_at: DateTime<Utc>) {
        self.last_heartbeat_at = Some(received_at);
        self.runtime_status = payload.status;
        self.current_step = payload.step;
        self.samples_per_sec = payload.samples_per_sec;
        self.loss = payload.loss;
        self.checkpoint_version = payload.checkpoint_version;
    }
}

/// Append-only record of a lifecycle state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTransition {
    /// Run this transition belongs to.
    pub run_id: String,
    /// Previous state; `None` for the initial transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<RunState>,
    /// New state.
    pub to_state: RunState,
    /// Actor responsible for the change.
    pub changed_by: String,
    /// Optional human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the transition was recorded (server clock).
    pub created_at: DateTime<Utc>,
}

/// A control command directed at a single run.
///
/// Delivery stamps are monotonic: pending (both null) → delivered →
/// acknowledged (both set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommand {
    /// Client-supplied idempotency key, unique within the run.
    pub id: String,
    /// Target run.
    pub run_id: String,
    /// Command kind.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Type-specific payload, stored canonically.
    pub payload: Value,
    /// Who issued the command.
    pub actor: CommandActor,
    /// Client-supplied issue timestamp; delivery order key.
    pub issued_at: DateTime<Utc>,
    /// Set once, when a consumer first observes the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set once, when the learner confirms the effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Server-side creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Bounded numeric overrides carried by a `tune` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunePayload {
    /// Learning rate, in (0, 1] when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    /// Entropy coefficient, in [0, 0.1] when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy_coef: Option<f64>,
    /// PPO clip epsilon, in [0.05, 0.3] when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_epsilon: Option<f64>,
    /// Operator note, at most 256 characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Payload carried by a `terminate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatePayload {
    /// Why the run is being stopped. Required, at most 256 characters.
    pub reason: String,
    /// Whether the learner should cut a final checkpoint before exiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_checkpoint: Option<bool>,
}

/// Learner heartbeat payload accepted by the heartbeat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Must match the run ID in the URL.
    pub run_id: String,
    /// Current runtime status.
    pub status: RuntimeStatus,
    /// Current training step, non-negative.
    pub step: i64,
    /// Rolling throughput, non-negative.
    pub samples_per_sec: f64,
    /// Last loss scalar; must be finite.
    pub loss: f64,
    /// Highest checkpoint version, non-negative.
    pub checkpoint_version: i64,
    /// Command IDs the learner has queued locally (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_commands: Option<Vec<String>>,
    /// Free-text note (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl HeartbeatPayload {
    /// Validate the payload against schema rules and the run's stored
    /// progress counters.
    ///
    /// Schema violations surface as `invalid`; counter regressions surface
    /// as `conflict` so retried-but-stale learners can tell them apart.
    pub fn validate(
        &self,
        expected_run_id: &str,
        current_step: i64,
        current_checkpoint: i64,
    ) -> Result<(), OrchestratorError> {
        if self.run_id.is_empty() {
            return Err(OrchestratorError::validation("run_id", "run_id is required"));
        }
        if self.run_id != expected_run_id {
            return Err(OrchestratorError::validation(
                "run_id",
                format!(
                    "run_id mismatch: expected {expected_run_id} got {}",
                    self.run_id
                ),
            ));
        }
        if self.step < 0 {
            return Err(OrchestratorError::validation(
                "step",
                "step must be non-negative",
            ));
        }
        if self.samples_per_sec < 0.0 {
            return Err(OrchestratorError::validation(
                "samples_per_sec",
                "samples_per_sec must be non-negative",
            ));
        }
        if !self.loss.is_finite() {
            return Err(OrchestratorError::validation("loss", "loss must be finite"));
        }
        if self.checkpoint_version < 0 {
            return Err(OrchestratorError::validation(
                "checkpoint_version",
                "checkpoint_version must be non-negative",
            ));
        }
        if self.step < current_step {
            return Err(OrchestratorError::conflict(format!(
                "step regression: {} < {current_step}",
                self.step
            )));
        }
        if self.checkpoint_version < current_checkpoint {
            return Err(OrchestratorError::conflict(format!(
                "checkpoint regression: {} < {current_checkpoint}",
                self.checkpoint_version
            )));
        }
        Ok(())
    }
}

/// Validate a command envelope's actor and type-specific payload bounds.
///
/// State preconditions are enforced separately by the lifecycle service;
/// this checks everything that is intrinsic to the envelope itself.
pub fn validate_command(
    kind: CommandKind,
    payload: &Value,
    actor: &CommandActor,
) -> Result<(), OrchestratorError> {
    if actor.id.is_empty() {
        return Err(OrchestratorError::validation(
            "actor.id",
            "actor.id is required",
        ));
    }
    match kind {
        CommandKind::Tune => validate_tune(payload),
        CommandKind::Pause | CommandKind::Resume => {
            let empty = match payload {
                Value::Null => true,
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            if !empty {
                return Err(OrchestratorError::validation(
                    "payload",
                    format!("{kind} payload must be empty"),
                ));
            }
            Ok(())
        }
        CommandKind::Terminate => {
            let parsed: TerminatePayload = serde_json::from_value(payload.clone())
                .map_err(|e| OrchestratorError::validation("payload", e.to_string()))?;
            if parsed.reason.is_empty() {
                return Err(OrchestratorError::validation(
                    "payload.reason",
                    "terminate payload requires reason",
                ));
            }
            if parsed.reason.chars().count() > MAX_NOTES_LEN {
                return Err(OrchestratorError::validation(
                    "payload.reason",
                    format!("reason must be at most {MAX_NOTES_LEN} characters"),
                ));
            }
            Ok(())
        }
    }
}

fn validate_tune(payload: &Value) -> Result<(), OrchestratorError> {
    let parsed: TunePayload = serde_json::from_value(payload.clone())
        .map_err(|e| OrchestratorError::validation("payload", e.to_string()))?;
    if parsed.learning_rate.is_none()
        && parsed.entropy_coef.is_none()
        && parsed.clip_epsilon.is_none()
    {
        return Err(OrchestratorError::validation(
            "payload",
            "tune payload requires at least one tunable field",
        ));
    }
    if let Some(lr) = parsed.learning_rate {
        if !(lr > 0.0 && lr <= 1.0) {
            return Err(OrchestratorError::validation(
                "payload.learning_rate",
                "learning_rate must be in (0, 1]",
            ));
        }
    }
    if let Some(coef) = parsed.entropy_coef {
        if !(0.0..=0.1).contains(&coef) {
            return Err(OrchestratorError::validation(
                "payload.entropy_coef",
                "entropy_coef must be within [0, 0.1]",
            ));
        }
    }
    if let Some(eps) = parsed.clip_epsilon {
        if !(0.05..=0.3).contains(&eps) {
            return Err(OrchestratorError::validation(
                "payload.clip_epsilon",
                "clip_epsilon must be within [0.05, 0.3]",
            ));
        }
    }
    if let Some(notes) = &parsed.notes {
        if notes.chars().count() > MAX_NOTES_LEN {
            return Err(OrchestratorError::validation(
                "payload.notes",
                format!("notes must be at most {MAX_NOTES_LEN} characters"),
            ));
        }
    }
    Ok(())
}

/// Canonical byte form of a command payload, used for idempotency comparison.
///
/// `serde_json::Value` keeps object keys in sorted order, so two payloads
/// that parse to the same value serialize to the same bytes.
pub fn canonical_payload(payload: &Value) -> String {
    payload.to_string()
}
