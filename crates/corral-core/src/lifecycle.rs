// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle service: every write path through the orchestrator.
//!
//! Run creation, heartbeat ingestion, command validation and queueing,
//! delivery and acknowledgement stamping, and health application all flow
//! through here. The service validates first, mutates the store second, and
//! emits events last; events never fail a request.
//!
//! Per-run mutations use optimistic concurrency on the run's `updated_at`
//! token: read, modify, compare-and-set, retrying a bounded number of times
//! before surfacing `conflict`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};
use crate::events::{CommandEvent, CommandStage, Publisher, RunStatusEvent};
use crate::store::{CommandAppend, RunStore};
use crate::throttle::HeartbeatThrottle;
use crate::types::{
    validate_command, ActorKind, CommandActor, CommandKind, HeartbeatPayload, Run, RunCommand,
    RunHealth, RunState, RunTransition, RuntimeStatus,
};

/// Bounded attempts for the optimistic read-modify-write loop.
const UPDATE_RETRY_ATTEMPTS: usize = 3;

/// Actor identity recorded for learner-driven transitions.
const LEARNER_ACTOR: &str = "learner";

/// Actor identity used by the health monitor's auto-terminate.
const HEALTH_MONITOR_ACTOR: &str = "health-monitor";

/// Inputs required to create a run.
#[derive(Debug, Clone)]
pub struct CreateRunInput {
    /// Run ID (client-supplied or generated by the HTTP layer).
    pub id: String,
    /// Experiment to execute.
    pub experiment_id: String,
    /// Experiment-version identifier.
    pub version_id: String,
    /// Resolved launch manifest.
    pub launch_manifest: Value,
    /// Optional overrides.
    pub overrides: Option<Value>,
    /// Scheduling priority.
    pub priority: i32,
    /// Creator identity.
    pub created_by: String,
}

/// Command envelope as submitted by a client.
#[derive(Debug, Clone)]
pub struct CommandDraft {
    /// Client-supplied idempotency key.
    pub id: String,
    /// Command kind.
    pub kind: CommandKind,
    /// Type-specific payload.
    pub payload: Value,
    /// Who issued the command.
    pub actor: CommandActor,
    /// Client-declared issue time (delivery order key).
    pub issued_at: DateTime<Utc>,
}

/// Request metadata threaded into audit entries and logs.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Correlation ID generated on ingress.
    pub correlation_id: String,
    /// Source socket address, when known.
    pub source_addr: Option<String>,
    /// Client identifier header, when supplied.
    pub client_id: Option<String>,
    /// Fingerprint of the presented credential, when any.
    pub credential_fingerprint: Option<String>,
}

impl RequestContext {
    /// Context for internally generated actions.
    pub fn internal() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }
}

/// Behavior switches resolved from configuration.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Whether the first `running` heartbeat promotes a queued run.
    pub queued_to_running_on_heartbeat: bool,
    /// Whether unresponsive runs get a system terminate command.
    pub auto_terminate_unresponsive: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            queued_to_running_on_heartbeat: true,
            auto_terminate_unresponsive: false,
        }
    }
}

/// The orchestrator's write-path service.
pub struct Lifecycle {
    store: Arc<dyn RunStore>,
    events: Arc<dyn Publisher>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    throttle: HeartbeatThrottle,
    options: LifecycleOptions,
}

impl Lifecycle {
    /// Create the service over its collaborators.
    pub fn new(
        store: Arc<dyn RunStore>,
        events: Arc<dyn Publisher>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        throttle: HeartbeatThrottle,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            store,
            events,
            audit,
            clock,
            throttle,
            options,
        }
    }

    /// The store backing this service.
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// The audit log backing this service.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ========================================================================
    // Run creation and lookup
    // ========================================================================

    /// Create a run in `queued` state with an initial transition entry.
    ///
    /// Idempotent on the run ID: a collision returns the existing record.
    #[instrument(skip(self, input, ctx), fields(run_id = %input.id))]
    pub async fn create_run(&self, input: CreateRunInput, ctx: &RequestContext) -> Result<Run> {
        if input.id.is_empty() {
            return Err(OrchestratorError::validation("id", "id is required"));
        }
        if input.experiment_id.is_empty() {
            return Err(OrchestratorError::validation(
                "experiment_id",
                "experiment_id is required",
            ));
        }
        if input.version_id.is_empty() {
            return Err(OrchestratorError::validation(
                "version_id",
                "version_id is required",
            ));
        }
        if input.created_by.is_empty() {
            return Err(OrchestratorError::validation(
                "created_by",
                "created_by is required",
            ));
        }

        let now = self.clock.now();
        let run = Run {
            id: input.id.clone(),
            experiment_id: input.experiment_id,
            version_id: input.version_id,
            state: RunState::Queued,
            status_message: None,
            priority: input.priority,
            launch_manifest: input.launch_manifest,
            overrides: input.overrides,
            last_heartbeat_at: None,
            // Optimistic initial status, reconciled by the first heartbeat.
            runtime_status: RuntimeStatus::Running,
            health_status: RunHealth::Healthy,
            current_step: 0,
            samples_per_sec: 0.0,
            loss: 0.0,
            checkpoint_version: 0,
            started_at: None,
            ended_at: None,
            created_by: input.created_by.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.store.create_run(&run).await {
            if err.code() == "conflict" {
                warn!("run already exists, returning existing record");
                return self
                    .store
                    .get_run(&run.id)
                    .await?
                    .ok_or_else(|| OrchestratorError::not_found("run", &run.id));
            }
            return Err(err);
        }

        let transition = RunTransition {
            run_id: run.id.clone(),
            from_state: None,
            to_state: RunState::Queued,
            changed_by: input.created_by.clone(),
            reason: Some("created".to_string()),
            created_at: now,
        };
        self.store.append_transition(&transition).await?;

        let actor = CommandActor {
            kind: ActorKind::Operator,
            id: input.created_by,
        };
        self.append_audit(
            ctx,
            &run.id,
            None,
            "state_changed",
            actor,
            json!({"from": Value::Null, "to": RunState::Queued, "reason": "created"}),
            now,
        )
        .await;

        self.emit_run_status(&run, None).await;
        info!("run created");
        Ok(run)
    }

    /// Fetch a run by ID.
    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("run", run_id))
    }

    // ========================================================================
    // Heartbeat ingestion
    // ========================================================================

    /// Ingest a learner heartbeat.
    ///
    /// Validates monotonic progress, refreshes counters and health, and
    /// applies heartbeat-driven lifecycle transitions (ready signal, learner
    /// failure, normal completion).
    #[instrument(skip(self, payload), fields(run_id = %run_id, step = payload.step))]
    pub async fn heartbeat(&self, run_id: &str, payload: &HeartbeatPayload) -> Result<Run> {
        // Existence and terminal-state checks come before the throttle so a
        // misdirected learner gets the real answer, not a retry hint.
        let probe = self.get_run(run_id).await?;
        if probe.state.is_terminal() {
            self.throttle.forget(run_id);
            return Err(OrchestratorError::conflict(format!(
                "run '{run_id}' is {} and no longer accepts heartbeats",
                probe.state
            )));
        }

        self.throttle.check(run_id)?;

        for attempt in 0..UPDATE_RETRY_ATTEMPTS {
            let mut run = self.get_run(run_id).await?;
            if run.state.is_terminal() {
                return Err(OrchestratorError::conflict(format!(
                    "run '{run_id}' is {} and no longer accepts heartbeats",
                    run.state
                )));
            }
            payload.validate(run_id, run.current_step, run.checkpoint_version)?;

            let now = self.clock.now();
            let expected = run.updated_at;
            let prior_health = run.health_status;

            run.merge_heartbeat(payload, now);
            run.health_status = RunHealth::Healthy;
            run.updated_at = now;

            let transition = self.heartbeat_transition(&mut run, payload, now);

            if !self.store.update_run(&run, expected).await? {
                debug!(attempt, "heartbeat lost optimistic write, retrying");
                continue;
            }

            if let Some(transition) = &transition {
                self.store.append_transition(transition).await?;
                info!(
                    from = ?transition.from_state,
                    to = %transition.to_state,
                    "heartbeat-driven transition"
                );
            }

            if prior_health != RunHealth::Healthy {
                info!(prior = %prior_health, "run recovered");
            }
            self.emit_run_status(&run, None).await;
            return Ok(run);
        }

        Err(OrchestratorError::conflict(format!(
            "run '{run_id}' is being updated concurrently, retry"
        )))
    }

    /// Heartbeat-driven lifecycle transitions, applied to the run in place.
    fn heartbeat_transition(
        &self,
        run: &mut Run,
        payload: &HeartbeatPayload,
        now: DateTime<Utc>,
    ) -> Option<RunTransition> {
        let (to_state, reason) = match (run.state, payload.status) {
            (RunState::Queued, RuntimeStatus::Running)
                if self.options.queued_to_running_on_heartbeat =>
            {
                (RunState::Running, "ready signal (first heartbeat)")
            }
            (RunState::Running, RuntimeStatus::Errored) => (RunState::Failed, "learner errored"),
            (RunState::Running, RuntimeStatus::Terminating) => {
                (RunState::Completed, "normal completion")
            }
            _ => return None,
        };

        let from_state = run.state;
        run.state = to_state;
        match to_state {
            RunState::Running => run.started_at = Some(now),
            RunState::Failed => {
                run.ended_at = Some(now);
                run.status_message = Some(
                    payload
                        .notes
                        .clone()
                        .unwrap_or_else(|| "learner reported errored".to_string()),
                );
            }
            RunState::Completed => run.ended_at = Some(now),
            _ => {}
        }

        Some(RunTransition {
            run_id: run.id.clone(),
            from_state: Some(from_state),
            to_state,
            changed_by: LEARNER_ACTOR.to_string(),
            reason: Some(reason.to_string()),
            created_at: now,
        })
    }

    // ========================================================================
    // Command submission
    // ========================================================================

    /// Validate and queue a control command.
    ///
    /// Idempotent on `(run_id, command_id)`: resubmitting an identical
    /// payload returns the stored record; a divergent payload is a conflict.
    #[instrument(skip(self, draft, ctx), fields(run_id = %run_id, command_id = %draft.id, kind = %draft.kind))]
    pub async fn submit_command(
        &self,
        run_id: &str,
        draft: CommandDraft,
        ctx: &RequestContext,
    ) -> Result<RunCommand> {
        if draft.id.is_empty() {
            return Err(OrchestratorError::validation("id", "command id is required"));
        }

        let run = self.get_run(run_id).await?;
        if run.state.is_terminal() {
            return Err(OrchestratorError::conflict(format!(
                "run '{run_id}' is {} and no longer accepts commands",
                run.state
            )));
        }

        validate_command(draft.kind, &draft.payload, &draft.actor)?;
        check_precondition(draft.kind, run.state)?;

        let now = self.clock.now();
        let command = RunCommand {
            id: draft.id,
            run_id: run_id.to_string(),
            kind: draft.kind,
            payload: draft.payload,
            actor: draft.actor,
            issued_at: draft.issued_at,
            delivered_at: None,
            acknowledged_at: None,
            created_at: now,
        };

        match self.store.append_command(&command).await? {
            CommandAppend::Inserted => {}
            CommandAppend::Existing(existing) => {
                debug!("identical command resubmitted, returning stored record");
                return Ok(existing);
            }
        }

        self.append_audit(
            ctx,
            run_id,
            Some(command.id.clone()),
            "command_submitted",
            command.actor.clone(),
            json!({
                "type": command.kind,
                "payload": command.payload,
                "issued_at": command.issued_at,
            }),
            now,
        )
        .await;

        self.emit_command_event(&command, CommandStage::Queued, None)
            .await;
        info!("command queued");
        Ok(command)
    }

    // ========================================================================
    // Command delivery
    // ========================================================================

    /// Deliver the oldest pending command, if any.
    ///
    /// At most one concurrent consumer observes a given command: losers of
    /// the delivery compare-and-set move on to the next pending command.
    #[instrument(skip(self, ctx), fields(run_id = %run_id))]
    pub async fn next_command(
        &self,
        run_id: &str,
        ctx: &RequestContext,
    ) -> Result<Option<RunCommand>> {
        // 404 for unknown runs, empty result for known-but-idle ones.
        self.get_run(run_id).await?;

        loop {
            let Some(mut command) = self.store.next_pending_command(run_id).await? else {
                return Ok(None);
            };

            let now = self.clock.now();
            if !self.store.mark_delivered(run_id, &command.id, now).await? {
                // Another consumer took it; look at the next one.
                debug!(command_id = %command.id, "lost delivery race, retrying");
                continue;
            }
            command.delivered_at = Some(now);

            self.append_audit(
                ctx,
                run_id,
                Some(command.id.clone()),
                "command_delivered",
                command.actor.clone(),
                json!({"type": command.kind}),
                now,
            )
            .await;

            self.emit_command_event(&command, CommandStage::Delivered, None)
                .await;
            info!(command_id = %command.id, "command delivered");
            return Ok(Some(command));
        }
    }

    // ========================================================================
    // Command acknowledgement
    // ========================================================================

    /// Acknowledge a delivered command and apply its lifecycle effect.
    ///
    /// Idempotent: re-acknowledging returns the stored record unchanged.
    #[instrument(skip(self, ctx), fields(run_id = %run_id, command_id = %command_id))]
    pub async fn ack_command(
        &self,
        run_id: &str,
        command_id: &str,
        ctx: &RequestContext,
    ) -> Result<RunCommand> {
        let mut command = self
            .store
            .get_command(run_id, command_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("command", command_id))?;

        if command.delivered_at.is_none() {
            return Err(OrchestratorError::validation(
                "command",
                "command cannot be acknowledged before delivery",
            ));
        }
        if command.acknowledged_at.is_some() {
            debug!("command already acknowledged");
            return Ok(command);
        }

        // Apply the effect before stamping: if the effect write fails the
        // command stays delivered-but-unacked and a retried ack reapplies it
        // (the reapplication is a no-op when the state already moved).
        let now = self.clock.now();
        self.apply_command_effect(&command, ctx, now).await?;

        command.acknowledged_at = Some(now);
        self.store.save_command(&command).await?;

        self.append_audit(
            ctx,
            run_id,
            Some(command.id.clone()),
            "command_acknowledged",
            command.actor.clone(),
            json!({"type": command.kind, "payload": command.payload}),
            now,
        )
        .await;

        self.emit_command_event(&command, CommandStage::Acknowledged, None)
            .await;
        info!("command acknowledged");
        Ok(command)
    }

    /// Apply the lifecycle effect of an acknowledged command.
    ///
    /// `pause`/`resume`/`terminate` transition the run per the permitted
    /// table; `tune` merges its tunables into the run's overrides. If the
    /// run's state no longer permits the move (it changed between delivery
    /// and ack), the ack still stands but the state is left untouched.
    async fn apply_command_effect(
        &self,
        command: &RunCommand,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for attempt in 0..UPDATE_RETRY_ATTEMPTS {
            let mut run = self.get_run(&command.run_id).await?;
            let expected = run.updated_at;
            let from_state = run.state;

            let to_state = match (command.kind, run.state) {
                (CommandKind::Pause, RunState::Running) => Some(RunState::Paused),
                (CommandKind::Resume, RunState::Paused) => Some(RunState::Running),
                (CommandKind::Terminate, state) if !state.is_terminal() => {
                    Some(RunState::Terminated)
                }
                (CommandKind::Tune, state)
                    if matches!(state, RunState::Running | RunState::Paused) =>
                {
                    None
                }
                (kind, state) => {
                    warn!(
                        kind = %kind,
                        state = %state,
                        "acknowledged command has no applicable effect in current state"
                    );
                    return Ok(());
                }
            };

            match to_state {
                Some(to_state) => {
                    run.state = to_state;
                    if to_state == RunState::Terminated {
                        run.ended_at = Some(now);
                        if let Some(reason) =
                            command.payload.get("reason").and_then(Value::as_str)
                        {
                            run.status_message = Some(reason.to_string());
                        }
                    }
                }
                None => merge_tune_overrides(&mut run, &command.payload),
            }
            run.updated_at = now;

            if !self.store.update_run(&run, expected).await? {
                debug!(attempt, "command effect lost optimistic write, retrying");
                continue;
            }

            if let Some(to_state) = to_state {
                let transition = RunTransition {
                    run_id: run.id.clone(),
                    from_state: Some(from_state),
                    to_state,
                    changed_by: command.actor.id.clone(),
                    reason: Some(format!("{} acknowledged", command.kind)),
                    created_at: now,
                };
                self.store.append_transition(&transition).await?;

                self.append_audit(
                    ctx,
                    &run.id,
                    Some(command.id.clone()),
                    "state_changed",
                    command.actor.clone(),
                    json!({"from": from_state, "to": to_state}),
                    now,
                )
                .await;
            }

            self.emit_run_status(&run, None).await;
            return Ok(());
        }

        Err(OrchestratorError::conflict(format!(
            "run '{}' is being updated concurrently, retry",
            command.run_id
        )))
    }

    // ========================================================================
    // Health application
    // ========================================================================

    /// Runs eligible for health scanning (non-terminal, heartbeated).
    pub async fn list_active_runs(&self) -> Result<Vec<Run>> {
        self.store.list_active_runs().await
    }

    /// Apply a derived health status to a run.
    ///
    /// No-op (returns `false`) when the stored health already matches, which
    /// makes escalation emission idempotent across scan ticks. On entry into
    /// `unresponsive`, optionally enqueues a system terminate command.
    #[instrument(skip(self), fields(run_id = %run_id, target = %target))]
    pub async fn apply_health(
        &self,
        run_id: &str,
        target: RunHealth,
        heartbeat_age: chrono::Duration,
    ) -> Result<bool> {
        for attempt in 0..UPDATE_RETRY_ATTEMPTS {
            let Some(mut run) = self.store.get_run(run_id).await? else {
                return Ok(false);
            };
            if run.state.is_terminal() || run.health_status == target {
                return Ok(false);
            }

            let now = self.clock.now();
            let expected = run.updated_at;
            run.health_status = target;
            run.updated_at = now;

            if !self.store.update_run(&run, expected).await? {
                debug!(attempt, "health update lost optimistic write, retrying");
                continue;
            }

            let last_error = match target {
                RunHealth::Healthy => None,
                RunHealth::HeartbeatStale => Some(format!(
                    "heartbeat stale: no heartbeat for {}s",
                    heartbeat_age.num_seconds()
                )),
                RunHealth::Unresponsive => Some(format!(
                    "run unresponsive: no heartbeat for {}s",
                    heartbeat_age.num_seconds()
                )),
            };

            match target {
                RunHealth::Healthy => info!("health recovered"),
                RunHealth::HeartbeatStale => warn!(
                    age_secs = heartbeat_age.num_seconds(),
                    "run heartbeat is stale"
                ),
                RunHealth::Unresponsive => warn!(
                    age_secs = heartbeat_age.num_seconds(),
                    "run is unresponsive"
                ),
            }
            self.emit_run_status(&run, last_error).await;

            if target == RunHealth::Unresponsive
                && self.options.auto_terminate_unresponsive
                && run.state != RunState::Terminating
            {
                self.auto_terminate(&run).await;
            }
            return Ok(true);
        }

        Err(OrchestratorError::conflict(format!(
            "run '{run_id}' is being updated concurrently, retry"
        )))
    }

    /// Enqueue a system terminate for an unresponsive run.
    async fn auto_terminate(&self, run: &Run) {
        let draft = CommandDraft {
            id: Uuid::new_v4().to_string(),
            kind: CommandKind::Terminate,
            payload: json!({"reason": "unresponsive"}),
            actor: CommandActor {
                kind: ActorKind::System,
                id: HEALTH_MONITOR_ACTOR.to_string(),
            },
            issued_at: self.clock.now(),
        };
        match self.submit_command(&run.id, draft, &RequestContext::internal()).await {
            Ok(command) => info!(command_id = %command.id, "auto-terminate command queued"),
            Err(err) => warn!(error = %err, "failed to queue auto-terminate command"),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn append_audit(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        command_id: Option<String>,
        action: &'static str,
        actor: CommandActor,
        detail: Value,
        at: DateTime<Utc>,
    ) {
        let record = AuditRecord {
            correlation_id: ctx.correlation_id.clone(),
            run_id: run_id.to_string(),
            command_id,
            action,
            actor,
            detail,
            source_addr: ctx.source_addr.clone(),
            client_id: ctx.client_id.clone(),
            credential_fingerprint: ctx.credential_fingerprint.clone(),
        };
        if let Err(err) = self.audit.append(record, at).await {
            // Losing an audit entry is serious but must not unwind an
            // already-committed state change.
            warn!(error = %err, action, "failed to append audit entry");
        }
    }

    async fn emit_run_status(&self, run: &Run, last_error: Option<String>) {
        let event = RunStatusEvent::from_run(run, last_error);
        if let Err(err) = self.events.publish_run_status(&event).await {
            warn!(error = %err, run_id = %run.id, "failed to publish run status event");
        }
    }

    async fn emit_command_event(
        &self,
        command: &RunCommand,
        stage: CommandStage,
        description: Option<String>,
    ) {
        let event = CommandEvent {
            run_id: command.run_id.clone(),
            command_id: command.id.clone(),
            kind: command.kind,
            event: stage,
            description,
        };
        if let Err(err) = self.events.publish_command_event(&event).await {
            warn!(
                error = %err,
                run_id = %command.run_id,
                command_id = %command.id,
                "failed to publish command event"
            );
        }
    }
}

/// State preconditions for command submission.
fn check_precondition(kind: CommandKind, state: RunState) -> Result<()> {
    let ok = match kind {
        CommandKind::Pause => state == RunState::Running,
        CommandKind::Resume => state == RunState::Paused,
        CommandKind::Tune => matches!(state, RunState::Running | RunState::Paused),
        // Any non-terminal state; terminal was rejected earlier.
        CommandKind::Terminate => !state.is_terminal(),
    };
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::conflict(format!(
            "{kind} requires a different lifecycle state (run is {state})"
        )))
    }
}

/// Merge an acknowledged tune payload's tunables into the run's overrides.
fn merge_tune_overrides(run: &mut Run, payload: &Value) {
    let overrides = run.overrides.get_or_insert_with(|| json!({}));
    if let (Value::Object(dst), Value::Object(src)) = (overrides, payload) {
        for (key, value) in src {
            if key != "notes" {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}
