// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Best-effort event fan-out.
//!
//! The store is the source of truth; events are level-triggered hints.
//! Publication failures are logged by callers and never roll back a
//! committed state change. Subscribers reconcile from the store on
//! reconnect.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{CommandKind, Run, RunHealth, RunState, RuntimeStatus};

/// Emitted whenever a run's status, counters, or health change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusEvent {
    /// The run.
    pub run_id: String,
    /// Lifecycle state.
    pub state: RunState,
    /// Learner-reported runtime status.
    pub runtime_status: RuntimeStatus,
    /// Orchestrator-derived health.
    pub health_status: RunHealth,
    /// Current training step.
    pub step: i64,
    /// Rolling throughput.
    pub samples_per_sec: f64,
    /// Last loss scalar.
    pub loss: f64,
    /// Present on escalations and failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RunStatusEvent {
    /// Build a status event from a run snapshot.
    pub fn from_run(run: &Run, last_error: Option<String>) -> Self {
        Self {
            run_id: run.id.clone(),
            state: run.state,
            runtime_status: run.runtime_status,
            health_status: run.health_status,
            step: run.current_step,
            samples_per_sec: run.samples_per_sec,
            loss: run.loss,
            last_error,
        }
    }
}

/// Command-lifecycle stage carried by a [`CommandEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStage {
    /// Accepted and pending delivery.
    Queued,
    /// Observed by a consumer.
    Delivered,
    /// Effect confirmed by the learner.
    Acknowledged,
}

/// Emitted on each command lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Target run.
    pub run_id: String,
    /// Command identifier.
    pub command_id: String,
    /// Command kind.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Which stage was reached.
    pub event: CommandStage,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Publication failure. Callers log and drop it; it never fails a request.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Downstream fan-out mechanism.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a run status event.
    async fn publish_run_status(&self, event: &RunStatusEvent) -> Result<(), PublishError>;

    /// Publish a command lifecycle event.
    async fn publish_command_event(&self, event: &CommandEvent) -> Result<(), PublishError>;
}

/// Publisher that drops everything; useful for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish_run_status(&self, _event: &RunStatusEvent) -> Result<(), PublishError> {
        Ok(())
    }

    async fn publish_command_event(&self, _event: &CommandEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// A published message: subject plus JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Routing subject, e.g. `runs` or `runs.unresponsive`.
    pub subject: String,
    /// Serialized event.
    pub payload: String,
}

/// In-process broadcast publisher.
///
/// Fans events out over a `tokio::sync::broadcast` channel using the subject
/// scheme of the downstream bus: the base subject for every status change,
/// plus alerting routing keys for escalations and failures, and a
/// `.commands` subject for the command lifecycle. Having no subscribers is
/// not an error.
pub struct ChannelPublisher {
    subject: String,
    sender: broadcast::Sender<PublishedMessage>,
}

impl ChannelPublisher {
    /// Create a publisher with the given subject prefix and buffer capacity.
    pub fn new(subject: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            subject: subject.into(),
            sender,
        }
    }

    /// Subscribe to the fan-out stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.sender.subscribe()
    }

    fn send(&self, subject: String, payload: String) {
        // Err means no live receivers, which is fine for a hint stream.
        if self.sender.send(PublishedMessage { subject, payload }).is_err() {
            debug!("no event subscribers connected");
        }
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish_run_status(&self, event: &RunStatusEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        self.send(self.subject.clone(), payload.clone());

        // Routing keys for alerting consumers.
        let routing_key = match event.health_status {
            RunHealth::HeartbeatStale => Some(format!("{}.heartbeat_stale", self.subject)),
            RunHealth::Unresponsive => Some(format!("{}.unresponsive", self.subject)),
            RunHealth::Healthy => None,
        };
        let routing_key = if matches!(event.state, RunState::Failed) {
            Some(format!("{}.error", self.subject))
        } else {
            routing_key
        };
        if let Some(key) = routing_key {
            self.send(key, payload);
        }

        debug!(
            run_id = %event.run_id,
            state = %event.state,
            health = %event.health_status,
            "published run status event"
        );
        Ok(())
    }

    async fn publish_command_event(&self, event: &CommandEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        self.send(format!("{}.commands", self.subject), payload);

        debug!(
            run_id = %event.run_id,
            command_id = %event.command_id,
            stage = ?event.event,
            "published command event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(health: RunHealth, state: RunState) -> RunStatusEvent {
        RunStatusEvent {
            run_id: "run-1".to_string(),
            state,
            runtime_status: RuntimeStatus::Running,
            health_status: health,
            step: 100,
            samples_per_sec: 250.0,
            loss: 0.42,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn status_events_reach_subscribers() {
        let publisher = ChannelPublisher::new("runs", 16);
        let mut rx = publisher.subscribe();

        publisher
            .publish_run_status(&status_event(RunHealth::Healthy, RunState::Running))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "runs");
        let decoded: RunStatusEvent = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(decoded.run_id, "run-1");
    }

    #[tokio::test]
    async fn escalations_get_routing_keys() {
        let publisher = ChannelPublisher::new("runs", 16);
        let mut rx = publisher.subscribe();

        publisher
            .publish_run_status(&status_event(RunHealth::Unresponsive, RunState::Running))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.subject, "runs");
        assert_eq!(second.subject, "runs.unresponsive");
    }

    #[tokio::test]
    async fn failed_state_routes_to_error_subject() {
        let publisher = ChannelPublisher::new("runs", 16);
        let mut rx = publisher.subscribe();

        publisher
            .publish_run_status(&status_event(RunHealth::Healthy, RunState::Failed))
            .await
            .unwrap();

        let _base = rx.recv().await.unwrap();
        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.subject, "runs.error");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_ok() {
        let publisher = ChannelPublisher::new("runs", 16);
        publisher
            .publish_run_status(&status_event(RunHealth::Healthy, RunState::Running))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn command_events_use_the_commands_subject() {
        let publisher = ChannelPublisher::new("runs", 16);
        let mut rx = publisher.subscribe();

        publisher
            .publish_command_event(&CommandEvent {
                run_id: "run-1".to_string(),
                command_id: "cmd-A".to_string(),
                kind: CommandKind::Pause,
                event: CommandStage::Queued,
                description: None,
            })
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "runs.commands");
    }
}
