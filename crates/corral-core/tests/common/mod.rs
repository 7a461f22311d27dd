// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for orchestrator integration tests.
//!
//! Provides a TestContext wiring the lifecycle service to the in-memory
//! store, a manually advanced clock, and an event-capturing publisher.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use corral_core::audit::AuditLog;
use corral_core::clock::ManualClock;
use corral_core::events::{CommandEvent, PublishError, Publisher, RunStatusEvent};
use corral_core::lifecycle::{
    CommandDraft, CreateRunInput, Lifecycle, LifecycleOptions, RequestContext,
};
use corral_core::store::{MemoryStore, RunStore};
use corral_core::throttle::{HeartbeatThrottle, ThrottleConfig};
use corral_core::types::{
    ActorKind, CommandActor, CommandKind, HeartbeatPayload, Run, RuntimeStatus,
};

/// Publisher that records every event for assertions.
#[derive(Default)]
pub struct CapturePublisher {
    pub run_status: Mutex<Vec<RunStatusEvent>>,
    pub commands: Mutex<Vec<CommandEvent>>,
}

impl CapturePublisher {
    pub fn run_status_events(&self) -> Vec<RunStatusEvent> {
        self.run_status.lock().unwrap().clone()
    }

    pub fn command_events(&self) -> Vec<CommandEvent> {
        self.commands.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.run_status.lock().unwrap().clear();
        self.commands.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for CapturePublisher {
    async fn publish_run_status(&self, event: &RunStatusEvent) -> Result<(), PublishError> {
        self.run_status.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn publish_command_event(&self, event: &CommandEvent) -> Result<(), PublishError> {
        self.commands.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Test context over the in-memory store and a manual clock.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<CapturePublisher>,
    pub lifecycle: Arc<Lifecycle>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_options(LifecycleOptions::default())
    }

    pub fn with_options(options: LifecycleOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = Arc::new(CapturePublisher::default());

        let audit = AuditLog::new(store.clone() as Arc<dyn RunStore>);
        let throttle = HeartbeatThrottle::new(
            ThrottleConfig::default(),
            clock.clone() as Arc<dyn corral_core::clock::Clock>,
        );
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone() as Arc<dyn RunStore>,
            events.clone() as Arc<dyn Publisher>,
            audit,
            clock.clone() as Arc<dyn corral_core::clock::Clock>,
            throttle,
            options,
        ));

        Self {
            store,
            clock,
            events,
            lifecycle,
        }
    }

    /// Create a run with sensible defaults.
    pub async fn create_run(&self, id: &str) -> Run {
        self.lifecycle
            .create_run(
                CreateRunInput {
                    id: id.to_string(),
                    experiment_id: "exp-1".to_string(),
                    version_id: "v1".to_string(),
                    launch_manifest: json!({}),
                    overrides: None,
                    priority: 0,
                    created_by: "alice".to_string(),
                },
                &ctx(),
            )
            .await
            .expect("create run")
    }

    /// Send a heartbeat, advancing the clock past the throttle floor first.
    pub async fn heartbeat(
        &self,
        run_id: &str,
        status: RuntimeStatus,
        step: i64,
        checkpoint_version: i64,
    ) -> Result<Run, corral_core::error::OrchestratorError> {
        self.clock.advance(chrono::Duration::seconds(15));
        self.lifecycle
            .heartbeat(run_id, &heartbeat_payload(run_id, status, step, checkpoint_version))
            .await
    }
}

/// A fresh request context.
pub fn ctx() -> RequestContext {
    RequestContext {
        correlation_id: "test-correlation".to_string(),
        source_addr: Some("127.0.0.1:9999".to_string()),
        client_id: None,
        credential_fingerprint: None,
    }
}

pub fn heartbeat_payload(
    run_id: &str,
    status: RuntimeStatus,
    step: i64,
    checkpoint_version: i64,
) -> HeartbeatPayload {
    HeartbeatPayload {
        run_id: run_id.to_string(),
        status,
        step,
        samples_per_sec: 250.0,
        loss: 0.42,
        checkpoint_version,
        queued_commands: None,
        notes: None,
    }
}

pub fn operator() -> CommandActor {
    CommandActor {
        kind: ActorKind::Operator,
        id: "alice".to_string(),
    }
}

pub fn command_draft(id: &str, kind: CommandKind, payload: Value) -> CommandDraft {
    CommandDraft {
        id: id.to_string(),
        kind,
        payload,
        actor: operator(),
        issued_at: Utc::now(),
    }
}
