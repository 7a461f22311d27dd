// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command submission, delivery, acknowledgement, and the audit chain.

mod common;

use common::*;
use corral_core::audit;
use corral_core::events::CommandStage;
use corral_core::store::RunStore;
use corral_core::types::{CommandKind, RunState, RuntimeStatus};
use serde_json::json;

/// Create a run and heartbeat it into the running state.
async fn running_run(ctx_t: &TestContext, id: &str) {
    ctx_t.create_run(id).await;
    ctx_t
        .heartbeat(id, RuntimeStatus::Running, 100, 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn pause_resume_cycle_transitions_on_ack() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    // Submit, deliver, ack a pause.
    let cmd = ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap();
    assert!(cmd.delivered_at.is_none());

    let delivered = ctx_t
        .lifecycle
        .next_command("run-1", &ctx())
        .await
        .unwrap()
        .expect("pending command");
    assert_eq!(delivered.id, "cmd-A");
    assert!(delivered.delivered_at.is_some());

    // Not paused yet; only the ack applies the effect.
    assert_eq!(
        ctx_t.lifecycle.get_run("run-1").await.unwrap().state,
        RunState::Running
    );

    let acked = ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-A", &ctx())
        .await
        .unwrap();
    assert!(acked.acknowledged_at.is_some());
    assert_eq!(
        ctx_t.lifecycle.get_run("run-1").await.unwrap().state,
        RunState::Paused
    );

    // Re-ack is a no-op.
    let again = ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-A", &ctx())
        .await
        .unwrap();
    assert_eq!(again.acknowledged_at, acked.acknowledged_at);
    assert_eq!(
        ctx_t.lifecycle.get_run("run-1").await.unwrap().state,
        RunState::Paused
    );

    // Resume flows back to running.
    ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft("cmd-B", CommandKind::Resume, json!({})),
            &ctx(),
        )
        .await
        .unwrap();
    ctx_t.lifecycle.next_command("run-1", &ctx()).await.unwrap();
    ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-B", &ctx())
        .await
        .unwrap();
    assert_eq!(
        ctx_t.lifecycle.get_run("run-1").await.unwrap().state,
        RunState::Running
    );
}

#[tokio::test]
async fn pause_requires_running_state() {
    let ctx_t = TestContext::new();
    ctx_t.create_run("run-1").await; // still queued

    let err = ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
}

#[tokio::test]
async fn tune_bounds_are_enforced_at_submission() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft("cmd-B", CommandKind::Tune, json!({"learning_rate": 0.5})),
            &ctx(),
        )
        .await
        .unwrap();

    let err = ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft("cmd-X", CommandKind::Tune, json!({"learning_rate": 1.5})),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid");
}

#[tokio::test]
async fn identical_resubmission_is_idempotent_divergent_conflicts() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    let first = ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft("cmd-B", CommandKind::Tune, json!({"learning_rate": 0.5})),
            &ctx(),
        )
        .await
        .unwrap();

    let replay = ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft("cmd-B", CommandKind::Tune, json!({"learning_rate": 0.5})),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(replay, first);

    let err = ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft("cmd-B", CommandKind::Tune, json!({"learning_rate": 0.7})),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
}

#[tokio::test]
async fn resubmission_after_delivery_returns_the_delivered_record() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap();
    ctx_t.lifecycle.next_command("run-1", &ctx()).await.unwrap();

    let replay = ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap();
    assert!(replay.delivered_at.is_some());
}

#[tokio::test]
async fn tune_ack_merges_overrides_without_state_change() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft(
                "cmd-B",
                CommandKind::Tune,
                json!({"learning_rate": 0.5, "entropy_coef": 0.01}),
            ),
            &ctx(),
        )
        .await
        .unwrap();
    ctx_t.lifecycle.next_command("run-1", &ctx()).await.unwrap();
    ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-B", &ctx())
        .await
        .unwrap();

    let run = ctx_t.lifecycle.get_run("run-1").await.unwrap();
    assert_eq!(run.state, RunState::Running);
    let overrides = run.overrides.expect("overrides applied");
    assert_eq!(overrides["learning_rate"], json!(0.5));
    assert_eq!(overrides["entropy_coef"], json!(0.01));
}

#[tokio::test]
async fn terminate_from_paused_then_heartbeat_conflicts() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    // Pause first.
    ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap();
    ctx_t.lifecycle.next_command("run-1", &ctx()).await.unwrap();
    ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-A", &ctx())
        .await
        .unwrap();

    // Terminate from paused.
    ctx_t
        .lifecycle
        .submit_command(
            "run-1",
            command_draft(
                "cmd-C",
                CommandKind::Terminate,
                json!({"reason": "budget exhausted"}),
            ),
            &ctx(),
        )
        .await
        .unwrap();
    ctx_t.lifecycle.next_command("run-1", &ctx()).await.unwrap();
    ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-C", &ctx())
        .await
        .unwrap();

    let run = ctx_t.lifecycle.get_run("run-1").await.unwrap();
    assert_eq!(run.state, RunState::Terminated);
    assert_eq!(run.status_message.as_deref(), Some("budget exhausted"));
    assert!(run.ended_at.is_some());

    // Post-terminal heartbeat conflicts.
    let err = ctx_t
        .heartbeat("run-1", RuntimeStatus::Running, 999, 9)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");

    // Post-terminal command submission conflicts too.
    let err = ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-D", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
}

#[tokio::test]
async fn ack_before_delivery_is_invalid() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap();

    let err = ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-A", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid");
}

#[tokio::test]
async fn ack_of_unknown_command_is_not_found() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    let err = ctx_t
        .lifecycle
        .ack_command("run-1", "ghost", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn delivery_is_fifo_by_issued_at() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    let base = chrono::Utc::now();
    let mut first = command_draft("cmd-late", CommandKind::Tune, json!({"learning_rate": 0.1}));
    first.issued_at = base + chrono::Duration::seconds(10);
    let mut second = command_draft("cmd-early", CommandKind::Tune, json!({"learning_rate": 0.2}));
    second.issued_at = base;

    ctx_t
        .lifecycle
        .submit_command("run-1", first, &ctx())
        .await
        .unwrap();
    ctx_t
        .lifecycle
        .submit_command("run-1", second, &ctx())
        .await
        .unwrap();

    let delivered = ctx_t
        .lifecycle
        .next_command("run-1", &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.id, "cmd-early");
}

#[tokio::test]
async fn empty_queue_returns_none() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    assert!(ctx_t
        .lifecycle
        .next_command("run-1", &ctx())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn command_lifecycle_emits_stage_events() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;
    ctx_t.events.clear();

    ctx_t
        .lifecycle
        .submit_command("run-1", command_draft("cmd-A", CommandKind::Pause, json!({})), &ctx())
        .await
        .unwrap();
    ctx_t.lifecycle.next_command("run-1", &ctx()).await.unwrap();
    ctx_t
        .lifecycle
        .ack_command("run-1", "cmd-A", &ctx())
        .await
        .unwrap();

    let stages: Vec<CommandStage> = ctx_t
        .events
        .command_events()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        stages,
        vec![
            CommandStage::Queued,
            CommandStage::Delivered,
            CommandStage::Acknowledged
        ]
    );
}

#[tokio::test]
async fn audit_chain_is_contiguous_and_tamper_evident() {
    let ctx_t = TestContext::new();
    running_run(&ctx_t, "run-1").await;

    for (id, lr) in [("cmd-A", 0.1), ("cmd-B", 0.2), ("cmd-C", 0.3)] {
        ctx_t
            .lifecycle
            .submit_command(
                "run-1",
                command_draft(id, CommandKind::Tune, json!({"learning_rate": lr})),
                &ctx(),
            )
            .await
            .unwrap();
    }

    let entries = ctx_t.store.list_audit_entries().await.unwrap();
    // One entry for run creation plus three submissions.
    assert!(entries.len() >= 4);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].entry_hash);
    }
    audit::verify(&entries).unwrap();

    // Mutating an entry invalidates verification from that point on.
    let mut tampered = entries.clone();
    tampered[1].detail = json!({"type": "terminate"});
    assert!(audit::verify(&tampered).is_err());
}
