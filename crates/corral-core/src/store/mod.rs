//! Persistence interfaces and backends for the orchestrator core.
//!
//! This module defines the storage abstraction and backend implementations.
//! The store is the single source of truth; every mutation in the system
//! flows through it.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorError;
use crate::types::{Run, RunCommand, RunTransition};

/// Append-only, hash-chained audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Store-assigned sequence number (0 before insertion).
    pub seq: i64,
    /// Correlation ID of the request that produced the entry.
    pub correlation_id: String,
    /// Run the action targeted.
    pub run_id: String,
    /// Command involved, when the action concerns one.
    pub command_id: Option<String>,
    /// What happened: `command_submitted`, `command_delivered`,
    /// `command_acknowledged`, or `state_changed`.
    pub action: String,
    /// Actor kind (`operator` or `system`).
    pub actor_kind: String,
    /// Actor principal ID.
    pub actor_id: String,
    /// Action detail (command envelope, transition description).
    pub detail: Value,
    /// Request source address, when known.
    pub source_addr: Option<String>,
    /// Client identifier header, when supplied.
    pub client_id: Option<String>,
    /// Fingerprint of the presented credential, when any.
    pub credential_fingerprint: Option<String>,
    /// Hash of the previous entry; empty for the genesis entry.
    pub prev_hash: String,
    /// Hash of this entry.
    pub entry_hash: String,
    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
}

/// Outcome of appending a command.
#[derive(Debug, Clone)]
pub enum CommandAppend {
    /// The command was inserted.
    Inserted,
    /// An identical command already existed; the stored record is returned.
    Existing(RunCommand),
}

/// Persistence interface used by the lifecycle service and health monitor.
///
/// Each operation is atomic. Uniqueness and CAS failures surface as
/// `conflict`; backend failures surface as `unavailable`.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run. Fails with `conflict` if the ID is taken.
    async fn create_run(&self, run: &Run) -> Result<(), OrchestratorError>;

    /// Fetch a run by ID.
    async fn get_run(&self, id: &str) -> Result<Option<Run>, OrchestratorError>;

    /// Conditionally replace a run.
    ///
    /// The write only applies when the stored `updated_at` still equals
    /// `expected_updated_at`; returns whether it did. Callers retry the
    /// read-modify-write on `false`.
    async fn update_run(
        &self,
        run: &Run,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError>;

    /// Append a state-transition record.
    async fn append_transition(&self, transition: &RunTransition)
        -> Result<(), OrchestratorError>;

    /// List transitions for a run in append order.
    async fn list_transitions(
        &self,
        run_id: &str,
    ) -> Result<Vec<RunTransition>, OrchestratorError>;

    /// Insert a command if `(run_id, id)` is new.
    ///
    /// If the pair exists with a byte-identical canonical payload, returns
    /// [`CommandAppend::Existing`]; a divergent payload fails `conflict`.
    async fn append_command(
        &self,
        command: &RunCommand,
    ) -> Result<CommandAppend, OrchestratorError>;

    /// Fetch a command by `(run_id, id)`.
    async fn get_command(
        &self,
        run_id: &str,
        command_id: &str,
    ) -> Result<Option<RunCommand>, OrchestratorError>;

    /// Oldest undelivered command for a run, ordered by `issued_at`, then
    /// `created_at`, then command ID.
    async fn next_pending_command(
        &self,
        run_id: &str,
    ) -> Result<Option<RunCommand>, OrchestratorError>;

    /// Compare-and-set the delivery stamp (`delivered_at IS NULL` → `at`).
    ///
    /// Returns whether this caller won the race; at most one caller observes
    /// `true` for a given command.
    async fn mark_delivered(
        &self,
        run_id: &str,
        command_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError>;

    /// Unconditionally upsert a command's delivery/ack stamps.
    async fn save_command(&self, command: &RunCommand) -> Result<(), OrchestratorError>;

    /// List runs in a non-terminal lifecycle state that have heartbeated at
    /// least once. Used by the health monitor; must be index-backed.
    async fn list_active_runs(&self) -> Result<Vec<Run>, OrchestratorError>;

    /// Append an audit entry, assigning its sequence number.
    async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<i64, OrchestratorError>;

    /// The most recently appended audit entry, if any.
    async fn latest_audit_entry(&self) -> Result<Option<AuditEntry>, OrchestratorError>;

    /// All audit entries in sequence order.
    async fn list_audit_entries(&self) -> Result<Vec<AuditEntry>, OrchestratorError>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> Result<bool, OrchestratorError>;
}
