//! In-memory store for development and tests.
//!
//! Not durable; production deployments configure the SQLite backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestratorError;
use crate::types::{canonical_payload, Run, RunCommand, RunTransition};

use super::{AuditEntry, CommandAppend, RunStore};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    // run_id -> command_id -> command
    commands: HashMap<String, HashMap<String, RunCommand>>,
    transitions: HashMap<String, Vec<RunTransition>>,
    audit: Vec<AuditEntry>,
}

/// RwLock-map backed [`RunStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &Run) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner.runs.contains_key(&run.id) {
            return Err(OrchestratorError::conflict(format!(
                "run '{}' already exists",
                run.id
            )));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.runs.get(id).cloned())
    }

    async fn update_run(
        &self,
        run: &Run,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        match inner.runs.get_mut(&run.id) {
            Some(stored) if stored.updated_at == expected_updated_at => {
                *stored = run.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OrchestratorError::not_found("run", &run.id)),
        }
    }

    async fn append_transition(
        &self,
        transition: &RunTransition,
    ) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .transitions
            .entry(transition.run_id.clone())
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn list_transitions(
        &self,
        run_id: &str,
    ) -> Result<Vec<RunTransition>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.transitions.get(run_id).cloned().unwrap_or_default())
    }

    async fn append_command(
        &self,
        command: &RunCommand,
    ) -> Result<CommandAppend, OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let per_run = inner.commands.entry(command.run_id.clone()).or_default();
        if let Some(existing) = per_run.get(&command.id) {
            if canonical_payload(&existing.payload) == canonical_payload(&command.payload) {
                return Ok(CommandAppend::Existing(existing.clone()));
            }
            return Err(OrchestratorError::conflict(format!(
                "command '{}' already exists with a different payload",
                command.id
            )));
        }
        per_run.insert(command.id.clone(), command.clone());
        Ok(CommandAppend::Inserted)
    }

    async fn get_command(
        &self,
        run_id: &str,
        command_id: &str,
    ) -> Result<Option<RunCommand>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .commands
            .get(run_id)
            .and_then(|per_run| per_run.get(command_id))
            .cloned())
    }

    async fn next_pending_command(
        &self,
        run_id: &str,
    ) -> Result<Option<RunCommand>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(per_run) = inner.commands.get(run_id) else {
            return Ok(None);
        };
        let mut pending: Vec<&RunCommand> = per_run
            .values()
            .filter(|cmd| cmd.delivered_at.is_none())
            .collect();
        pending.sort_by(|a, b| {
            a.issued_at
                .cmp(&b.issued_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(pending.first().map(|cmd| (*cmd).clone()))
    }

    async fn mark_delivered(
        &self,
        run_id: &str,
        command_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        match inner
            .commands
            .get_mut(run_id)
            .and_then(|per_run| per_run.get_mut(command_id))
        {
            Some(cmd) if cmd.delivered_at.is_none() => {
                cmd.delivered_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OrchestratorError::not_found("command", command_id)),
        }
    }

    async fn save_command(&self, command: &RunCommand) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .commands
            .entry(command.run_id.clone())
            .or_default()
            .insert(command.id.clone(), command.clone());
        Ok(())
    }

    async fn list_active_runs(&self) -> Result<Vec<Run>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| !run.state.is_terminal() && run.last_heartbeat_at.is_some())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }

    async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<i64, OrchestratorError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let seq = inner.audit.len() as i64 + 1;
        let mut stored = entry.clone();
        stored.seq = seq;
        inner.audit.push(stored);
        Ok(seq)
    }

    async fn latest_audit_entry(&self) -> Result<Option<AuditEntry>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.audit.last().cloned())
    }

    async fn list_audit_entries(&self) -> Result<Vec<AuditEntry>, OrchestratorError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.audit.clone())
    }

    async fn health_check(&self) -> Result<bool, OrchestratorError> {
        Ok(true)
    }
}
