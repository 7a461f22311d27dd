//! SQLite-backed store implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::OrchestratorError;
use crate::migrations;
use crate::types::{
    canonical_payload, ActorKind, CommandActor, CommandKind, Run, RunCommand, RunHealth,
    RunState, RunTransition, RuntimeStatus,
};

use super::{AuditEntry, CommandAppend, RunStore};

/// SQLite-backed store provider.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store from an existing pool. Migrations must already
    /// have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, OrchestratorError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| {
                OrchestratorError::storage("connect", format!("failed to connect to {url}: {e}"))
            })?;

        migrations::SQLITE
            .run(&pool)
            .await
            .map_err(|e| OrchestratorError::storage("migrate", e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file if missing, connects,
    /// and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    OrchestratorError::storage(
                        "create_dir",
                        format!("failed to create directory {parent:?}: {e}"),
                    )
                })?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    experiment_id: String,
    version_id: String,
    state: String,
    status_message: Option<String>,
    priority: i32,
    launch_manifest: String,
    overrides: Option<String>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    runtime_status: String,
    health_status: String,
    current_step: i64,
    samples_per_sec: f64,
    loss: f64,
    checkpoint_version: i64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = OrchestratorError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            state: parse_enum(RunState::parse, &row.state, "state")?,
            runtime_status: parse_enum(RuntimeStatus::parse, &row.runtime_status, "runtime_status")?,
            health_status: parse_enum(RunHealth::parse, &row.health_status, "health_status")?,
            launch_manifest: serde_json::from_str(&row.launch_manifest)?,
            overrides: row
                .overrides
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: row.id,
            experiment_id: row.experiment_id,
            version_id: row.version_id,
            status_message: row.status_message,
            priority: row.priority,
            last_heartbeat_at: row.last_heartbeat_at,
            current_step: row.current_step,
            samples_per_sec: row.samples_per_sec,
            loss: row.loss,
            checkpoint_version: row.checkpoint_version,
            started_at: row.started_at,
            ended_at: row.ended_at,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommandRow {
    run_id: String,
    id: String,
    kind: String,
    payload: String,
    actor_kind: String,
    actor_id: String,
    issued_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    acknowledged_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CommandRow> for RunCommand {
    type Error = OrchestratorError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        Ok(RunCommand {
            kind: parse_enum(CommandKind::parse, &row.kind, "kind")?,
            payload: serde_json::from_str(&row.payload)?,
            actor: CommandActor {
                kind: parse_enum(ActorKind::parse, &row.actor_kind, "actor_kind")?,
                id: row.actor_id,
            },
            id: row.id,
            run_id: row.run_id,
            issued_at: row.issued_at,
            delivered_at: row.delivered_at,
            acknowledged_at: row.acknowledged_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    run_id: String,
    from_state: Option<String>,
    to_state: String,
    changed_by: String,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for RunTransition {
    type Error = OrchestratorError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(RunTransition {
            from_state: row
                .from_state
                .as_deref()
                .map(|s| parse_enum(RunState::parse, s, "from_state"))
                .transpose()?,
            to_state: parse_enum(RunState::parse, &row.to_state, "to_state")?,
            run_id: row.run_id,
            changed_by: row.changed_by,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    seq: i64,
    correlation_id: String,
    run_id: String,
    command_id: Option<String>,
    action: String,
    actor_kind: String,
    actor_id: String,
    detail: String,
    source_addr: Option<String>,
    client_id: Option<String>,
    credential_fingerprint: Option<String>,
    prev_hash: String,
    entry_hash: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = OrchestratorError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            detail: serde_json::from_str(&row.detail)?,
            seq: row.seq,
            correlation_id: row.correlation_id,
            run_id: row.run_id,
            command_id: row.command_id,
            action: row.action,
            actor_kind: row.actor_kind,
            actor_id: row.actor_id,
            source_addr: row.source_addr,
            client_id: row.client_id,
            credential_fingerprint: row.credential_fingerprint,
            prev_hash: row.prev_hash,
            entry_hash: row.entry_hash,
            created_at: row.created_at,
        })
    }
}

fn parse_enum<T>(
    parse: fn(&str) -> Option<T>,
    value: &str,
    column: &str,
) -> Result<T, OrchestratorError> {
    parse(value).ok_or_else(|| {
        OrchestratorError::storage("decode", format!("unknown {column} value '{value}'"))
    })
}

const TERMINAL_STATES: &str = "'completed', 'failed', 'terminated'";

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, run: &Run) -> Result<(), OrchestratorError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (
                id, experiment_id, version_id, state, status_message, priority,
                launch_manifest, overrides, last_heartbeat_at, runtime_status,
                health_status, current_step, samples_per_sec, loss,
                checkpoint_version, started_at, ended_at, created_by,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.experiment_id)
        .bind(&run.version_id)
        .bind(run.state.as_str())
        .bind(&run.status_message)
        .bind(run.priority)
        .bind(run.launch_manifest.to_string())
        .bind(run.overrides.as_ref().map(|v| v.to_string()))
        .bind(run.last_heartbeat_at)
        .bind(run.runtime_status.as_str())
        .bind(run.health_status.as_str())
        .bind(run.current_step)
        .bind(run.samples_per_sec)
        .bind(run.loss)
        .bind(run.checkpoint_version)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.created_by)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(OrchestratorError::conflict(format!(
                "run '{}' already exists",
                run.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, OrchestratorError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, experiment_id, version_id, state, status_message, priority,
                   launch_manifest, overrides, last_heartbeat_at, runtime_status,
                   health_status, current_step, samples_per_sec, loss,
                   checkpoint_version, started_at, ended_at, created_by,
                   created_at, updated_at
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn update_run(
        &self,
        run: &Run,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state = ?, status_message = ?, priority = ?, launch_manifest = ?,
                overrides = ?, last_heartbeat_at = ?, runtime_status = ?,
                health_status = ?, current_step = ?, samples_per_sec = ?,
                loss = ?, checkpoint_version = ?, started_at = ?, ended_at = ?,
                updated_at = ?
            WHERE id = ? AND updated_at = ?
            "#,
        )
        .bind(run.state.as_str())
        .bind(&run.status_message)
        .bind(run.priority)
        .bind(run.launch_manifest.to_string())
        .bind(run.overrides.as_ref().map(|v| v.to_string()))
        .bind(run.last_heartbeat_at)
        .bind(run.runtime_status.as_str())
        .bind(run.health_status.as_str())
        .bind(run.current_step)
        .bind(run.samples_per_sec)
        .bind(run.loss)
        .bind(run.checkpoint_version)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.updated_at)
        .bind(&run.id)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_transition(
        &self,
        transition: &RunTransition,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            r#"
            INSERT INTO run_transitions (run_id, from_state, to_state, changed_by, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&transition.run_id)
        .bind(transition.from_state.map(RunState::as_str))
        .bind(transition.to_state.as_str())
        .bind(&transition.changed_by)
        .bind(&transition.reason)
        .bind(transition.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transitions(
        &self,
        run_id: &str,
    ) -> Result<Vec<RunTransition>, OrchestratorError> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT run_id, from_state, to_state, changed_by, reason, created_at
            FROM run_transitions
            WHERE run_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunTransition::try_from).collect()
    }

    async fn append_command(
        &self,
        command: &RunCommand,
    ) -> Result<CommandAppend, OrchestratorError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO run_commands (
                run_id, id, kind, payload, actor_kind, actor_id,
                issued_at, delivered_at, acknowledged_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&command.run_id)
        .bind(&command.id)
        .bind(command.kind.as_str())
        .bind(canonical_payload(&command.payload))
        .bind(command.actor.kind.as_str())
        .bind(&command.actor.id)
        .bind(command.issued_at)
        .bind(command.delivered_at)
        .bind(command.acknowledged_at)
        .bind(command.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(CommandAppend::Inserted);
        }

        // Lost to an earlier insert; idempotent only if the payload matches.
        let existing = self
            .get_command(&command.run_id, &command.id)
            .await?
            .ok_or_else(|| OrchestratorError::storage("append_command", "insert race lost twice"))?;
        if canonical_payload(&existing.payload) == canonical_payload(&command.payload) {
            Ok(CommandAppend::Existing(existing))
        } else {
            Err(OrchestratorError::conflict(format!(
                "command '{}' already exists with a different payload",
                command.id
            )))
        }
    }

    async fn get_command(
        &self,
        run_id: &str,
        command_id: &str,
    ) -> Result<Option<RunCommand>, OrchestratorError> {
        let row = sqlx::query_as::<_, CommandRow>(
            r#"
            SELECT run_id, id, kind, payload, actor_kind, actor_id,
                   issued_at, delivered_at, acknowledged_at, created_at
            FROM run_commands
            WHERE run_id = ? AND id = ?
            "#,
        )
        .bind(run_id)
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunCommand::try_from).transpose()
    }

    async fn next_pending_command(
        &self,
        run_id: &str,
    ) -> Result<Option<RunCommand>, OrchestratorError> {
        let row = sqlx::query_as::<_, CommandRow>(
            r#"
            SELECT run_id, id, kind, payload, actor_kind, actor_id,
                   issued_at, delivered_at, acknowledged_at, created_at
            FROM run_commands
            WHERE run_id = ? AND delivered_at IS NULL
            ORDER BY issued_at, created_at, id
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunCommand::try_from).transpose()
    }

    async fn mark_delivered(
        &self,
        run_id: &str,
        command_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            r#"
            UPDATE run_commands
            SET delivered_at = ?
            WHERE run_id = ? AND id = ? AND delivered_at IS NULL
            "#,
        )
        .bind(at)
        .bind(run_id)
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_command(&self, command: &RunCommand) -> Result<(), OrchestratorError> {
        sqlx::query(
            r#"
            UPDATE run_commands
            SET delivered_at = ?, acknowledged_at = ?
            WHERE run_id = ? AND id = ?
            "#,
        )
        .bind(command.delivered_at)
        .bind(command.acknowledged_at)
        .bind(&command.run_id)
        .bind(&command.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_active_runs(&self) -> Result<Vec<Run>, OrchestratorError> {
        let query = format!(
            r#"
            SELECT id, experiment_id, version_id, state, status_message, priority,
                   launch_manifest, overrides, last_heartbeat_at, runtime_status,
                   health_status, current_step, samples_per_sec, loss,
                   checkpoint_version, started_at, ended_at, created_by,
                   created_at, updated_at
            FROM runs
            WHERE state NOT IN ({TERMINAL_STATES})
              AND last_heartbeat_at IS NOT NULL
            ORDER BY id
            "#
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<i64, OrchestratorError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_entries (
                correlation_id, run_id, command_id, action, actor_kind, actor_id,
                detail, source_addr, client_id, credential_fingerprint,
                prev_hash, entry_hash, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.correlation_id)
        .bind(&entry.run_id)
        .bind(&entry.command_id)
        .bind(&entry.action)
        .bind(&entry.actor_kind)
        .bind(&entry.actor_id)
        .bind(entry.detail.to_string())
        .bind(&entry.source_addr)
        .bind(&entry.client_id)
        .bind(&entry.credential_fingerprint)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn latest_audit_entry(&self) -> Result<Option<AuditEntry>, OrchestratorError> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT seq, correlation_id, run_id, command_id, action, actor_kind,
                   actor_id, detail, source_addr, client_id,
                   credential_fingerprint, prev_hash, entry_hash, created_at
            FROM audit_entries
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(AuditEntry::try_from).transpose()
    }

    async fn list_audit_entries(&self) -> Result<Vec<AuditEntry>, OrchestratorError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT seq, correlation_id, run_id, command_id, action, actor_kind,
                   actor_id, detail, source_addr, client_id,
                   credential_fingerprint, prev_hash, entry_hash, created_at
            FROM audit_entries
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn health_check(&self) -> Result<bool, OrchestratorError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
