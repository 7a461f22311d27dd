// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hash-chained audit log.
//!
//! Every command submission, delivery, and acknowledgement, and every
//! operator-initiated state change, appends one entry with
//! `entry_hash = SHA-256(prev_hash || canonical_json(body))`. The chain is
//! verifiable end to end; tampering with any entry invalidates all later
//! hashes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::OrchestratorError;
use crate::store::{AuditEntry, RunStore};
use crate::types::CommandActor;

/// Fields of a new audit record, before chaining.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Correlation ID of the originating request.
    pub correlation_id: String,
    /// Run the action targeted.
    pub run_id: String,
    /// Command involved, if any.
    pub command_id: Option<String>,
    /// Action tag (`command_submitted`, `command_delivered`,
    /// `command_acknowledged`, `state_changed`).
    pub action: &'static str,
    /// Who acted.
    pub actor: CommandActor,
    /// Action detail (command envelope, transition description).
    pub detail: Value,
    /// Request source address, when known.
    pub source_addr: Option<String>,
    /// Client identifier, when supplied.
    pub client_id: Option<String>,
    /// Fingerprint of the presented credential, when any.
    pub credential_fingerprint: Option<String>,
}

/// The canonical byte form that gets hashed is this struct serialized with
/// serde's declared field order; the two hash fields and the store-assigned
/// sequence number are excluded.
#[derive(Serialize)]
struct ChainBody<'a> {
    correlation_id: &'a str,
    run_id: &'a str,
    command_id: &'a Option<String>,
    action: &'a str,
    actor_kind: &'a str,
    actor_id: &'a str,
    detail: &'a Value,
    source_addr: &'a Option<String>,
    client_id: &'a Option<String>,
    credential_fingerprint: &'a Option<String>,
    created_at: &'a DateTime<Utc>,
}

fn body_of(entry: &AuditEntry) -> ChainBody<'_> {
    ChainBody {
        correlation_id: &entry.correlation_id,
        run_id: &entry.run_id,
        command_id: &entry.command_id,
        action: &entry.action,
        actor_kind: &entry.actor_kind,
        actor_id: &entry.actor_id,
        detail: &entry.detail,
        source_addr: &entry.source_addr,
        client_id: &entry.client_id,
        credential_fingerprint: &entry.credential_fingerprint,
        created_at: &entry.created_at,
    }
}

fn chain_hash(prev_hash: &str, body: &ChainBody<'_>) -> Result<String, OrchestratorError> {
    let bytes = serde_json::to_vec(body)?;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Append-only audit log with a serialized hash chain.
///
/// Appends are serialized behind a mutex holding the chain head so the
/// `prev_hash` of each entry is exactly the `entry_hash` of its predecessor
/// even under concurrent requests.
pub struct AuditLog {
    store: Arc<dyn RunStore>,
    // None until the head has been loaded from the store; the genesis
    // prev_hash is the empty string.
    head: Mutex<Option<String>>,
}

impl AuditLog {
    /// Create an audit log over the given store.
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            head: Mutex::new(None),
        }
    }

    /// Append a record, chaining it to the current head.
    pub async fn append(
        &self,
        record: AuditRecord,
        at: DateTime<Utc>,
    ) -> Result<AuditEntry, OrchestratorError> {
        let mut head = self.head.lock().await;

        let prev_hash = match head.as_ref() {
            Some(hash) => hash.clone(),
            None => self
                .store
                .latest_audit_entry()
                .await?
                .map(|entry| entry.entry_hash)
                .unwrap_or_default(),
        };

        let mut entry = AuditEntry {
            seq: 0,
            correlation_id: record.correlation_id,
            run_id: record.run_id,
            command_id: record.command_id,
            action: record.action.to_string(),
            actor_kind: record.actor.kind.as_str().to_string(),
            actor_id: record.actor.id,
            detail: record.detail,
            source_addr: record.source_addr,
            client_id: record.client_id,
            credential_fingerprint: record.credential_fingerprint,
            prev_hash: prev_hash.clone(),
            entry_hash: String::new(),
            created_at: at,
        };
        let entry_hash = chain_hash(&prev_hash, &body_of(&entry))?;
        entry.entry_hash = entry_hash;

        entry.seq = self.store.append_audit_entry(&entry).await?;
        *head = Some(entry.entry_hash.clone());

        Ok(entry)
    }

    /// Verify the whole persisted chain.
    pub async fn verify_all(&self) -> Result<(), OrchestratorError> {
        let entries = self.store.list_audit_entries().await?;
        verify(&entries)
    }
}

/// Verify a sequence of audit entries, returning the first divergence.
pub fn verify(entries: &[AuditEntry]) -> Result<(), OrchestratorError> {
    let mut prev_hash = String::new();
    for entry in entries {
        if entry.prev_hash != prev_hash {
            return Err(OrchestratorError::conflict(format!(
                "audit chain broken at seq {}: prev_hash mismatch",
                entry.seq
            )));
        }
        let recomputed = chain_hash(&entry.prev_hash, &body_of(entry))?;
        if recomputed != entry.entry_hash {
            return Err(OrchestratorError::conflict(format!(
                "audit chain broken at seq {}: entry_hash mismatch",
                entry.seq
            )));
        }
        prev_hash = entry.entry_hash.clone();
    }
    Ok(())
}
