// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint tracking and persistence.
//!
//! The checkpoint records the highest local sequence known to be fully
//! handled: every sequence at or below it has been delivered to the remote,
//! skipped by the remote's diff response, or filtered out locally. It is
//! persisted *on the remote* as a `_local` document keyed by a session ID
//! derived from everything that shapes the replication's output, so two
//! differently-filtered replications never share progress.
//!
//! # Pending Sequences
//!
//! Uploads complete out of order, so the checkpoint cannot simply track the
//! last acknowledged sequence. [`PendingSequences`] holds every sequence
//! currently in flight (queued for diff, queued for upload, or uploading).
//! The checkpoint candidate only advances when the *lowest* pending
//! sequence is removed:
//!
//! ```text
//! pending = {5, 6, 7}
//! remove(6)  -> no candidate   (6 was not the minimum)
//! remove(5)  -> candidate 6    (new minimum 7, minus one)
//! remove(7)  -> candidate 7    (set empty, fall back to max ever added)
//! ```
//!
//! Removing a sequence that was never tracked is logged and never advances
//! the checkpoint.
//!
//! # Save Semantics
//!
//! Saves chain the stored document's `_rev`. A conflicting save (another
//! client, or a stale `_rev` after a remote compaction) refreshes the
//! stored revision and retries once; a second conflict drops the save, and
//! the next checkpoint advance retries with fresh state. Losing a save is
//! safe: on restart the replicator re-offers work the remote already has,
//! and `_revs_diff` discards it cheaply.

use crate::error::{ReplicatorError, Result};
use crate::remote::{HttpMethod, RemoteTransport};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sorted set of local sequences currently in flight.
#[derive(Debug, Default)]
pub struct PendingSequences {
    set: BTreeSet<u64>,
    /// Highest sequence ever added, even after removal.
    max_pending: u64,
}

impl PendingSequences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a sequence. The change feed is monotonic, so sequences arrive
    /// in ascending order.
    pub fn add(&mut self, seq: u64) {
        self.set.insert(seq);
        self.max_pending = self.max_pending.max(seq);
    }

    /// Untrack a sequence.
    ///
    /// Returns the new checkpoint candidate when the removed sequence was
    /// the current minimum: one below the new minimum, or `max_pending`
    /// when the set drained. Returns `None` otherwise - including when the
    /// sequence was never tracked, which is logged and deliberately does
    /// not advance anything.
    pub fn remove(&mut self, seq: u64) -> Option<u64> {
        let was_first = self.set.first() == Some(&seq);
        if !self.set.remove(&seq) {
            warn!(seq, "removing untracked pending sequence");
            return None;
        }
        if !was_first {
            return None;
        }
        Some(match self.set.first() {
            Some(&new_min) => new_min - 1,
            None => self.max_pending,
        })
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.set.contains(&seq)
    }

    pub fn min(&self) -> Option<u64> {
        self.set.first().copied()
    }

    pub fn max_pending(&self) -> u64 {
        self.max_pending
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Derive the stable checkpoint session ID for a push replication.
///
/// The digest covers the local database UUID, the remote URL, the push
/// direction, and the filter configuration, so any change to what gets
/// replicated starts a fresh checkpoint.
pub fn session_id(
    local_uuid: &str,
    remote_url: &str,
    filter: Option<&str>,
    filter_params: &serde_json::Map<String, Value>,
    doc_ids: &[String],
) -> String {
    let key = json!([
        "push",
        local_uuid,
        remote_url,
        filter,
        filter_params,
        doc_ids,
    ]);
    // serde_json objects are BTree-ordered, so the encoding is canonical.
    let digest = Sha256::digest(serde_json::to_vec(&key).expect("session key serializes"));
    hex::encode(digest)
}

/// Remote-persisted checkpoint document at `_local/<session_id>`.
pub struct CheckpointStore {
    transport: Arc<dyn RemoteTransport>,
    session_id: String,
    doc_path: String,
    /// `_rev` of the stored checkpoint document, chained across saves.
    rev: Option<String>,
    /// Last value successfully written.
    last_saved: Option<String>,
    /// True while a save is in flight.
    saving: bool,
}

impl CheckpointStore {
    pub fn new(transport: Arc<dyn RemoteTransport>, session_id: String) -> Self {
        let doc_path = format!("_local/{}", session_id);
        Self {
            transport,
            session_id,
            doc_path,
            rev: None,
            last_saved: None,
            saving: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// Last sequence value known to be persisted remotely.
    pub fn last_saved(&self) -> Option<&str> {
        self.last_saved.as_deref()
    }

    /// Fetch the stored checkpoint.
    ///
    /// `None` means no checkpoint exists yet (first replication for this
    /// session key, or the remote database was recreated).
    pub async fn load(&mut self) -> Result<Option<String>> {
        let response = self
            .transport
            .send_json(HttpMethod::Get, &self.doc_path, None)
            .await?;

        match response.status {
            404 => {
                debug!(session = %self.session_id, "no checkpoint on remote");
                self.rev = None;
                Ok(None)
            }
            status if (200..300).contains(&status) => {
                self.rev = response
                    .body
                    .get("_rev")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let seq = response
                    .body
                    .get("lastSequence")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                info!(
                    session = %self.session_id,
                    last_sequence = seq.as_deref().unwrap_or(""),
                    "loaded checkpoint"
                );
                self.last_saved = seq.clone();
                Ok(seq)
            }
            status => Err(ReplicatorError::Http {
                status,
                operation: format!("GET {}", self.doc_path),
            }),
        }
    }

    /// Persist a new checkpoint value.
    ///
    /// A 409 refreshes the stored `_rev` and retries once.
    pub async fn save(&mut self, sequence: &str) -> Result<()> {
        self.saving = true;
        let result = self.save_inner(sequence).await;
        self.saving = false;
        result
    }

    async fn save_inner(&mut self, sequence: &str) -> Result<()> {
        for attempt in 0..2 {
            let mut body = json!({ "lastSequence": sequence });
            if let Some(rev) = &self.rev {
                body["_rev"] = Value::String(rev.clone());
            }

            let response = self
                .transport
                .send_json(HttpMethod::Put, &self.doc_path, Some(body))
                .await?;

            if response.is_success() {
                self.rev = response
                    .body
                    .get("rev")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| self.rev.clone());
                self.last_saved = Some(sequence.to_string());
                debug!(session = %self.session_id, sequence, "checkpoint saved");
                return Ok(());
            }

            if response.status == 409 && attempt == 0 {
                warn!(session = %self.session_id, "checkpoint conflict, refreshing _rev");
                let current = self
                    .transport
                    .send_json(HttpMethod::Get, &self.doc_path, None)
                    .await?;
                self.rev = current
                    .body
                    .get("_rev")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                continue;
            }

            warn!(
                session = %self.session_id,
                status = response.status,
                "checkpoint save failed"
            );
            return Err(ReplicatorError::Http {
                status: response.status,
                operation: format!("PUT {}", self.doc_path),
            });
        }
        unreachable!("save loop always returns")
    }
}
