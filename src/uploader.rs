// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upload pipeline: diff negotiation, bulk upload, multipart upload.
//!
//! For each inbox batch the uploader:
//! 1. POSTs `{docID: [revID…]}` to `_revs_diff` and partitions the batch
//!    into revisions the remote already has and revisions it lacks.
//! 2. Loads full bodies for the missing revisions and stubs out
//!    attachments the remote can reach through a common ancestor.
//! 3. Packs plain revisions into one `_bulk_docs` request with
//!    `new_edits=false`, and streams revisions with large attachments
//!    individually as `multipart/related` PUTs through the single-slot
//!    upload queue.
//!
//! # Per-Document Failures
//!
//! `_bulk_docs` answers per document. A 401/403/409 item means the remote
//! authoritatively refused that revision; the replicator did its job in
//! offering it, so these never fail the replication. The affected sequences
//! stay pending for one retry pass (see the driver), after which a repeat
//! refusal is re-classified as delivered.
//!
//! # Multipart Fallback
//!
//! A `415 Unsupported Media Type` on a multipart PUT permanently disables
//! multipart for the session. The same revision is re-issued immediately as
//! a JSON PUT with attachment bodies inlined as base64, and every later
//! revision skips the multipart path.

use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::multipart::{build_related, AttachmentPart, UploadQueue};
use crate::remote::{escape_doc_id, HttpMethod, RemoteTransport};
use crate::revision::{find_common_ancestor, Revision, RevisionList};
use crate::store::{LoadOptions, LocalStore};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the remote reported for one document in `_revs_diff`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DiffEntry {
    /// Revisions the remote lacks.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Revisions the remote has that may be ancestors, usable for
    /// attachment stubbing.
    #[serde(default)]
    pub possible_ancestors: Vec<String>,
}

/// Full `_revs_diff` response, keyed by document ID.
pub type DiffResponse = HashMap<String, DiffEntry>;

/// A revision the remote (or the local store) rejected this pass.
#[derive(Debug, Clone)]
pub struct RevisionFailure {
    pub revision: Revision,
    /// HTTP-style status for remote refusals; `None` when the local store
    /// failed to produce the body.
    pub status: Option<u16>,
}

impl RevisionFailure {
    /// Refusals the remote will repeat no matter how often we offer the
    /// revision.
    pub fn is_auth_or_conflict(&self) -> bool {
        matches!(self.status, Some(401) | Some(403) | Some(409))
    }
}

/// Result of pushing one batch of missing revisions.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub delivered: Vec<Revision>,
    pub failed: Vec<RevisionFailure>,
}

/// Classify one item of a `_bulk_docs` response.
///
/// Returns `None` for success, or the effective HTTP status:
/// - a numeric `"status"` field >= 400 wins,
/// - otherwise the magic error strings map to 401/403/409,
/// - any other error string is a 502 upstream error.
pub fn status_from_bulk_item(item: &Value) -> Option<u16> {
    let error = item.get("error")?;
    if error.is_null() {
        return None;
    }

    if let Some(status) = item.get("status").and_then(Value::as_u64) {
        if status >= 400 {
            return Some(status as u16);
        }
    }

    Some(match error.as_str() {
        Some("unauthorized") => 401,
        Some("forbidden") => 403,
        Some("conflict") => 409,
        _ => 502,
    })
}

/// Replace attachments the remote already has with stubs.
///
/// Any entry whose `revpos` is at or below the common-ancestor generation
/// exists on the remote under that ancestor; its body need not travel.
pub fn stub_attachments_before(rev: &mut Revision, generation: u64) {
    let Some(attachments) = rev.attachments_mut() else {
        return;
    };
    for (_, entry) in attachments.iter_mut() {
        let Some(entry) = entry.as_object_mut() else {
            continue;
        };
        let revpos = entry.get("revpos").and_then(Value::as_u64).unwrap_or(0);
        if revpos > 0 && revpos <= generation {
            entry.remove("data");
            entry.remove("follows");
            entry.insert("stub".to_string(), Value::Bool(true));
        }
    }
}

/// Build the `_revs_diff` request body for a batch.
pub fn diff_request_body(batch: &RevisionList) -> Value {
    let mut body: Map<String, Value> = Map::new();
    for rev in batch.iter() {
        body.entry(rev.doc_id.clone())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("diff body entries are arrays")
            .push(Value::String(rev.rev_id.clone()));
    }
    Value::Object(body)
}

/// Split a batch by what the remote reported.
///
/// A revision is already present when the response omits its document or
/// omits its revision ID from `missing`.
pub fn partition_by_diff(batch: RevisionList, diff: &DiffResponse) -> (Vec<Revision>, Vec<Revision>) {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for rev in batch {
        let is_missing = diff
            .get(&rev.doc_id)
            .is_some_and(|entry| entry.missing.iter().any(|r| r == &rev.rev_id));
        if is_missing {
            missing.push(rev);
        } else {
            present.push(rev);
        }
    }
    (present, missing)
}

enum MultipartResult {
    Delivered(Revision),
    Failed(RevisionFailure),
}

/// The upload half of the pipeline.
///
/// Holds the session-wide `dont_send_multipart` latch and the single-slot
/// upload queue.
pub struct Uploader {
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn LocalStore>,
    session: String,
    queue: UploadQueue,
    dont_send_multipart: bool,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn LocalStore>,
        session: String,
    ) -> Self {
        Self {
            transport,
            store,
            session,
            queue: UploadQueue::new(),
            dont_send_multipart: false,
        }
    }

    /// True while a multipart upload holds the queue slot.
    pub fn is_uploading(&self) -> bool {
        self.queue.is_uploading()
    }

    /// Ask the remote which revisions of the batch it lacks.
    pub async fn negotiate(&self, batch: &RevisionList) -> Result<DiffResponse> {
        let start = Instant::now();
        let response = self
            .transport
            .send_json(HttpMethod::Post, "_revs_diff", Some(diff_request_body(batch)))
            .await?;

        if !response.is_success() {
            return Err(ReplicatorError::Http {
                status: response.status,
                operation: "POST _revs_diff".to_string(),
            });
        }

        let diff: DiffResponse = serde_json::from_value(response.body)
            .map_err(|e| ReplicatorError::Protocol(format!("bad _revs_diff response: {}", e)))?;

        let missing: usize = diff.values().map(|d| d.missing.len()).sum();
        metrics::record_diff(&self.session, batch.len(), missing, start.elapsed());
        debug!(offered = batch.len(), missing, "diff negotiated");
        Ok(diff)
    }

    /// Push the revisions the remote lacks.
    ///
    /// Transport errors abort the batch (the caller retries); everything
    /// else lands in the returned outcome.
    pub async fn upload(
        &mut self,
        missing: Vec<Revision>,
        diff: &DiffResponse,
    ) -> Result<UploadOutcome> {
        let mut outcome = UploadOutcome::default();
        let mut bulk: Vec<Revision> = Vec::new();

        for rev in missing {
            let options = LoadOptions {
                attachments: true,
                revision_history: true,
                big_attachments_follow: !self.dont_send_multipart,
            };
            let mut loaded = match self.store.load_revision_body(&rev, options).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, error = %e,
                        "failed to load revision body, skipping this pass");
                    metrics::record_revision_failed(&self.session, "load_body");
                    outcome.failed.push(RevisionFailure {
                        revision: rev,
                        status: None,
                    });
                    continue;
                }
            };

            if let Some(entry) = diff.get(&loaded.doc_id) {
                let generation = find_common_ancestor(&loaded, &entry.possible_ancestors);
                if generation > 0 {
                    debug!(doc_id = %loaded.doc_id, generation, "stubbing ancestor attachments");
                    stub_attachments_before(&mut loaded, generation);
                }
            }

            if loaded.has_following_attachments() {
                if self.dont_send_multipart {
                    // Multipart was disabled mid-batch; bodies must inline.
                    match self.inline_following_attachments(&mut loaded).await {
                        Ok(()) => bulk.push(loaded),
                        Err(e) => {
                            warn!(doc_id = %loaded.doc_id, error = %e,
                                "failed to inline attachments, skipping this pass");
                            metrics::record_revision_failed(&self.session, "load_attachment");
                            outcome.failed.push(RevisionFailure {
                                revision: loaded,
                                status: None,
                            });
                        }
                    }
                } else {
                    match self.upload_multipart(loaded).await? {
                        MultipartResult::Delivered(rev) => outcome.delivered.push(rev),
                        MultipartResult::Failed(failure) => outcome.failed.push(failure),
                    }
                }
            } else {
                bulk.push(loaded);
            }
        }

        if !bulk.is_empty() {
            self.upload_bulk(bulk, &mut outcome).await?;
        }

        Ok(outcome)
    }

    /// `POST /_bulk_docs` with `new_edits=false`.
    async fn upload_bulk(&self, revs: Vec<Revision>, outcome: &mut UploadOutcome) -> Result<()> {
        let docs: Vec<Value> = revs
            .iter()
            .map(|r| Value::Object(r.properties.clone()))
            .collect();
        let count = docs.len();
        let body = json!({ "docs": docs, "new_edits": false });

        let start = Instant::now();
        let response = self
            .transport
            .send_json(HttpMethod::Post, "_bulk_docs", Some(body))
            .await?;

        if !response.is_success() {
            return Err(ReplicatorError::Http {
                status: response.status,
                operation: "POST _bulk_docs".to_string(),
            });
        }

        // With new_edits=false the server reports only failures; an empty
        // array means everything was accepted.
        let items = response.body.as_array().cloned().unwrap_or_default();
        let mut failures: HashMap<String, u16> = HashMap::new();
        for item in &items {
            if let Some(status) = status_from_bulk_item(item) {
                if let Some(id) = item.get("id").and_then(Value::as_str) {
                    failures.insert(id.to_string(), status);
                }
            }
        }

        metrics::record_bulk_upload(&self.session, count, failures.len(), start.elapsed());
        if !failures.is_empty() {
            info!(failures = failures.len(), total = count, "bulk upload had per-document rejections");
        }

        for rev in revs {
            match failures.get(&rev.doc_id).copied() {
                Some(status) => {
                    warn!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, status,
                        "remote rejected revision");
                    metrics::record_revision_failed(&self.session, "bulk_docs");
                    outcome.failed.push(RevisionFailure {
                        revision: rev,
                        status: Some(status),
                    });
                }
                None => outcome.delivered.push(rev),
            }
        }
        Ok(())
    }

    /// Upload one revision as a multipart/related PUT through the queue.
    async fn upload_multipart(&mut self, rev: Revision) -> Result<MultipartResult> {
        let parts = match self.collect_parts(&rev).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(doc_id = %rev.doc_id, error = %e, "failed to read attachment data");
                metrics::record_revision_failed(&self.session, "load_attachment");
                return Ok(MultipartResult::Failed(RevisionFailure {
                    revision: rev,
                    status: None,
                }));
            }
        };

        let body = build_related(&rev, &parts);
        let path = format!("{}?new_edits=false", escape_doc_id(&rev.doc_id));

        let start = Instant::now();
        let permit = self.queue.acquire().await;
        let response = self
            .transport
            .send_multipart(&path, &body.content_type, body.bytes)
            .await?;
        drop(permit);

        if response.is_success() {
            metrics::record_multipart_upload(&self.session, true, start.elapsed());
            debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "multipart upload complete");
            return Ok(MultipartResult::Delivered(rev));
        }

        metrics::record_multipart_upload(&self.session, false, start.elapsed());

        if response.status == 415 {
            // The server doesn't speak multipart. Remember that for the
            // rest of the session and re-send this revision inline.
            info!(doc_id = %rev.doc_id, "remote rejected multipart, falling back to inline JSON");
            self.dont_send_multipart = true;
            metrics::record_multipart_disabled(&self.session);
            return self.upload_inline(rev, parts).await;
        }

        warn!(doc_id = %rev.doc_id, status = response.status, "multipart upload rejected");
        Ok(MultipartResult::Failed(RevisionFailure {
            revision: rev,
            status: Some(response.status),
        }))
    }

    /// Re-issue a revision as a JSON PUT with base64-inlined attachments.
    async fn upload_inline(
        &self,
        mut rev: Revision,
        parts: Vec<AttachmentPart>,
    ) -> Result<MultipartResult> {
        let data_by_name: HashMap<String, Vec<u8>> =
            parts.into_iter().map(|p| (p.name, p.data)).collect();

        if let Some(attachments) = rev.attachments_mut() {
            for (name, entry) in attachments.iter_mut() {
                let Some(entry) = entry.as_object_mut() else {
                    continue;
                };
                if entry.remove("follows").is_some() {
                    if let Some(data) = data_by_name.get(name) {
                        entry.insert("data".to_string(), Value::String(BASE64.encode(data)));
                    }
                }
            }
        }

        let path = format!("{}?new_edits=false", escape_doc_id(&rev.doc_id));
        let response = self
            .transport
            .send_json(HttpMethod::Put, &path, Some(Value::Object(rev.properties.clone())))
            .await?;

        if response.is_success() {
            debug!(doc_id = %rev.doc_id, "inline fallback upload complete");
            Ok(MultipartResult::Delivered(rev))
        } else {
            warn!(doc_id = %rev.doc_id, status = response.status, "inline fallback rejected");
            Ok(MultipartResult::Failed(RevisionFailure {
                status: Some(response.status),
                revision: rev,
            }))
        }
    }

    /// Collect MIME parts for every `"follows"` attachment, in the map's
    /// canonical key order.
    async fn collect_parts(&self, rev: &Revision) -> Result<Vec<AttachmentPart>> {
        let mut parts = Vec::new();
        let Some(attachments) = rev.attachments() else {
            return Ok(parts);
        };
        for (name, entry) in attachments {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            if !entry.get("follows").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let data = self.store.attachment_data(&rev.doc_id, name, entry).await?;
            parts.push(AttachmentPart {
                name: name.clone(),
                content_type: entry
                    .get("content_type")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                encoding: entry
                    .get("encoding")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                data,
            });
        }
        Ok(parts)
    }

    /// Replace `"follows"` markers with base64 bodies, for revisions that
    /// must go through `_bulk_docs` after multipart was disabled.
    async fn inline_following_attachments(&self, rev: &mut Revision) -> Result<()> {
        let parts = self.collect_parts(rev).await?;
        let data_by_name: HashMap<String, Vec<u8>> =
            parts.into_iter().map(|p| (p.name, p.data)).collect();

        if let Some(attachments) = rev.attachments_mut() {
            for (name, entry) in attachments.iter_mut() {
                let Some(entry) = entry.as_object_mut() else {
                    continue;
                };
                if entry.remove("follows").is_some() {
                    if let Some(data) = data_by_name.get(name) {
                        entry.insert("data".to_string(), Value::String(BASE64.encode(data)));
                    }
                }
            }
        }
        Ok(())
    }
}
