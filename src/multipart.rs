// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multipart/related request assembly.
//!
//! A revision with large attachments uploads as one `multipart/related`
//! request: the first part is the canonical JSON of the revision
//! properties, and each subsequent part is the body of one attachment whose
//! entry is flagged `"follows": true`.
//!
//! # Part Ordering
//!
//! The server pairs MIME parts to `_attachments` entries *positionally*, in
//! the key order of the JSON encoding. `serde_json` maps are BTree-ordered,
//! so iterating the attachment map yields exactly the canonical
//! (lexicographic) order the encoded JSON will carry; the caller must
//! collect parts in that same iteration order.
//!
//! # Upload Queue
//!
//! Multipart bodies hold attachment bytes in memory, so uploads are
//! serialized through a single-slot gate: at most one multipart request is
//! in flight per replicator.

use crate::resilience::Bulkhead;
use crate::revision::Revision;
use sha2::{Digest, Sha256};
use tokio::sync::OwnedSemaphorePermit;

/// One attachment travelling as a MIME part.
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    pub name: String,
    pub content_type: String,
    pub encoding: Option<String>,
    pub data: Vec<u8>,
}

/// An assembled multipart/related request body.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    /// Full `Content-Type` header value, boundary included.
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Quote an attachment filename for a `Content-Disposition` header.
fn quote_filename(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Boundary for a revision's multipart body.
///
/// Derived from the revision identity so request assembly is deterministic.
fn boundary_for(rev: &Revision) -> String {
    let digest = Sha256::digest(format!("{}\u{0}{}", rev.doc_id, rev.rev_id));
    hex::encode(&digest[..16])
}

/// Assemble the multipart/related body for a revision.
///
/// `parts` must be ordered to match the canonical JSON encoding of the
/// revision's `_attachments` map (see module docs). The JSON part is
/// encoded from `rev.properties`, which must already carry the
/// `"follows": true` markers the parts correspond to.
pub fn build_related(rev: &Revision, parts: &[AttachmentPart]) -> MultipartBody {
    let boundary = boundary_for(rev);
    let json = serde_json::to_vec(&rev.properties).expect("revision properties serialize");

    let mut bytes = Vec::with_capacity(
        json.len() + parts.iter().map(|p| p.data.len() + 128).sum::<usize>() + 128,
    );

    bytes.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    bytes.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    bytes.extend_from_slice(&json);
    bytes.extend_from_slice(b"\r\n");

    for part in parts {
        bytes.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        bytes.extend_from_slice(
            format!(
                "Content-Disposition: attachment; filename={}\r\n",
                quote_filename(&part.name)
            )
            .as_bytes(),
        );
        bytes.extend_from_slice(format!("Content-Type: {}\r\n", part.content_type).as_bytes());
        if let Some(encoding) = &part.encoding {
            bytes.extend_from_slice(format!("Content-Encoding: {}\r\n", encoding).as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&part.data);
        bytes.extend_from_slice(b"\r\n");
    }

    bytes.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    MultipartBody {
        content_type: format!("multipart/related; boundary=\"{}\"", boundary),
        bytes,
    }
}

/// FIFO gate serializing multipart uploads.
///
/// Wraps a single-slot [`Bulkhead`]; the underlying semaphore queues
/// waiters in acquisition order, so uploads proceed first-in, first-out.
pub struct UploadQueue {
    gate: Bulkhead,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self {
            gate: Bulkhead::single_slot(),
        }
    }

    /// Wait for the upload slot.
    ///
    /// The returned permit releases the slot when dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed while the queue is alive.
        self.gate.acquire().await.expect("upload queue closed")
    }

    /// True while an upload holds the slot.
    pub fn is_uploading(&self) -> bool {
        self.gate.is_full()
    }
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}
