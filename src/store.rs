// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store integration traits.
//!
//! Defines the interface the push replicator needs from the local document
//! store: a sequence-ordered change feed, revision body loading, filter
//! compilation, attachment access, and a change-notification stream for
//! continuous mode.
//!
//! The replicator only ever *reads* through this trait. Revisions are
//! created by the application writing to the store; the replicator observes
//! them and propagates them to the remote.
//!
//! This trait allows testing with in-memory stores and decouples the
//! replicator from storage internals.

use crate::error::Result;
use crate::revision::{Revision, RevisionList};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Parameters handed to a filter on every evaluation.
pub type FilterParams = Map<String, Value>;

/// A compiled replication filter: a predicate over a revision and the
/// configured query parameters.
pub type ReplicationFilter = Arc<dyn Fn(&Revision, &FilterParams) -> bool + Send + Sync>;

/// Options for a change feed scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangesOptions {
    /// Include all conflicting leaf revisions, not just the winner.
    /// The push replicator always sets this: conflicts replicate too.
    pub include_conflicts: bool,
}

/// Options for loading a revision body prior to upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Populate `_attachments` entries.
    pub attachments: bool,
    /// Populate the `_revisions` history map.
    pub revision_history: bool,
    /// Mark large attachments `"follows": true` instead of inlining their
    /// bodies, so they can travel as MIME parts. Cleared once the remote
    /// has rejected multipart for the session.
    pub big_attachments_follow: bool,
}

/// A change notification delivered while a continuous replication runs.
#[derive(Debug, Clone)]
pub struct LocalChange {
    /// The newly stored revision (body not yet loaded).
    pub revision: Revision,
    /// Where the revision came from, when it was written by a replicator:
    /// the source URL. Used to break pull/push cycles.
    pub source: Option<String>,
}

/// Interface to the local document store.
///
/// The store is read concurrently with application writes; a scan is not a
/// snapshot, and revisions stored during a scan arrive separately through
/// the notification stream.
#[async_trait::async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// All changes with sequence strictly greater than `since`, in
    /// ascending sequence order. When a filter is given the store applies
    /// it at the source so non-matching revisions never surface.
    async fn changes_since(
        &self,
        since: u64,
        options: ChangesOptions,
        filter: Option<&ReplicationFilter>,
        params: &FilterParams,
    ) -> Result<RevisionList>;

    /// Load the full body of a revision, per `options`.
    ///
    /// Returns a copy of the revision with `properties` populated.
    async fn load_revision_body(&self, rev: &Revision, options: LoadOptions) -> Result<Revision>;

    /// Resolve a named filter.
    ///
    /// A name that cannot be resolved fails the replication before any
    /// batch is produced.
    fn compile_filter(&self, name: &str) -> Result<ReplicationFilter>;

    /// Fetch the body of one attachment, identified by its document, name,
    /// and `_attachments` entry (which carries digest and revpos).
    async fn attachment_data(
        &self,
        doc_id: &str,
        name: &str,
        entry: &Map<String, Value>,
    ) -> Result<Vec<u8>>;

    /// Stable UUID of the local database, part of the checkpoint session
    /// identity.
    fn local_uuid(&self) -> String;

    /// Subscribe to change notifications for continuous mode.
    ///
    /// Each subscription gets its own channel; dropping the receiver
    /// unsubscribes.
    fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<LocalChange>;
}
