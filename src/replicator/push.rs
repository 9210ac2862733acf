//! The push driver: a single task owning all replication state.
//!
//! The driver walks the pipeline end to end:
//! 1. Resolve the filter, create the target if asked, load the checkpoint.
//! 2. Scan the change feed from the checkpoint, coalescing into the inbox.
//! 3. For each batch: track sequences as pending, negotiate `_revs_diff`,
//!    upload what the remote lacks, acknowledge what it has.
//! 4. Advance and persist the checkpoint as the lowest pending sequence
//!    clears.
//! 5. One-shot: save a final checkpoint and stop once drained.
//!    Continuous: park on the change-notification stream.
//!
//! # Graceful Shutdown
//!
//! Commands arrive over an mpsc channel and are polled at batch boundaries
//! and inside every wait (`tokio::select!`). `Stop` unwinds the pipeline
//! via an internal `Shutdown` error, after which the latest reachable
//! checkpoint is persisted best-effort.
//!
//! # Retry
//!
//! Transport failures back off exponentially in the `Retrying` state.
//! One-shot replications give up after the configured attempts and surface
//! the error; continuous ones retry forever.

use super::types::{ReplicatorState, ReplicatorStatus};
use super::Command;
use crate::batcher::Inbox;
use crate::checkpoint::{CheckpointStore, PendingSequences};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::remote::{HttpMethod, RemoteTransport};
use crate::resilience::RetryConfig;
use crate::revision::Revision;
use crate::store::{ChangesOptions, LocalChange, LocalStore, ReplicationFilter};
use crate::uploader::{partition_by_diff, UploadOutcome, Uploader};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// What a wait or park decided.
enum Flow {
    /// Keep going where we were.
    Continue,
    /// Re-request changes from the current checkpoint.
    Rescan,
    /// Stop the replication.
    Stop,
}

pub(crate) struct PushDriver {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn RemoteTransport>,
    config: ReplicatorConfig,
    session_id: String,

    filter: Option<ReplicationFilter>,
    checkpoint: CheckpointStore,
    pending: PendingSequences,
    inbox: Inbox,
    uploader: Uploader,
    retry_config: RetryConfig,

    /// Best checkpoint value reached so far (may be ahead of what's saved).
    checkpoint_candidate: Option<u64>,
    /// Sequence to resume change scans from.
    resume_seq: u64,
    /// Revisions that failed once, keyed by `(doc_id, rev_id)`. A second
    /// authoritative refusal (401/403/409) re-classifies the revision as
    /// delivered; a second failure of any other kind parks it for a later
    /// session.
    failed_once: HashMap<(String, String), u16>,
    /// Revisions queued for the retry pass.
    retry_queue: Vec<Revision>,

    state_tx: watch::Sender<ReplicatorState>,
    status_tx: watch::Sender<ReplicatorStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl PushDriver {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn RemoteTransport>,
        config: ReplicatorConfig,
        session_id: String,
        state_tx: watch::Sender<ReplicatorState>,
        status_tx: watch::Sender<ReplicatorStatus>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let checkpoint = CheckpointStore::new(Arc::clone(&transport), session_id.clone());
        let uploader = Uploader::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            session_id.clone(),
        );
        let inbox = Inbox::new(&config.inbox);
        let retry_config = config.retry_config();

        Self {
            store,
            transport,
            config,
            session_id,
            filter: None,
            checkpoint,
            pending: PendingSequences::new(),
            inbox,
            uploader,
            retry_config,
            checkpoint_candidate: None,
            resume_seq: 0,
            failed_once: HashMap::new(),
            retry_queue: Vec::new(),
            state_tx,
            status_tx,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let span = info_span!("push", session = %&self.session_id[..10.min(self.session_id.len())]);
        async move {
            self.set_state(ReplicatorState::Starting);

            match self.replicate().await {
                Ok(()) => {}
                Err(ReplicatorError::Shutdown) => {
                    info!("replication stopped by request");
                }
                Err(e) => self.record_error(e),
            }

            // Persist the latest reachable checkpoint before going quiet.
            self.save_checkpoint().await;

            let failed = self.status_tx.borrow().error.is_some();
            if failed {
                self.set_state(ReplicatorState::Error);
            }
            self.set_state(ReplicatorState::Stopped);
            info!("push replication finished");
        }
        .instrument(span)
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Main flow
    // ─────────────────────────────────────────────────────────────────────────

    async fn replicate(&mut self) -> Result<()> {
        if let Some(name) = self.config.filter.clone() {
            self.filter = Some(self.store.compile_filter(&name)?);
            debug!(filter = %name, "filter compiled");
        }

        if self.config.create_target {
            self.create_target().await?;
        }

        self.load_checkpoint().await?;

        let mut notifications = self
            .config
            .continuous
            .then(|| self.store.subscribe_changes());

        loop {
            self.set_state(ReplicatorState::Running);
            self.scan_and_drain().await?;
            self.run_retry_pass().await?;
            self.save_checkpoint().await;
            // Idle requires the inbox drained and the upload slot free.
            debug_assert!(self.inbox.is_empty());
            debug_assert!(!self.uploader.is_uploading());
            self.set_state(ReplicatorState::Idle);

            let Some(notifications) = notifications.as_mut() else {
                // One-shot: drained means done.
                return Ok(());
            };

            match self.wait_for_changes(notifications).await? {
                Flow::Rescan => continue,
                Flow::Stop => return Ok(()),
                Flow::Continue => continue,
            }
        }
    }

    /// Scan the change feed from the resume point and drain the inbox.
    async fn scan_and_drain(&mut self) -> Result<()> {
        let since = self.resume_seq;
        let options = ChangesOptions {
            include_conflicts: true,
        };
        let changes = self
            .store
            .changes_since(since, options, self.filter.as_ref(), &self.config.query_params)
            .await?;

        metrics::record_changes_read(&self.session_id, changes.len());
        debug!(since, count = changes.len(), "change scan");

        for rev in changes {
            if !self.wants_doc(&rev.doc_id) {
                continue;
            }
            self.enqueue(rev);
            if self.inbox.should_flush() {
                self.process_inbox().await?;
                self.check_commands().await?;
            }
        }

        // The scan is exhausted: force out any partial batch.
        while !self.inbox.is_empty() {
            self.process_inbox().await?;
        }
        Ok(())
    }

    /// Flush one inbox batch through diff and upload.
    async fn process_inbox(&mut self) -> Result<()> {
        // Revisions awaiting a retry ride along with the next batch.
        for rev in std::mem::take(&mut self.retry_queue) {
            self.inbox.add(rev);
        }
        if self.inbox.is_empty() {
            return Ok(());
        }

        let batch = self.inbox.flush();
        // Diffing is a commitment: every sequence in the batch is in
        // flight from here until acknowledged.
        for rev in batch.iter() {
            self.pending.add(rev.sequence);
        }
        metrics::set_pending_sequences(&self.session_id, self.pending.len());

        let mut attempt = 0;
        let diff = loop {
            match self.uploader.negotiate(&batch).await {
                Ok(diff) => break diff,
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if !self.retry_config.should_retry(attempt) {
                        return Err(e);
                    }
                    self.backoff(attempt).await?;
                }
                Err(e) => return Err(e),
            }
        };
        self.set_state(ReplicatorState::Running);

        let (present, missing) = partition_by_diff(batch, &diff);
        for rev in present {
            trace!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "already on remote");
            self.ack(rev.sequence);
        }

        if !missing.is_empty() {
            let mut attempt = 0;
            let outcome = loop {
                match self.uploader.upload(missing.clone(), &diff).await {
                    Ok(outcome) => break outcome,
                    Err(e) if e.is_retryable() => {
                        attempt += 1;
                        if !self.retry_config.should_retry(attempt) {
                            return Err(e);
                        }
                        self.backoff(attempt).await?;
                    }
                    Err(e) => return Err(e),
                }
            };
            self.set_state(ReplicatorState::Running);
            self.apply_outcome(outcome);
        }

        self.save_checkpoint().await;
        Ok(())
    }

    /// Re-offer failed revisions until the queue drains.
    ///
    /// Bounded: a revision is queued at most once, and a second failure
    /// either re-classifies it (auth/conflict) or parks it.
    async fn run_retry_pass(&mut self) -> Result<()> {
        while !self.retry_queue.is_empty() {
            info!(count = self.retry_queue.len(), "retrying failed revisions");
            self.process_inbox().await?;
        }
        Ok(())
    }

    /// Park in `Idle`, processing notifications until a rescan or stop.
    async fn wait_for_changes(
        &mut self,
        notifications: &mut mpsc::UnboundedReceiver<LocalChange>,
    ) -> Result<Flow> {
        loop {
            let flush_due = self.inbox.time_until_flush();
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Stop) => return Ok(Flow::Stop),
                    Some(Command::GoOffline) => {
                        match self.park_offline().await? {
                            Flow::Stop => return Ok(Flow::Stop),
                            _ => return Ok(Flow::Rescan),
                        }
                    }
                    Some(Command::Retry) => return Ok(Flow::Rescan),
                    Some(Command::GoOnline) => {}
                },

                maybe = notifications.recv() => match maybe {
                    Some(change) => {
                        self.accept_notification(change);
                        if self.inbox.should_flush() {
                            self.set_state(ReplicatorState::Running);
                            self.process_inbox().await?;
                            self.run_retry_pass().await?;
                            self.set_state(ReplicatorState::Idle);
                        }
                    }
                    // The store dropped its side; nothing more will come.
                    None => return Ok(Flow::Stop),
                },

                _ = tokio::time::sleep(flush_due.unwrap_or_default()), if flush_due.is_some() => {
                    if self.inbox.should_flush() {
                        self.set_state(ReplicatorState::Running);
                        self.process_inbox().await?;
                        self.run_retry_pass().await?;
                        self.set_state(ReplicatorState::Idle);
                    }
                }
            }
        }
    }

    /// Screen a change notification into the inbox.
    ///
    /// A revision that came from this replication's remote is skipped
    /// before the filter is consulted, breaking pull/push cycles.
    fn accept_notification(&mut self, change: LocalChange) {
        if let Some(source) = &change.source {
            if source.trim_end_matches('/') == self.config.remote_url.trim_end_matches('/') {
                trace!(doc_id = %change.revision.doc_id, "skipping revision from our own remote");
                return;
            }
        }

        let rev = change.revision;
        if !self.wants_doc(&rev.doc_id) {
            return;
        }
        if rev.sequence <= self.resume_seq {
            return;
        }
        if let Some(filter) = &self.filter {
            if !filter(&rev, &self.config.query_params) {
                metrics::record_changes_filtered(&self.session_id, 1);
                return;
            }
        }
        self.enqueue(rev);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Startup steps
    // ─────────────────────────────────────────────────────────────────────────

    /// `PUT /` on the remote; "already exists" counts as success.
    async fn create_target(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = self
                .transport
                .send_json(HttpMethod::Put, "", None)
                .await
                .and_then(|response| {
                    if response.is_success()
                        || response.status == 412
                        || matches!(
                            response.error_name(),
                            Some("file_exists") | Some("duplicate")
                        )
                    {
                        Ok(())
                    } else {
                        Err(ReplicatorError::Http {
                            status: response.status,
                            operation: "PUT /".to_string(),
                        })
                    }
                });

            match result {
                Ok(()) => {
                    info!("target database ready");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if !self.retry_config.should_retry(attempt) {
                        return Err(e);
                    }
                    self.backoff(attempt).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_checkpoint(&mut self) -> Result<()> {
        let mut attempt = 0;
        let stored = loop {
            match self.checkpoint.load().await {
                Ok(stored) => break stored,
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if !self.retry_config.should_retry(attempt) {
                        return Err(e);
                    }
                    self.backoff(attempt).await?;
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(value) = &stored {
            self.resume_seq = value.parse().unwrap_or(0);
        }
        let last = stored.clone();
        self.update_status(|s| s.last_sequence = last);
        info!(resume_seq = self.resume_seq, "checkpoint loaded");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    fn wants_doc(&self, doc_id: &str) -> bool {
        self.config.doc_ids.is_empty() || self.config.doc_ids.iter().any(|d| d == doc_id)
    }

    fn enqueue(&mut self, rev: Revision) {
        self.inbox.add(rev);
        self.update_status(|s| s.changes_total += 1);
    }

    /// Acknowledge a sequence: untrack it and advance the checkpoint
    /// candidate when the contiguous prefix grew.
    fn ack(&mut self, seq: u64) {
        if let Some(candidate) = self.pending.remove(seq) {
            let candidate = self.checkpoint_candidate.map_or(candidate, |c| c.max(candidate));
            self.checkpoint_candidate = Some(candidate);
            self.resume_seq = self.resume_seq.max(candidate);
        }
        metrics::set_pending_sequences(&self.session_id, self.pending.len());
        self.update_status(|s| s.changes_processed += 1);
    }

    fn apply_outcome(&mut self, outcome: UploadOutcome) {
        for rev in outcome.delivered {
            self.failed_once.remove(&(rev.doc_id.clone(), rev.rev_id.clone()));
            self.ack(rev.sequence);
        }

        for failure in outcome.failed {
            let key = (
                failure.revision.doc_id.clone(),
                failure.revision.rev_id.clone(),
            );
            let seen_before = self.failed_once.contains_key(&key);

            if seen_before && failure.is_auth_or_conflict() {
                // The remote said no twice; we did our job in offering it.
                warn!(
                    doc_id = %failure.revision.doc_id,
                    rev_id = %failure.revision.rev_id,
                    status = failure.status.unwrap_or(0),
                    "revision refused again, treating as delivered"
                );
                self.failed_once.remove(&key);
                self.ack(failure.revision.sequence);
            } else if seen_before {
                // Still failing for a transient-looking reason. The
                // sequence stays pending, holding the checkpoint back so a
                // later session retries it.
                warn!(
                    doc_id = %failure.revision.doc_id,
                    rev_id = %failure.revision.rev_id,
                    "revision still failing, leaving for a later session"
                );
                self.failed_once.remove(&key);
            } else {
                self.failed_once.insert(key, failure.status.unwrap_or(0));
                self.retry_queue.push(failure.revision);
            }
        }
    }

    /// Persist the checkpoint candidate when it moved.
    ///
    /// Save failures are logged, never fatal: a lost checkpoint only means
    /// re-offering work the remote's `_revs_diff` will discard cheaply.
    async fn save_checkpoint(&mut self) {
        let Some(candidate) = self.checkpoint_candidate else {
            return;
        };
        let value = candidate.to_string();
        if self.checkpoint.last_saved() == Some(value.as_str()) {
            return;
        }

        self.update_status(|s| s.saving_checkpoint = true);
        let result = self.checkpoint.save(&value).await;
        self.update_status(|s| s.saving_checkpoint = false);

        match result {
            Ok(()) => {
                metrics::record_checkpoint_save(&self.session_id, true);
                metrics::record_checkpoint_sequence(&self.session_id, candidate);
                self.update_status(|s| s.last_sequence = Some(value));
            }
            Err(e) => {
                metrics::record_checkpoint_save(&self.session_id, false);
                warn!(error = %e, "checkpoint save failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Waiting and lifecycle plumbing
    // ─────────────────────────────────────────────────────────────────────────

    /// Back off before a retry, staying responsive to commands.
    async fn backoff(&mut self, attempt: usize) -> Result<()> {
        self.set_state(ReplicatorState::Retrying);
        metrics::record_retry(&self.session_id, attempt);

        let delay = self.retry_config.delay_for_attempt(attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "transport trouble, backing off");

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            cmd = self.commands.recv() => match cmd {
                None | Some(Command::Stop) => Err(ReplicatorError::Shutdown),
                Some(Command::GoOffline) => {
                    match self.park_offline().await? {
                        Flow::Stop => Err(ReplicatorError::Shutdown),
                        _ => Ok(()),
                    }
                }
                // Retry / GoOnline cut the backoff short.
                Some(_) => Ok(()),
            },
        }
    }

    /// Drain queued commands without blocking.
    async fn check_commands(&mut self) -> Result<()> {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) => return Err(ReplicatorError::Shutdown),
                Ok(Command::GoOffline) => {
                    if let Flow::Stop = self.park_offline().await? {
                        return Err(ReplicatorError::Shutdown);
                    }
                    self.set_state(ReplicatorState::Running);
                }
                Ok(_) => {}
                Err(_) => return Ok(()),
            }
        }
    }

    /// Sit in `Offline` until told to resume or stop.
    async fn park_offline(&mut self) -> Result<Flow> {
        self.set_state(ReplicatorState::Offline);
        info!("replication suspended");
        loop {
            match self.commands.recv().await {
                None | Some(Command::Stop) => return Ok(Flow::Stop),
                Some(Command::GoOnline) => {
                    info!("replication resuming");
                    return Ok(Flow::Continue);
                }
                Some(_) => {}
            }
        }
    }

    fn set_state(&self, state: ReplicatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_state(&state.to_string());
        self.status_tx.send_modify(|s| {
            s.state = state;
            s.state_time_ms = chrono::Utc::now().timestamp_millis();
        });
    }

    fn record_error(&mut self, e: ReplicatorError) {
        let already_failed = self.status_tx.borrow().error.is_some();
        if already_failed {
            warn!(error = %e, "subsequent error discarded");
            return;
        }
        error!(error = %e, "replication failed");
        self.status_tx.send_modify(|s| s.error = Some(e.to_string()));
    }

    fn update_status(&self, update: impl FnOnce(&mut ReplicatorStatus)) {
        self.status_tx.send_modify(update);
    }
}
