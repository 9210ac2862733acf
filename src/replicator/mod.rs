// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push replicator lifecycle.
//!
//! The main orchestrator that ties together:
//! - The local change feed via [`crate::store::LocalStore`]
//! - Inbox batching via [`crate::batcher::Inbox`]
//! - Diff negotiation and uploads via [`crate::uploader::Uploader`]
//! - Checkpoint tracking via [`crate::checkpoint`]
//!
//! # Architecture
//!
//! All mutable replication state lives inside a single driver task (see
//! [`push`]); the [`Replicator`] handle talks to it through a command
//! channel and observes it through watch channels. HTTP responses and
//! change notifications are only ever touched from the driver task, which
//! keeps the whole pipeline free of locking.

mod push;
mod types;

pub use types::{DocumentState, ReplicatorState, ReplicatorStatus};

use crate::checkpoint;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::remote::RemoteTransport;
use crate::store::LocalStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Commands delivered to the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    GoOffline,
    GoOnline,
    Retry,
}

/// Handle to a push replication.
///
/// Created stopped; [`start()`](Self::start) spawns the driver task.
/// Dropping the handle does not stop a running replication - call
/// [`stop()`](Self::stop) and [`wait_until_stopped()`](Self::wait_until_stopped)
/// for a clean shutdown.
pub struct Replicator {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn RemoteTransport>,
    config: ReplicatorConfig,
    session_id: String,

    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,
    status_rx: watch::Receiver<ReplicatorStatus>,
    status_tx: watch::Sender<ReplicatorStatus>,

    command_tx: Option<mpsc::UnboundedSender<Command>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Replicator {
    /// Create a push replicator for the given store, transport, and
    /// settings.
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn RemoteTransport>,
        config: ReplicatorConfig,
    ) -> Result<Self> {
        config.validate()?;

        let session_id = checkpoint::session_id(
            &store.local_uuid(),
            &config.remote_url,
            config.filter.as_deref(),
            &config.query_params,
            &config.doc_ids,
        );

        let (state_tx, state_rx) = watch::channel(ReplicatorState::Stopped);
        let (status_tx, status_rx) = watch::channel(ReplicatorStatus::new(session_id.clone()));

        Ok(Self {
            store,
            transport,
            config,
            session_id,
            state_tx,
            state_rx,
            status_rx,
            status_tx,
            command_tx: None,
            handle: None,
        })
    }

    /// Stable checkpoint session ID for this replication.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Whether the replicator is doing or awaiting work.
    pub fn is_running(&self) -> bool {
        !matches!(self.state(), ReplicatorState::Stopped)
    }

    /// Watch channel for state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    /// Current status snapshot.
    pub fn status(&self) -> ReplicatorStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for full status snapshots.
    pub fn status_receiver(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status_rx.clone()
    }

    /// Start replicating.
    ///
    /// Spawns the driver task, which loads the checkpoint from the remote
    /// (creating the target database first when configured) and begins the
    /// change scan.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != ReplicatorState::Stopped {
            return Err(ReplicatorError::InvalidState {
                expected: "Stopped".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            session = %self.session_id,
            remote = %self.config.remote_url,
            continuous = self.config.continuous,
            "starting push replication"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.command_tx = Some(command_tx);

        // Leave `Stopped` synchronously so a second start() cannot race the
        // driver task's own transition.
        let _ = self.state_tx.send(ReplicatorState::Starting);
        self.status_tx.send_modify(|s| {
            s.state = ReplicatorState::Starting;
            s.state_time_ms = chrono::Utc::now().timestamp_millis();
        });

        let driver = push::PushDriver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.config.clone(),
            self.session_id.clone(),
            self.state_tx.clone(),
            self.status_tx.clone(),
            command_rx,
        );

        self.handle = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    fn send(&self, command: Command) {
        if let Some(tx) = &self.command_tx {
            // A closed channel means the driver already exited; nothing to do.
            let _ = tx.send(command);
        }
    }

    /// Request a cooperative stop: in-flight work finishes best-effort, the
    /// latest reachable checkpoint is persisted, and the state becomes
    /// `Stopped`.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Suspend the replication; change notifications buffer until
    /// [`go_online()`](Self::go_online).
    pub fn go_offline(&self) {
        self.send(Command::GoOffline);
    }

    /// Resume from `Offline` by re-requesting changes from the current
    /// checkpoint.
    pub fn go_online(&self) {
        self.send(Command::GoOnline);
    }

    /// Re-enter `Running`, re-requesting changes from the current
    /// checkpoint and replaying any revisions that had failed.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    /// Wait for the driver task to exit.
    pub async fn wait_until_stopped(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.command_tx = None;
    }
}
