//! Replicator lifecycle types.
//!
//! Defines the state machine for the push replicator lifecycle and the
//! observable status snapshot.
//!
//! # State Transitions
//!
//! ```text
//!                start()
//! Stopped ──────────────────▶ Starting
//!    ▲                            │
//!    │          (checkpoint loaded, scan begins)
//!    │                            ▼
//!    │    ┌────────────────── Running ◀──────────────┐
//!    │    │                    │    ▲                │
//!    │    │      (work drained)│    │(new changes,   │(backoff done)
//!    │    │                    ▼    │ retry())       │
//!    │  stop()               Idle ──┘            Retrying
//!    │    │                    │                     ▲
//!    │    │   (one-shot: final │      (transport     │
//!    │    │    checkpoint save)│       failure) ─────┘
//!    │    ▼                    ▼
//!    └─ Error ◀─────────── Stopped
//!       (fatal error; surfaces via `error`, then Stopped)
//!
//! goOffline() parks any non-stopped state in Offline; goOnline() resumes
//! by re-requesting changes from the current checkpoint.
//! ```
//!
//! # State Descriptions
//!
//! - **Stopped**: not running. Initial and final state.
//! - **Starting**: resolving the filter, creating the target, loading the
//!   checkpoint.
//! - **Running**: scanning changes, diffing, uploading.
//! - **Idle**: inbox, in-flight set, and upload queue all empty. One-shot
//!   replications save a final checkpoint and stop; continuous ones wait
//!   for change notifications.
//! - **Retrying**: backing off after a transport failure.
//! - **Offline**: suspended by `goOffline()`; notifications buffer.
//! - **Error**: first fatal error recorded; transitions to Stopped.

/// State of the push replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Not running.
    Stopped,
    /// Loading the checkpoint and preparing the change feed.
    Starting,
    /// Actively replicating.
    Running,
    /// Caught up; nothing in flight.
    Idle,
    /// Backing off after a transient failure.
    Retrying,
    /// Suspended via `goOffline()`.
    Offline,
    /// Fatal error recorded; about to stop.
    Error,
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicatorState::Stopped => "Stopped",
            ReplicatorState::Starting => "Starting",
            ReplicatorState::Running => "Running",
            ReplicatorState::Idle => "Idle",
            ReplicatorState::Retrying => "Retrying",
            ReplicatorState::Offline => "Offline",
            ReplicatorState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

/// Replication-document state, the coarse view a replicator manager
/// publishes: `triggered` while work may still happen, `completed` after a
/// clean one-shot finish, `error` when a fatal error was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Triggered,
    Completed,
    Error,
}

impl std::fmt::Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentState::Triggered => "triggered",
            DocumentState::Completed => "completed",
            DocumentState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Observable snapshot of a replicator.
///
/// Broadcast over a watch channel; every field is safe to read at any time.
#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    pub state: ReplicatorState,
    /// Stable checkpoint session ID (hex digest, at least 10 chars).
    pub session_id: String,
    /// Last checkpointed sequence, as the store's string representation.
    pub last_sequence: Option<String>,
    /// Revisions offered to the pipeline so far.
    pub changes_total: u64,
    /// Revisions fully resolved (delivered, already present, or
    /// re-classified).
    pub changes_processed: u64,
    /// True while a checkpoint save is in flight.
    pub saving_checkpoint: bool,
    /// First fatal error, if any. Later errors are logged and discarded.
    pub error: Option<String>,
    /// Milliseconds since epoch of the last state change.
    pub state_time_ms: i64,
}

impl ReplicatorStatus {
    pub fn new(session_id: String) -> Self {
        Self {
            state: ReplicatorState::Stopped,
            session_id,
            last_sequence: None,
            changes_total: 0,
            changes_processed: 0,
            saving_checkpoint: false,
            error: None,
            state_time_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The coarse replication-document state.
    pub fn document_state(&self) -> DocumentState {
        if self.error.is_some() {
            return DocumentState::Error;
        }
        match self.state {
            ReplicatorState::Stopped => DocumentState::Completed,
            _ => DocumentState::Triggered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ReplicatorState::Stopped.to_string(), "Stopped");
        assert_eq!(ReplicatorState::Starting.to_string(), "Starting");
        assert_eq!(ReplicatorState::Running.to_string(), "Running");
        assert_eq!(ReplicatorState::Idle.to_string(), "Idle");
        assert_eq!(ReplicatorState::Retrying.to_string(), "Retrying");
        assert_eq!(ReplicatorState::Offline.to_string(), "Offline");
        assert_eq!(ReplicatorState::Error.to_string(), "Error");
    }

    #[test]
    fn test_document_state_display() {
        assert_eq!(DocumentState::Triggered.to_string(), "triggered");
        assert_eq!(DocumentState::Completed.to_string(), "completed");
        assert_eq!(DocumentState::Error.to_string(), "error");
    }

    #[test]
    fn test_status_new() {
        let status = ReplicatorStatus::new("0123456789abcdef".to_string());
        assert_eq!(status.state, ReplicatorState::Stopped);
        assert!(status.session_id.len() >= 10);
        assert_eq!(status.changes_total, 0);
        assert!(status.error.is_none());
        assert!(status.state_time_ms > 0);
    }

    #[test]
    fn test_document_state_mapping() {
        let mut status = ReplicatorStatus::new("s".repeat(10));
        assert_eq!(status.document_state(), DocumentState::Completed);

        status.state = ReplicatorState::Running;
        assert_eq!(status.document_state(), DocumentState::Triggered);

        status.state = ReplicatorState::Idle;
        assert_eq!(status.document_state(), DocumentState::Triggered);

        status.state = ReplicatorState::Stopped;
        status.error = Some("boom".to_string());
        assert_eq!(status.document_state(), DocumentState::Error);
    }
}
