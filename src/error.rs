// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the push replicator.
//!
//! This module defines the error types used throughout the replicator.
//! Errors are categorized by their source (transport, remote status,
//! local store, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network errors, DNS failures, timeouts |
//! | `Http` | 5xx only | Non-success status from the remote endpoint |
//! | `LocalStore` | No | Local database failed to load a revision |
//! | `FilterUnresolved` | No | Named filter could not be compiled |
//! | `Protocol` | No | Malformed JSON or missing fields in a response |
//! | `Config` | No | Replication settings invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Replicator is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicatorError::is_retryable()`] to determine if an operation
//! should be retried with backoff. Retryable errors indicate transient
//! network or availability issues. Non-retryable errors indicate bugs,
//! configuration problems, or a remote that has authoritatively refused.
//!
//! Per-document failures inside a `_bulk_docs` response (401/403/409) are
//! deliberately *not* represented here: the remote accepted the request and
//! answered per document, so those are handled inline by the uploader and
//! never poison the replication as a whole.

use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Errors that can occur during push replication.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// Network-level failure talking to the remote.
    ///
    /// DNS, TLS, connection resets, timeouts. Retryable with backoff;
    /// continuous replications retry indefinitely.
    #[error("transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The remote answered with a non-success HTTP status.
    ///
    /// Server-side statuses (>= 500) are treated as transient.
    /// Client-side statuses are authoritative and not retried.
    #[error("remote returned {status} for {operation}")]
    Http { status: u16, operation: String },

    /// The local store failed to produce a revision body.
    ///
    /// The affected revision is skipped for this pass; its sequence stays
    /// pending so it is offered again on the next cycle.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// A named filter was configured but could not be compiled.
    ///
    /// Fatal before any batch is produced.
    #[error("filter not found: {0}")]
    FilterUnresolved(String),

    /// Malformed response from the remote (bad JSON, missing fields).
    ///
    /// Not retryable - the remote is speaking a different dialect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on a replicator that is already running).
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted while stopping. Requests
    /// cancelled by `stop()` surface this and it is swallowed, not reported.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicatorError {
    /// Create a transport error from a reqwest error.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without an underlying source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            Self::LocalStore(_) => false,
            Self::FilterUnresolved(_) => false,
            Self::Protocol(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
