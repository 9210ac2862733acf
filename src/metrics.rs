//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change feed progress
//! - Diff negotiation results
//! - Bulk and multipart upload outcomes
//! - Checkpoint persistence
//! - Retry behavior and lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions (duration, batch size).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record revisions read from the local change feed.
pub fn record_changes_read(session: &str, count: usize) {
    counter!("replicator_changes_read_total", "session" => session.to_string())
        .increment(count as u64);
}

/// Record revisions skipped by the filter.
pub fn record_changes_filtered(session: &str, count: usize) {
    counter!("replicator_changes_filtered_total", "session" => session.to_string())
        .increment(count as u64);
}

/// Record the outcome of a `_revs_diff` round-trip.
pub fn record_diff(session: &str, offered: usize, missing: usize, duration: Duration) {
    counter!("replicator_diff_offered_total", "session" => session.to_string())
        .increment(offered as u64);
    counter!("replicator_diff_missing_total", "session" => session.to_string())
        .increment(missing as u64);
    histogram!("replicator_diff_duration_seconds", "session" => session.to_string())
        .record(duration.as_secs_f64());
}

/// Record a `_bulk_docs` upload.
pub fn record_bulk_upload(session: &str, docs: usize, failures: usize, duration: Duration) {
    counter!("replicator_bulk_docs_total", "session" => session.to_string()).increment(1);
    counter!("replicator_bulk_docs_uploaded_total", "session" => session.to_string())
        .increment(docs.saturating_sub(failures) as u64);
    if failures > 0 {
        counter!("replicator_bulk_docs_rejected_total", "session" => session.to_string())
            .increment(failures as u64);
    }
    histogram!("replicator_bulk_docs_duration_seconds", "session" => session.to_string())
        .record(duration.as_secs_f64());
}

/// Record a multipart upload attempt.
pub fn record_multipart_upload(session: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_multipart_uploads_total", "session" => session.to_string(), "status" => status)
        .increment(1);
    histogram!("replicator_multipart_duration_seconds", "session" => session.to_string())
        .record(duration.as_secs_f64());
}

/// Record the session falling back from multipart to inline JSON (415).
pub fn record_multipart_disabled(session: &str) {
    counter!("replicator_multipart_disabled_total", "session" => session.to_string()).increment(1);
}

/// Record a checkpoint save.
pub fn record_checkpoint_save(session: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_checkpoint_saves_total", "session" => session.to_string(), "status" => status)
        .increment(1);
}

/// Record the current checkpoint sequence as a gauge.
pub fn record_checkpoint_sequence(session: &str, sequence: u64) {
    gauge!("replicator_checkpoint_sequence", "session" => session.to_string())
        .set(sequence as f64);
}

/// Record a revision failure (body load or per-document rejection).
pub fn record_revision_failed(session: &str, reason: &str) {
    counter!("replicator_revisions_failed_total", "session" => session.to_string(), "reason" => reason.to_string())
        .increment(1);
}

/// Record a transport retry.
pub fn record_retry(session: &str, attempt: usize) {
    counter!("replicator_retries_total", "session" => session.to_string()).increment(1);
    gauge!("replicator_retry_attempt", "session" => session.to_string()).set(attempt as f64);
}

/// Record the lifecycle state.
pub fn set_state(state: &str) {
    gauge!("replicator_state", "state" => state.to_string()).set(1.0);
}

/// Record pending (in-flight) sequence count.
pub fn set_pending_sequences(session: &str, count: usize) {
    gauge!("replicator_pending_sequences", "session" => session.to_string()).set(count as f64);
}
