//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - `MemoryStore`: an in-memory `LocalStore` with revision chains,
//!   attachments, filters, and change notifications
//! - `MockRemote`: an in-memory CouchDB-style remote with configurable
//!   failure injection

pub mod mock_remote;
pub mod mock_store;

pub use mock_remote::*;
pub use mock_store::*;

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging once; `RUST_LOG=push_replicator=trace` to see
/// the driver's view of a failing test.
#[allow(dead_code)]
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
