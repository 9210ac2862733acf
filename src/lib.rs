//! # Push Replicator
//!
//! A checkpointed push replicator for CouchDB-compatible endpoints: it
//! streams new revisions out of a local document store and delivers them to
//! a remote database over HTTP, resuming exactly where it left off after an
//! interruption.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             push-replicator                              │
//! │                                                                          │
//! │  ┌────────────┐   ┌───────┐   ┌────────────┐   ┌──────────────────────┐  │
//! │  │ LocalStore │──▶│ Inbox │──▶│ _revs_diff │──▶│ _bulk_docs           │  │
//! │  │ change feed│   │ batch │   │ negotiator │   │  + multipart uploads │  │
//! │  └────────────┘   └───────┘   └────────────┘   └──────────────────────┘  │
//! │        │                            │                      │             │
//! │        ▼                            ▼                      ▼             │
//! │  ┌────────────┐          ┌──────────────────┐   ┌──────────────────┐     │
//! │  │ change     │          │ PendingSequences │──▶│ checkpoint at    │     │
//! │  │ notifier   │          │ (in-flight seqs) │   │ /_local/<session>│     │
//! │  └────────────┘          └──────────────────┘   └──────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Revisions flow through the pipeline in ascending sequence order. Uploads
//! may complete out of order, but the checkpoint only ever advances past
//! the contiguously-acknowledged prefix, so an interrupted replication
//! never loses or replays acknowledged work.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use push_replicator::{HttpTransport, Replicator, ReplicatorConfig};
//! use std::sync::Arc;
//!
//! # async fn example(store: Arc<dyn push_replicator::LocalStore>) {
//! let config = ReplicatorConfig {
//!     remote_url: "https://sync.example.com/db".into(),
//!     create_target: true,
//!     ..Default::default()
//! };
//! let transport = Arc::new(HttpTransport::from_config(&config).unwrap());
//!
//! let mut replicator = Replicator::new(store, transport, config).unwrap();
//! replicator.start().unwrap();
//! replicator.wait_until_stopped().await;
//! # }
//! ```

pub mod batcher;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod multipart;
pub mod remote;
pub mod replicator;
pub mod resilience;
pub mod revision;
pub mod store;
pub mod uploader;

// Re-exports for convenience
pub use config::{AuthConfig, PushPlan, ReplicationDocument, ReplicatorConfig};
pub use error::{ReplicatorError, Result};
pub use remote::{Authorizer, HttpTransport, RemoteTransport};
pub use replicator::{DocumentState, Replicator, ReplicatorState, ReplicatorStatus};
pub use revision::{find_common_ancestor, Revision, RevisionList};
pub use store::{LocalChange, LocalStore};
