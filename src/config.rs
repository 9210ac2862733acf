//! Configuration for the push replicator.
//!
//! This module defines all settings needed to run a replication.
//! Configuration is passed to [`Replicator::new()`](crate::Replicator::new)
//! and can be constructed programmatically, deserialized from JSON, or
//! parsed from a CouchDB-style replication document via
//! [`ReplicationDocument`].
//!
//! # Quick Start
//!
//! ```rust
//! use push_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig {
//!     remote_url: "https://sync.example.com/db".into(),
//!     continuous: false,
//!     create_target: true,
//!     ..Default::default()
//! };
//! ```
//!
//! # Replication Documents
//!
//! ```json
//! {
//!   "source": "localdb",
//!   "target": "https://sync.example.com/db",
//!   "create_target": true,
//!   "continuous": true,
//!   "filter": "app/important",
//!   "query_params": { "minPriority": 2 },
//!   "auth": { "basic": { "username": "u", "password": "p" } }
//! }
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to Replicator::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level settings object for one push replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Base URL of the remote database (e.g. `https://host:5984/db`).
    pub remote_url: String,

    /// Keep running after the initial scan, pushing live changes.
    #[serde(default)]
    pub continuous: bool,

    /// Issue `PUT /` to create the target database before replicating.
    /// A 412 ("already exists") response is treated as success.
    #[serde(default)]
    pub create_target: bool,

    /// Name of a filter to resolve against the local store.
    /// Replication fails before the first batch if the name is set but
    /// cannot be compiled.
    #[serde(default)]
    pub filter: Option<String>,

    /// Parameters passed to the filter on every evaluation.
    #[serde(default)]
    pub query_params: Map<String, Value>,

    /// Restrict replication to these document IDs (empty = all).
    #[serde(default)]
    pub doc_ids: Vec<String>,

    /// Extra headers attached to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Authentication credentials for the remote.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Inbox batching settings.
    #[serde(default)]
    pub inbox: InboxConfig,

    /// Retry settings for transport failures. One-shot replications give up
    /// after `max_attempts`; continuous replications override this with
    /// unbounded retries.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Per-request timeout as a duration string (e.g. "30s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            continuous: false,
            create_target: false,
            filter: None,
            query_params: Map::new(),
            doc_ids: Vec::new(),
            headers: HashMap::new(),
            auth: None,
            inbox: InboxConfig::default(),
            retry: RetrySettings::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ReplicatorConfig {
    /// Minimal config for testing against a given remote.
    pub fn for_testing(remote_url: &str) -> Self {
        Self {
            remote_url: remote_url.to_string(),
            inbox: InboxConfig::testing(),
            retry: RetrySettings::testing(),
            ..Default::default()
        }
    }

    /// Validate settings that cannot be checked by the type system.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.remote_url.is_empty() {
            return Err(crate::error::ReplicatorError::Config(
                "remote_url is empty".to_string(),
            ));
        }
        if !has_url_scheme(&self.remote_url) {
            return Err(crate::error::ReplicatorError::Config(format!(
                "remote_url has no scheme: {}",
                self.remote_url
            )));
        }
        Ok(())
    }

    /// Parse the request timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Effective retry policy: continuous replications never give up.
    pub fn retry_config(&self) -> RetryConfig {
        let mut cfg = self.retry.to_retry_config();
        if self.continuous {
            cfg.max_attempts = usize::MAX;
        }
        cfg
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InboxConfig: batcher settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Inbox batcher settings.
///
/// Revisions from the change feed coalesce until the batch reaches
/// `capacity` or `flush_delay` elapses, amortizing the `_revs_diff`
/// round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Maximum revisions per batch before a forced flush.
    #[serde(default = "default_inbox_capacity")]
    pub capacity: usize,

    /// Flush timer as a duration string (e.g. "500ms").
    #[serde(default = "default_flush_delay")]
    pub flush_delay: String,
}

fn default_inbox_capacity() -> usize {
    100
}

fn default_flush_delay() -> String {
    "500ms".to_string()
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            flush_delay: "500ms".to_string(),
        }
    }
}

impl InboxConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            capacity: 10,
            flush_delay: "5ms".to_string(),
        }
    }

    /// Parse the flush delay string to a Duration.
    pub fn flush_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_delay).unwrap_or(Duration::from_millis(500))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: serde-friendly retry shape
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializable retry settings, converted to
/// [`RetryConfig`](crate::resilience::RetryConfig) at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts before a one-shot replication gives up.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: usize,

    /// Delay before the first retry (duration string).
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    /// Ceiling for exponential backoff (duration string).
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

fn default_retry_attempts() -> usize {
    10
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: "1s".to_string(),
            max_delay: "5m".to_string(),
        }
    }
}

impl RetrySettings {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
        }
    }

    /// Convert to the runtime retry policy.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: humantime::parse_duration(&self.initial_delay)
                .unwrap_or(Duration::from_secs(1)),
            max_delay: humantime::parse_duration(&self.max_delay)
                .unwrap_or(Duration::from_secs(300)),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AuthConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication credentials for the remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    /// HTTP Basic authentication.
    Basic { username: String, password: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationDocument: the fixed document surface
// ═══════════════════════════════════════════════════════════════════════════════

/// A replication document as stored in a `_replicator`-style database.
///
/// Recognized fields: `source`, `target`, `create_target`, `continuous`,
/// `filter`, `query_params`, `doc_ids`, `headers`, `auth`. Reserved
/// (underscore-prefixed) fields other than `_id`/`_rev` are rejected with
/// status 403; a local-to-local replication is rejected with 404 unless
/// `create_target` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationDocument {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub create_target: bool,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub query_params: Map<String, Value>,
    #[serde(default)]
    pub doc_ids: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<Value>,
}

/// Rejection of a replication document, carrying the HTTP status the
/// manager reports back.
#[derive(Debug, Error)]
#[error("replication document rejected ({status}): {reason}")]
pub struct DocumentError {
    pub status: u16,
    pub reason: String,
}

impl DocumentError {
    fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            status: 403,
            reason: reason.into(),
        }
    }

    fn not_found(reason: impl Into<String>) -> Self {
        Self {
            status: 404,
            reason: reason.into(),
        }
    }
}

fn has_url_scheme(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// What a replication document asks the manager to do for the push side.
///
/// The HTTP push core only reaches remote targets; a local target name is
/// handed back to the manager, which owns local database creation and
/// local-to-local replication.
#[derive(Debug, Clone)]
pub enum PushPlan {
    /// Push over HTTP to the remote target.
    Remote(ReplicatorConfig),
    /// `create_target` named a local database: the manager must create it
    /// and replicate locally, outside this crate.
    CreateLocal { target: String },
}

impl ReplicationDocument {
    /// Parse a raw JSON document, enforcing the reserved-field rule.
    pub fn parse(raw: &Value) -> Result<Self, DocumentError> {
        let obj = raw.as_object().ok_or_else(|| DocumentError {
            status: 400,
            reason: "replication document is not an object".to_string(),
        })?;

        for key in obj.keys() {
            if key.starts_with('_') && key != "_id" && key != "_rev" {
                return Err(DocumentError::forbidden(format!(
                    "reserved field: {}",
                    key
                )));
            }
        }

        serde_json::from_value(raw.clone()).map_err(|e| DocumentError {
            status: 400,
            reason: e.to_string(),
        })
    }

    /// Convert into a push plan.
    ///
    /// The push core requires `target` to be a URL; a bare local name on
    /// both sides is a local-to-local replication, rejected with 404 unless
    /// `create_target` asks for the database, in which case the plan names
    /// the local target for the manager to create and drive.
    pub fn into_push_plan(self) -> Result<PushPlan, DocumentError> {
        if !has_url_scheme(&self.target) {
            if !self.create_target {
                return Err(DocumentError::not_found(format!(
                    "local target database: {}",
                    self.target
                )));
            }
            return Ok(PushPlan::CreateLocal {
                target: self.target,
            });
        }

        let auth = match self.auth {
            None => None,
            Some(value) => Some(parse_auth(&value)?),
        };

        Ok(PushPlan::Remote(ReplicatorConfig {
            remote_url: self.target,
            continuous: self.continuous,
            create_target: self.create_target,
            filter: self.filter,
            query_params: self.query_params,
            doc_ids: self.doc_ids,
            headers: self.headers,
            auth,
            ..Default::default()
        }))
    }
}

fn parse_auth(value: &Value) -> Result<AuthConfig, DocumentError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DocumentError::forbidden("auth is not an object"))?;

    if let Some(basic) = obj.get("basic") {
        let username = basic
            .get("username")
            .and_then(Value::as_str)
            .ok_or_else(|| DocumentError::forbidden("basic auth missing username"))?;
        let password = basic
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| DocumentError::forbidden("basic auth missing password"))?;
        return Ok(AuthConfig::Basic {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    // OAuth1 signing is not supported by this client; refuse rather than
    // silently replicating unauthenticated.
    Err(DocumentError::forbidden("unsupported auth scheme"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
