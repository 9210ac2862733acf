// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP transport to the remote endpoint.
//!
//! The replicator talks to the remote through the [`RemoteTransport`]
//! trait, so tests can substitute an in-memory CouchDB simulation for the
//! real network. The production implementation, [`HttpTransport`], wraps a
//! `reqwest` client with per-request authorization headers.
//!
//! # Status Handling
//!
//! Transport-level failures (DNS, TLS, resets, timeouts) surface as
//! `Err(ReplicatorError::Transport)`. An HTTP response - any status - is
//! `Ok(RemoteResponse)`: several flows legitimately consume non-success
//! statuses (412 on create-target, 404 on a fresh checkpoint, 415 on the
//! multipart probe), so interpreting the status is the caller's job.

use crate::config::{AuthConfig, ReplicatorConfig};
use crate::error::{ReplicatorError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// HTTP methods the replication protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
        }
    }
}

/// A decoded response from the remote.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    /// Parsed JSON body; `Value::Null` when the body was empty or not JSON.
    pub body: Value,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The CouchDB `error` string, when the body carries one.
    pub fn error_name(&self) -> Option<&str> {
        self.body.get("error").and_then(Value::as_str)
    }
}

/// Wire-level access to the remote database.
///
/// `path` is relative to the database root: `""` for the database itself,
/// `"_revs_diff"`, `"_local/<id>"`, or an escaped document ID with query
/// string.
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Send a JSON-bodied request.
    async fn send_json(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<RemoteResponse>;

    /// PUT a pre-assembled `multipart/related` body.
    async fn send_multipart(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<RemoteResponse>;

    /// Base URL of the remote database, without a trailing slash.
    fn url(&self) -> &str;
}

/// Escape a document ID for use as a URL path segment.
///
/// Escapes everything including `/`, so design-document IDs round-trip.
pub fn escape_doc_id(doc_id: &str) -> String {
    urlencoding::encode(doc_id).into_owned()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authorizers
// ═══════════════════════════════════════════════════════════════════════════════

/// A capability that signs outgoing requests with authentication headers.
pub trait Authorizer: Send + Sync {
    fn headers(&self) -> Vec<(String, String)>;
}

/// HTTP Basic authentication.
pub struct BasicAuthorizer {
    username: String,
    password: String,
}

impl BasicAuthorizer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authorizer for BasicAuthorizer {
    fn headers(&self) -> Vec<(String, String)> {
        let credentials = BASE64.encode(format!("{}:{}", self.username, self.password));
        vec![("Authorization".to_string(), format!("Basic {}", credentials))]
    }
}

/// Static header authentication (session cookies, proxy tokens).
pub struct HeaderAuthorizer {
    headers: Vec<(String, String)>,
}

impl HeaderAuthorizer {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}

impl Authorizer for HeaderAuthorizer {
    fn headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }
}

/// Build the authorizer configured for a replication, if any.
pub fn authorizer_from_config(auth: &Option<AuthConfig>) -> Option<Arc<dyn Authorizer>> {
    auth.as_ref().map(|a| match a {
        AuthConfig::Basic { username, password } => {
            Arc::new(BasicAuthorizer::new(username.clone(), password.clone())) as Arc<dyn Authorizer>
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HttpTransport: the reqwest-backed implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Production transport backed by a `reqwest` client.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    authorizer: Option<Arc<dyn Authorizer>>,
    extra_headers: HashMap<String, String>,
}

impl HttpTransport {
    /// Build a transport from replicator settings.
    pub fn from_config(config: &ReplicatorConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| ReplicatorError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.remote_url.trim_end_matches('/').to_string(),
            client,
            authorizer: authorizer_from_config(&config.auth),
            extra_headers: config.headers.clone(),
        })
    }

    fn full_url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.extra_headers {
            req = req.header(name, value);
        }
        if let Some(authorizer) = &self.authorizer {
            for (name, value) in authorizer.headers() {
                req = req.header(name, value);
            }
        }
        req
    }

    async fn dispatch(
        &self,
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<RemoteResponse> {
        let response = self
            .apply_headers(req)
            .send()
            .await
            .map_err(|e| ReplicatorError::transport(operation, e))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ReplicatorError::transport(operation, e))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        trace!(operation, status, "remote response");
        Ok(RemoteResponse { status, body })
    }
}

#[async_trait::async_trait]
impl RemoteTransport for HttpTransport {
    async fn send_json(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<RemoteResponse> {
        let url = self.full_url(path);
        debug!(method = method.as_str(), %url, "sending request");

        let mut req = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Post => self.client.post(&url),
        };
        if let Some(body) = body {
            req = req.json(&body);
        }

        self.dispatch(&format!("{} {}", method.as_str(), path), req)
            .await
    }

    async fn send_multipart(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<RemoteResponse> {
        let url = self.full_url(path);
        debug!(%url, len = body.len(), "sending multipart request");

        let req = self
            .client
            .put(&url)
            .header("Content-Type", content_type)
            .body(body);

        self.dispatch(&format!("PUT {}", path), req).await
    }

    fn url(&self) -> &str {
        &self.base_url
    }
}
