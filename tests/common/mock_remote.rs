//! In-memory CouchDB-style remote for integration tests.
//!
//! Implements enough of the wire protocol for push replication:
//! `PUT /`, `POST /_revs_diff`, `POST /_bulk_docs`, single-document PUTs
//! (JSON and multipart/related), and `_local` checkpoint documents.
//!
//! Failure injection:
//! - [`fail_next_requests`](MockRemote::fail_next_requests): transport-level
//!   errors for the next N requests
//! - [`reject_multipart`](MockRemote::reject_multipart): answer multipart
//!   PUTs with 415
//! - [`reject_doc`](MockRemote::reject_doc): per-document `_bulk_docs`
//!   rejections with a CouchDB error string, N times

use push_replicator::error::{ReplicatorError, Result};
use push_replicator::remote::{HttpMethod, RemoteResponse, RemoteTransport};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    db_exists: bool,
    /// doc_id -> rev_id -> stored body
    docs: HashMap<String, HashMap<String, Value>>,
    /// _local doc id -> (rev, body)
    locals: HashMap<String, (String, Value)>,
    local_rev_counter: u64,
}

/// Counters for protocol-level assertions.
#[derive(Default)]
pub struct Counters {
    pub create_target: AtomicUsize,
    pub revs_diff: AtomicUsize,
    pub bulk_docs: AtomicUsize,
    pub multipart_puts: AtomicUsize,
    pub inline_puts: AtomicUsize,
    pub checkpoint_puts: AtomicUsize,
}

pub struct MockRemote {
    url: String,
    state: Mutex<State>,
    reject_multipart: AtomicBool,
    fail_next: AtomicUsize,
    /// doc_id -> (error string, remaining rejections)
    bulk_rejections: Mutex<HashMap<String, (String, usize)>>,
    pub counters: Counters,
}

impl MockRemote {
    /// A remote whose database already exists.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            state: Mutex::new(State {
                db_exists: true,
                ..State::default()
            }),
            reject_multipart: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            bulk_rejections: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// A remote without a database (for create-target tests).
    pub fn without_database(url: &str) -> Self {
        let remote = Self::new(url);
        remote.state.lock().unwrap().db_exists = false;
        remote
    }

    pub fn reject_multipart(&self) {
        self.reject_multipart.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_requests(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject a document in `_bulk_docs` with `error` for the next `times`
    /// offers.
    pub fn reject_doc(&self, doc_id: &str, error: &str, times: usize) {
        self.bulk_rejections
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), (error.to_string(), times));
    }

    /// Pre-populate the remote with a document revision.
    pub fn seed_doc(&self, doc_id: &str, rev_id: &str, body: Value) {
        self.state
            .lock()
            .unwrap()
            .docs
            .entry(doc_id.to_string())
            .or_default()
            .insert(rev_id.to_string(), body);
    }

    pub fn has_doc(&self, doc_id: &str, rev_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .docs
            .get(doc_id)
            .is_some_and(|revs| revs.contains_key(rev_id))
    }

    pub fn doc(&self, doc_id: &str, rev_id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .docs
            .get(doc_id)
            .and_then(|revs| revs.get(rev_id))
            .cloned()
    }

    pub fn db_exists(&self) -> bool {
        self.state.lock().unwrap().db_exists
    }

    /// The stored checkpoint value for a session, if any.
    pub fn checkpoint_value(&self, session_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .locals
            .get(session_id)
            .and_then(|(_, body)| body.get("lastSequence").and_then(Value::as_str).map(str::to_string))
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store_doc(&self, body: &Value) {
        let (Some(id), Some(rev)) = (
            body.get("_id").and_then(Value::as_str),
            body.get("_rev").and_then(Value::as_str),
        ) else {
            return;
        };
        self.state
            .lock()
            .unwrap()
            .docs
            .entry(id.to_string())
            .or_default()
            .insert(rev.to_string(), body.clone());
    }

    fn handle_revs_diff(&self, body: &Value) -> RemoteResponse {
        self.counters.revs_diff.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let mut result = Map::new();

        if let Some(request) = body.as_object() {
            for (doc_id, revs) in request {
                let have = state.docs.get(doc_id);
                let missing: Vec<Value> = revs
                    .as_array()
                    .map(|revs| {
                        revs.iter()
                            .filter(|rev| {
                                rev.as_str().is_some_and(|r| {
                                    !have.is_some_and(|stored| stored.contains_key(r))
                                })
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();

                if !missing.is_empty() {
                    let mut entry = Map::new();
                    entry.insert("missing".to_string(), Value::Array(missing));
                    if let Some(stored) = have {
                        let mut ancestors: Vec<String> = stored.keys().cloned().collect();
                        ancestors.sort();
                        entry.insert(
                            "possible_ancestors".to_string(),
                            Value::Array(ancestors.into_iter().map(Value::String).collect()),
                        );
                    }
                    result.insert(doc_id.clone(), Value::Object(entry));
                }
            }
        }

        RemoteResponse {
            status: 200,
            body: Value::Object(result),
        }
    }

    fn handle_bulk_docs(&self, body: &Value) -> RemoteResponse {
        self.counters.bulk_docs.fetch_add(1, Ordering::SeqCst);

        if body.get("new_edits").and_then(Value::as_bool) != Some(false) {
            return RemoteResponse {
                status: 400,
                body: json!({"error": "bad_request", "reason": "expected new_edits=false"}),
            };
        }

        let mut errors = Vec::new();
        if let Some(docs) = body.get("docs").and_then(Value::as_array) {
            for doc in docs {
                let id = doc.get("_id").and_then(Value::as_str).unwrap_or_default();

                let rejection = {
                    let mut rejections = self.bulk_rejections.lock().unwrap();
                    match rejections.get_mut(id) {
                        Some((error, remaining)) if *remaining > 0 => {
                            *remaining -= 1;
                            Some(error.clone())
                        }
                        _ => None,
                    }
                };

                match rejection {
                    Some(error) => errors.push(json!({
                        "id": id,
                        "rev": doc.get("_rev").cloned().unwrap_or(Value::Null),
                        "error": error,
                        "reason": "rejected by test configuration",
                    })),
                    None => self.store_doc(doc),
                }
            }
        }

        RemoteResponse {
            status: 201,
            body: Value::Array(errors),
        }
    }

    fn handle_local_get(&self, id: &str) -> RemoteResponse {
        let state = self.state.lock().unwrap();
        match state.locals.get(id) {
            Some((rev, body)) => {
                let mut body = body.clone();
                body["_rev"] = Value::String(rev.clone());
                body["_id"] = Value::String(format!("_local/{}", id));
                RemoteResponse { status: 200, body }
            }
            None => RemoteResponse {
                status: 404,
                body: json!({"error": "not_found", "reason": "missing"}),
            },
        }
    }

    fn handle_local_put(&self, id: &str, body: &Value) -> RemoteResponse {
        self.counters.checkpoint_puts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if let Some((stored_rev, _)) = state.locals.get(id) {
            let given = body.get("_rev").and_then(Value::as_str).unwrap_or_default();
            if given != stored_rev {
                return RemoteResponse {
                    status: 409,
                    body: json!({"error": "conflict", "reason": "document update conflict"}),
                };
            }
        }

        state.local_rev_counter += 1;
        let new_rev = format!("0-{}", state.local_rev_counter);
        let mut stored = body.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.remove("_rev");
        }
        state.locals.insert(id.to_string(), (new_rev.clone(), stored));

        RemoteResponse {
            status: 201,
            body: json!({"ok": true, "id": format!("_local/{}", id), "rev": new_rev}),
        }
    }
}

#[async_trait::async_trait]
impl RemoteTransport for MockRemote {
    async fn send_json(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<RemoteResponse> {
        if self.take_failure() {
            return Err(ReplicatorError::transport_msg(path, "injected network failure"));
        }

        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let body = body.unwrap_or(Value::Null);

        let response = match (method, path) {
            (HttpMethod::Put, "") => {
                self.counters.create_target.fetch_add(1, Ordering::SeqCst);
                let mut state = self.state.lock().unwrap();
                if state.db_exists {
                    RemoteResponse {
                        status: 412,
                        body: json!({"error": "file_exists", "reason": "database already exists"}),
                    }
                } else {
                    state.db_exists = true;
                    RemoteResponse {
                        status: 201,
                        body: json!({"ok": true}),
                    }
                }
            }
            (HttpMethod::Post, "_revs_diff") => self.handle_revs_diff(&body),
            (HttpMethod::Post, "_bulk_docs") => self.handle_bulk_docs(&body),
            (HttpMethod::Get, local) if local.starts_with("_local/") => {
                self.handle_local_get(&local["_local/".len()..])
            }
            (HttpMethod::Put, local) if local.starts_with("_local/") => {
                self.handle_local_put(&local["_local/".len()..], &body)
            }
            (HttpMethod::Put, _doc_id) => {
                // Single-document JSON PUT (inline fallback path)
                self.counters.inline_puts.fetch_add(1, Ordering::SeqCst);
                if !query.contains("new_edits=false") {
                    return Ok(RemoteResponse {
                        status: 400,
                        body: json!({"error": "bad_request", "reason": "expected new_edits=false"}),
                    });
                }
                self.store_doc(&body);
                RemoteResponse {
                    status: 201,
                    body: json!({"ok": true}),
                }
            }
            _ => RemoteResponse {
                status: 404,
                body: json!({"error": "not_found"}),
            },
        };
        Ok(response)
    }

    async fn send_multipart(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<RemoteResponse> {
        if self.take_failure() {
            return Err(ReplicatorError::transport_msg(path, "injected network failure"));
        }

        self.counters.multipart_puts.fetch_add(1, Ordering::SeqCst);

        if self.reject_multipart.load(Ordering::SeqCst) {
            return Ok(RemoteResponse {
                status: 415,
                body: json!({"error": "unsupported_media_type"}),
            });
        }

        if !content_type.starts_with("multipart/related") {
            return Ok(RemoteResponse {
                status: 415,
                body: json!({"error": "unsupported_media_type"}),
            });
        }

        // The JSON document is the first MIME part.
        let text = String::from_utf8_lossy(&body);
        let json_part = text
            .split_once("\r\n\r\n")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split_once("\r\n--").map(|(json, _)| json));

        match json_part.and_then(|part| serde_json::from_str::<Value>(part).ok()) {
            Some(doc) => {
                self.store_doc(&doc);
                Ok(RemoteResponse {
                    status: 201,
                    body: json!({"ok": true}),
                })
            }
            None => Ok(RemoteResponse {
                status: 400,
                body: json!({"error": "bad_request", "reason": "no JSON part"}),
            }),
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}
