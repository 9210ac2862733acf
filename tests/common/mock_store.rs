//! In-memory `LocalStore` for integration tests.
//!
//! Documents are revision chains; the newest revision of each chain is the
//! leaf offered by the change feed. Attachments at or above
//! [`FOLLOWS_THRESHOLD`] bytes are flagged `"follows": true` when a body is
//! loaded with `big_attachments_follow`, mirroring how a real store marks
//! large attachments for multipart transfer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use push_replicator::error::{ReplicatorError, Result};
use push_replicator::revision::{RevId, Revision, RevisionList};
use push_replicator::store::{
    ChangesOptions, FilterParams, LoadOptions, LocalChange, LocalStore, ReplicationFilter,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Attachments at or above this size travel as MIME parts.
pub const FOLLOWS_THRESHOLD: usize = 1024;

struct StoredAttachment {
    name: String,
    content_type: String,
    data: Vec<u8>,
    revpos: u64,
}

struct StoredRevision {
    rev: Revision,
    body: Map<String, Value>,
    attachments: Vec<StoredAttachment>,
}

#[derive(Default)]
struct Inner {
    /// Revision chains per document, oldest first; the last entry is the leaf.
    chains: HashMap<String, Vec<StoredRevision>>,
}

type FilterFn = Arc<dyn Fn(&Revision, &FilterParams) -> bool + Send + Sync>;

/// In-memory local store with revision chains and change notifications.
pub struct MemoryStore {
    uuid: String,
    inner: Mutex<Inner>,
    seq: AtomicU64,
    filter_calls: Arc<AtomicUsize>,
    filters: Mutex<HashMap<String, FilterFn>>,
    subscribers: Mutex<Vec<UnboundedSender<LocalChange>>>,
    fail_body_loads: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_uuid("memory-store-uuid")
    }

    pub fn with_uuid(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            inner: Mutex::new(Inner::default()),
            seq: AtomicU64::new(0),
            filter_calls: Arc::new(AtomicUsize::new(0)),
            filters: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            fail_body_loads: Mutex::new(HashSet::new()),
        }
    }

    /// Store a revision at the tip of a document's chain.
    pub fn add_revision(&self, doc_id: &str, rev_id: &str, body: Value) -> Revision {
        self.add_revision_with_attachments(doc_id, rev_id, body, Vec::new())
    }

    /// Store a deletion tombstone at the tip of a document's chain.
    pub fn add_deleted_revision(&self, doc_id: &str, rev_id: &str) -> Revision {
        let sequence = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let rev = Revision::new(doc_id, rev_id, sequence).deleted();
        let stored = StoredRevision {
            rev: rev.clone(),
            body: Map::new(),
            attachments: Vec::new(),
        };
        self.inner
            .lock()
            .unwrap()
            .chains
            .entry(doc_id.to_string())
            .or_default()
            .push(stored);
        rev
    }

    /// Store a revision carrying attachments `(name, content_type, data)`.
    pub fn add_revision_with_attachments(
        &self,
        doc_id: &str,
        rev_id: &str,
        body: Value,
        attachments: Vec<(&str, &str, Vec<u8>)>,
    ) -> Revision {
        let sequence = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let rev = Revision::new(doc_id, rev_id, sequence);
        let revpos = RevId::parse(rev_id).generation;

        let stored = StoredRevision {
            rev: rev.clone(),
            body: body.as_object().cloned().unwrap_or_default(),
            attachments: attachments
                .into_iter()
                .map(|(name, content_type, data)| StoredAttachment {
                    name: name.to_string(),
                    content_type: content_type.to_string(),
                    data,
                    revpos,
                })
                .collect(),
        };

        self.inner
            .lock()
            .unwrap()
            .chains
            .entry(doc_id.to_string())
            .or_default()
            .push(stored);
        rev
    }

    /// Register a named filter.
    ///
    /// The compiled filter counts every invocation (see
    /// [`filter_calls`](Self::filter_calls)).
    pub fn register_filter<F>(&self, name: &str, f: F)
    where
        F: Fn(&Revision, &FilterParams) -> bool + Send + Sync + 'static,
    {
        self.filters
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(f));
    }

    /// How many times any compiled filter has run.
    pub fn filter_calls(&self) -> usize {
        self.filter_calls.load(Ordering::SeqCst)
    }

    /// Make body loads for a document fail (local store error injection).
    pub fn fail_body_load(&self, doc_id: &str) {
        self.fail_body_loads.lock().unwrap().insert(doc_id.to_string());
    }

    pub fn clear_body_load_failures(&self) {
        self.fail_body_loads.lock().unwrap().clear();
    }

    /// Deliver a change notification to every subscriber.
    pub fn notify(&self, revision: Revision, source: Option<&str>) {
        let change = LocalChange {
            revision,
            source: source.map(str::to_string),
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Effective attachments of a revision: everything introduced along the
    /// chain up to it, newest definition of each name winning.
    fn effective_attachments(chain: &[StoredRevision], upto: usize) -> Vec<(String, String, Vec<u8>, u64)> {
        let mut by_name: HashMap<String, (String, Vec<u8>, u64)> = HashMap::new();
        for stored in &chain[..=upto] {
            for att in &stored.attachments {
                by_name.insert(
                    att.name.clone(),
                    (att.content_type.clone(), att.data.clone(), att.revpos),
                );
            }
        }
        let mut result: Vec<_> = by_name
            .into_iter()
            .map(|(name, (ct, data, revpos))| (name, ct, data, revpos))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LocalStore for MemoryStore {
    async fn changes_since(
        &self,
        since: u64,
        _options: ChangesOptions,
        filter: Option<&ReplicationFilter>,
        params: &FilterParams,
    ) -> Result<RevisionList> {
        let inner = self.inner.lock().unwrap();
        let mut leaves: Vec<Revision> = inner
            .chains
            .values()
            .filter_map(|chain| chain.last())
            .map(|stored| stored.rev.clone())
            .filter(|rev| rev.sequence > since)
            .collect();
        leaves.sort_by_key(|rev| rev.sequence);

        let mut list = RevisionList::new();
        for rev in leaves {
            if let Some(filter) = filter {
                if !filter(&rev, params) {
                    continue;
                }
            }
            list.push(rev);
        }
        Ok(list)
    }

    async fn load_revision_body(&self, rev: &Revision, options: LoadOptions) -> Result<Revision> {
        if self.fail_body_loads.lock().unwrap().contains(&rev.doc_id) {
            return Err(ReplicatorError::LocalStore(format!(
                "injected body load failure for {}",
                rev.doc_id
            )));
        }

        let inner = self.inner.lock().unwrap();
        let chain = inner
            .chains
            .get(&rev.doc_id)
            .ok_or_else(|| ReplicatorError::LocalStore(format!("no such doc: {}", rev.doc_id)))?;
        let index = chain
            .iter()
            .position(|s| s.rev.rev_id == rev.rev_id)
            .ok_or_else(|| {
                ReplicatorError::LocalStore(format!("no such rev: {}/{}", rev.doc_id, rev.rev_id))
            })?;
        let stored = &chain[index];

        let mut loaded = rev.clone();
        loaded.properties = stored.body.clone();
        loaded
            .properties
            .insert("_id".to_string(), Value::String(rev.doc_id.clone()));
        loaded
            .properties
            .insert("_rev".to_string(), Value::String(rev.rev_id.clone()));
        if rev.deleted {
            loaded
                .properties
                .insert("_deleted".to_string(), Value::Bool(true));
        }

        if options.revision_history {
            let start = RevId::parse(&rev.rev_id).generation;
            let ids: Vec<Value> = chain[..=index]
                .iter()
                .rev()
                .map(|s| Value::String(RevId::parse(&s.rev.rev_id).suffix))
                .collect();
            loaded.properties.insert(
                "_revisions".to_string(),
                serde_json::json!({ "start": start, "ids": ids }),
            );
        }

        if options.attachments {
            let effective = Self::effective_attachments(chain, index);
            if !effective.is_empty() {
                let mut atts = Map::new();
                for (name, content_type, data, revpos) in effective {
                    let mut entry = Map::new();
                    entry.insert("content_type".to_string(), Value::String(content_type));
                    entry.insert("revpos".to_string(), Value::from(revpos));
                    entry.insert("length".to_string(), Value::from(data.len() as u64));
                    if options.big_attachments_follow && data.len() >= FOLLOWS_THRESHOLD {
                        entry.insert("follows".to_string(), Value::Bool(true));
                    } else {
                        entry.insert("data".to_string(), Value::String(BASE64.encode(&data)));
                    }
                    atts.insert(name, Value::Object(entry));
                }
                loaded
                    .properties
                    .insert("_attachments".to_string(), Value::Object(atts));
            }
        }

        Ok(loaded)
    }

    fn compile_filter(&self, name: &str) -> Result<ReplicationFilter> {
        let filters = self.filters.lock().unwrap();
        let filter = filters
            .get(name)
            .cloned()
            .ok_or_else(|| ReplicatorError::FilterUnresolved(name.to_string()))?;
        let calls = Arc::clone(&self.filter_calls);
        Ok(Arc::new(move |rev, params| {
            calls.fetch_add(1, Ordering::SeqCst);
            filter(rev, params)
        }))
    }

    async fn attachment_data(
        &self,
        doc_id: &str,
        name: &str,
        _entry: &Map<String, Value>,
    ) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let chain = inner
            .chains
            .get(doc_id)
            .ok_or_else(|| ReplicatorError::LocalStore(format!("no such doc: {}", doc_id)))?;
        for stored in chain.iter().rev() {
            if let Some(att) = stored.attachments.iter().find(|a| a.name == name) {
                return Ok(att.data.clone());
            }
        }
        Err(ReplicatorError::LocalStore(format!(
            "no such attachment: {}/{}",
            doc_id, name
        )))
    }

    fn local_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn subscribe_changes(&self) -> UnboundedReceiver<LocalChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
