//! Revision model for the push replicator.
//!
//! A [`Revision`] is an immutable snapshot of a document identified by
//! `(doc_id, rev_id)` plus the monotonic local sequence assigned by the
//! store. Revision IDs have the form `<generation>-<suffix>`, e.g. `2-b`.
//!
//! # Ancestor Discovery
//!
//! When a revision carries attachments, the remote's `possible_ancestors`
//! list lets us avoid re-uploading attachment bodies it already has.
//! [`find_common_ancestor`] walks the revision's `_revisions` history from
//! newest to oldest and returns the generation of the first entry the remote
//! knows, which bounds the `revpos` below which attachments can be stubbed.

use serde_json::{Map, Value};
use std::fmt;

/// A parsed revision ID: `<generation>-<suffix>`.
///
/// Generation 0 with an empty suffix represents a malformed ID; such IDs
/// never match anything during ancestor discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    pub generation: u64,
    pub suffix: String,
}

impl RevId {
    /// Parse a revision ID string.
    ///
    /// Accepts `<digits>-<suffix>`; anything else parses as generation 0.
    pub fn parse(s: &str) -> Self {
        if let Some((gen_part, suffix)) = s.split_once('-') {
            if let Ok(generation) = gen_part.parse::<u64>() {
                if generation > 0 && !suffix.is_empty() {
                    return Self {
                        generation,
                        suffix: suffix.to_string(),
                    };
                }
            }
        }
        Self {
            generation: 0,
            suffix: String::new(),
        }
    }

    /// Whether this ID parsed into a usable `<generation>-<suffix>` form.
    pub fn is_valid(&self) -> bool {
        self.generation > 0
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

/// An immutable document revision read from the local store.
#[derive(Debug, Clone)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID string (`<generation>-<suffix>`).
    pub rev_id: String,
    /// Monotonic local sequence assigned when the revision was stored.
    pub sequence: u64,
    /// Deletion tombstone flag.
    pub deleted: bool,
    /// Document properties. May include `_attachments`, `_revisions`,
    /// `_deleted`. `_id` and `_rev` are kept consistent with the fields
    /// above. Empty until the body is loaded for upload.
    pub properties: Map<String, Value>,
}

impl Revision {
    /// Create a revision with an empty body (as produced by a change scan).
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            sequence,
            deleted: false,
            properties: Map::new(),
        }
    }

    /// Mark this revision as a deletion tombstone.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Generation number of the revision ID.
    pub fn generation(&self) -> u64 {
        RevId::parse(&self.rev_id).generation
    }

    /// The `_attachments` map, if the loaded body carries one.
    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.properties.get("_attachments").and_then(Value::as_object)
    }

    /// Mutable access to the `_attachments` map.
    pub fn attachments_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.properties
            .get_mut("_attachments")
            .and_then(Value::as_object_mut)
    }

    /// The `_revisions` history `{start, ids}` as parsed fields.
    ///
    /// Returns `None` when the body has not been loaded with history or the
    /// map is malformed.
    pub fn history(&self) -> Option<RevisionHistory> {
        let revs = self.properties.get("_revisions")?.as_object()?;
        let start = revs.get("start")?.as_u64()?;
        let ids = revs
            .get("ids")?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Some(RevisionHistory { start, ids })
    }

    /// Expanded history as full revision IDs, newest first.
    ///
    /// `{start: 2, ids: ["second", "first"]}` expands to
    /// `["2-second", "1-first"]`.
    pub fn history_ids(&self) -> Vec<String> {
        match self.history() {
            Some(h) => h.expand(),
            None => Vec::new(),
        }
    }

    /// True when any attachment entry is flagged `"follows": true`,
    /// i.e. its body travels as a MIME part rather than inline.
    pub fn has_following_attachments(&self) -> bool {
        self.attachments().is_some_and(|atts| {
            atts.values().any(|a| {
                a.get("follows").and_then(Value::as_bool).unwrap_or(false)
            })
        })
    }
}

/// The `_revisions` history of a revision: generation `start` down to
/// `start - ids.len() + 1`, suffixes newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Expand into full revision IDs, newest first.
    pub fn expand(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, suffix)| {
                let generation = self.start.checked_sub(i as u64)?;
                (generation > 0).then(|| format!("{}-{}", generation, suffix))
            })
            .collect()
    }
}

/// Find the latest common ancestor between a revision's history and a set of
/// candidate revision IDs reported by the remote.
///
/// Returns the generation of the first (newest) history entry that appears
/// in `candidates`, or 0 when there is no overlap or the revision carries no
/// history. Attachments whose `revpos` is at or below the returned
/// generation already exist at the remote and can be stubbed.
pub fn find_common_ancestor(rev: &Revision, candidates: &[String]) -> u64 {
    if candidates.is_empty() {
        return 0;
    }
    for history_id in rev.history_ids() {
        if candidates.iter().any(|c| c == &history_id) {
            return RevId::parse(&history_id).generation;
        }
    }
    0
}

/// An ordered batch of revisions with `(doc_id, rev_id)` set semantics.
#[derive(Debug, Clone, Default)]
pub struct RevisionList {
    revs: Vec<Revision>,
}

impl RevisionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a revision unless an identical `(doc_id, rev_id)` pair is
    /// already present.
    pub fn push(&mut self, rev: Revision) {
        if !self.contains(&rev.doc_id, &rev.rev_id) {
            self.revs.push(rev);
        }
    }

    pub fn contains(&self, doc_id: &str, rev_id: &str) -> bool {
        self.revs
            .iter()
            .any(|r| r.doc_id == doc_id && r.rev_id == rev_id)
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.revs.iter()
    }

    /// Highest sequence in the list, or `None` when empty.
    pub fn max_sequence(&self) -> Option<u64> {
        self.revs.iter().map(|r| r.sequence).max()
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revs.into_iter()
    }
}

impl FromIterator<Revision> for RevisionList {
    fn from_iter<T: IntoIterator<Item = Revision>>(iter: T) -> Self {
        let mut list = Self::new();
        for rev in iter {
            list.push(rev);
        }
        list
    }
}
