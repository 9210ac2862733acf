//! Fuzz target for `_revs_diff` response decoding.
//!
//! Arbitrary bytes must either fail to decode or produce a well-formed
//! diff map that partitions any batch without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use push_replicator::revision::{Revision, RevisionList};
use push_replicator::uploader::{partition_by_diff, DiffResponse};

fuzz_target!(|data: &[u8]| {
    let Ok(diff) = serde_json::from_slice::<DiffResponse>(data) else {
        return;
    };

    // Partitioning against the decoded diff must never panic, and every
    // revision lands in exactly one side.
    let mut batch = RevisionList::new();
    for (i, doc_id) in diff.keys().take(8).enumerate() {
        for (j, rev_id) in diff[doc_id].missing.iter().take(4).enumerate() {
            batch.push(Revision::new(doc_id.clone(), rev_id.clone(), (i * 4 + j + 1) as u64));
        }
    }
    let total = batch.len();

    let (present, missing) = partition_by_diff(batch, &diff);
    assert_eq!(present.len() + missing.len(), total);
});
