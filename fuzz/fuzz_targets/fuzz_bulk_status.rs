//! Fuzz target for `_bulk_docs` response item classification.
//!
//! Classification must never panic on arbitrary JSON, and every item that
//! carries an error must map to a status in the 4xx/5xx range.

#![no_main]

use libfuzzer_sys::fuzz_target;
use push_replicator::uploader::status_from_bulk_item;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    // Should never panic
    match status_from_bulk_item(&value) {
        None => {
            // Success only when there is no error field (or a null one)
            let error = value.get("error");
            assert!(error.is_none() || error.is_some_and(|e| e.is_null()));
        }
        Some(status) => assert!((400..600).contains(&status)),
    }
});
