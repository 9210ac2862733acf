//! Fuzz target for revision ID parsing and ancestor discovery.
//!
//! Parsing must never panic on arbitrary input, and valid IDs must
//! round-trip through Display.

#![no_main]

use libfuzzer_sys::fuzz_target;
use push_replicator::revision::{find_common_ancestor, RevId, Revision};

fuzz_target!(|data: (&str, Vec<String>)| {
    let (id, candidates) = data;

    // Should never panic
    let parsed = RevId::parse(id);
    if parsed.is_valid() {
        // Valid IDs round-trip
        let rendered = parsed.to_string();
        let reparsed = RevId::parse(&rendered);
        assert_eq!(reparsed.generation, parsed.generation);
        assert_eq!(reparsed.suffix, parsed.suffix);
    } else {
        assert_eq!(parsed.generation, 0);
    }

    // Ancestor discovery on a history-less revision is always 0
    let rev = Revision::new("doc", id, 1);
    assert_eq!(find_common_ancestor(&rev, &candidates), 0);
});
