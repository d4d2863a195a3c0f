#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Must not panic; a parsed query always has at least one alternative
    if let Ok(query) = annodex::query::parse_query(data) {
        assert!(!query.alternatives.is_empty());
    }
});
