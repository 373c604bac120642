//! Fuzz target for v2 request classification.
//!
//! Arbitrary bodies must never panic, and any body that parses must produce
//! a stable fingerprint.

#![no_main]

use goblet_protocol::{parse_request, Fingerprint};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = parse_request(data) {
        let a = Fingerprint::of(&request);
        let b = Fingerprint::of(&request);
        assert_eq!(a, b);
    }
});
