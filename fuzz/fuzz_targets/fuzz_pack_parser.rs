//! Fuzz target for pack parsing: arbitrary bytes must never panic the
//! parser or the delta applier.

#![no_main]

use goblet_mirror::pack::{apply_delta, PackParser};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = PackParser::new(data);
    let _ = parser.parse_with(|_| None);

    if data.len() > 2 {
        let split = data.len() / 2;
        let _ = apply_delta(&data[..split], &data[split..]);
    }
});
