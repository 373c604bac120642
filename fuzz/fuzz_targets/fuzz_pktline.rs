//! Fuzz target for pkt-line decoding.
//!
//! The streaming decoder and the blocking reader must agree and never panic
//! on arbitrary input, regardless of chunk boundaries.

#![no_main]

use goblet_protocol::{PktLineDecoder, PktLineReader};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Blocking reader over the whole buffer.
    let mut reader = PktLineReader::new(Cursor::new(data.to_vec()));
    let mut reader_frames = Vec::new();
    loop {
        match reader.read() {
            Ok(Some(frame)) => reader_frames.push(frame),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    // Streaming decoder fed in 7-byte chunks must yield the same prefix of
    // frames up to the first error.
    let mut decoder = PktLineDecoder::new();
    let mut decoder_frames = Vec::new();
    let mut failed = false;
    for chunk in data.chunks(7) {
        if failed {
            break;
        }
        decoder.feed(chunk);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => decoder_frames.push(frame),
                Ok(None) => break,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
    }

    let common = reader_frames.len().min(decoder_frames.len());
    assert_eq!(&reader_frames[..common], &decoder_frames[..common]);
});
