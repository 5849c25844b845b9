//! Coverage-guided harness for the newline-delimited frame codec.
//!
//! Feeds arbitrary bytes through `decode_frame`, consuming frames the way a
//! stream reader would, and re-encodes whatever decodes. A decoded frame
//! must survive a second encode/decode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use unhosted::provider::Frame;
use unhosted::provider::protocol::{decode_frame, encode_frame};

fuzz_target!(|data: &[u8]| {
    if data.len() > 256 * 1024 {
        return;
    }

    let mut rest = data;
    while let Ok(Some((frame, used))) = decode_frame::<Frame>(rest) {
        assert!(used > 0 && used <= rest.len());
        rest = &rest[used..];

        let Ok(encoded) = encode_frame(&frame) else {
            continue;
        };
        let (again, consumed) = decode_frame::<Frame>(&encoded)
            .expect("re-decode")
            .expect("complete frame");
        assert_eq!(consumed, encoded.len());
        assert_eq!(again, frame);
    }
});
