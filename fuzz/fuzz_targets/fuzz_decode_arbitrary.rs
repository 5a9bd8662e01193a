#![no_main]

use concatz::{DecodeOptions, ScanStrategy, concat_decode};
use libfuzzer_sys::fuzz_target;

// Arbitrary input must fail cleanly, and parallel decoding must agree with the serial decoder.
fuzz_target!(|data: &[u8]| {
    let serial = concat_decode(data);
    let structural = DecodeOptions::new().parallelism(3).decode(data);
    let trial = DecodeOptions::new()
        .parallelism(2)
        .scan_strategy(ScanStrategy::Trial)
        .decode(data);

    if let Ok(expected) = &serial {
        if let Ok(decoded) = &structural {
            assert_eq!(expected, &decoded.data);
        }
        if let Ok(decoded) = &trial {
            assert_eq!(expected, &decoded.data);
        }
    }
});
