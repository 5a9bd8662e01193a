#![no_main]

use concatz::{DecodeOptions, EncodeOptions, Format};
use libfuzzer_sys::fuzz_target;
use std::io::{Read, Write};

fuzz_target!(|input: (u8, u8, &[u8])| {
    let (selector, parallelism, data) = input;
    let format = match selector % 3 {
        0 => Format::Zlib,
        1 => Format::Gzip,
        _ => Format::Zstd,
    };
    let parallelism = usize::from(parallelism % 8) + 1;

    let mut compressed: Vec<u8> = Vec::new();
    {
        let mut encoder = EncodeOptions::new()
            .format(format)
            .member_size(100)
            .into_encoder(&mut compressed);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();
    }

    let opts = DecodeOptions::new().parallelism(parallelism);
    let decoded = opts.decode(&compressed).unwrap();
    assert_eq!(data, decoded.data.as_slice());

    let mut decoder = opts.batch_members(3).into_decoder(&compressed).unwrap();
    let mut streamed = Vec::new();
    decoder.read_to_end(&mut streamed).unwrap();
    assert_eq!(data, streamed.as_slice());
});
