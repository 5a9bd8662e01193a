use std::{
    io::{Cursor, Read, Write},
    path::PathBuf,
    str::FromStr,
};

use concatz::{DecodeOptions, Format};
use tempfile::NamedTempFile;

use crate::{
    args::{ByteValue, CompressArgs},
    compress::Compressor,
    decompress::Decompressor,
};

const INPUT: &[u8] = br#"
    Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt
    ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation
    ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute irure dolor in
    reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur
    sint occaecat cupidatat non proident, sunt in culpa qui officia deserunt mollit anim id
    est laborum.
"#;

fn compress_args(format: Format) -> CompressArgs {
    CompressArgs {
        format,
        compression_level: None,
        member_size: ByteValue::from_str("128B").unwrap(),
        no_checksum: false,
        input_file: PathBuf::new(),
        output_file: None,
    }
}

#[test]
fn cycle() {
    for format in [Format::Zlib, Format::Gzip, Format::Zstd] {
        let mut encoded = Vec::new();
        let out = Compressor::new(&compress_args(format), &mut encoded)
            .compress_reader(&mut Cursor::new(INPUT), None)
            .unwrap();
        assert_eq!(out.read, INPUT.len() as u64);
        assert_eq!(out.written, encoded.len() as u64);
        assert_eq!(out.members.num_members(), INPUT.len().div_ceil(128));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&encoded).unwrap();

        for parallelism in [1, 3] {
            let opts = DecodeOptions::new()
                .parallelism(parallelism)
                .batch_members(2);
            let mut decompressor = Decompressor::with_opts(file.path(), opts).unwrap();
            let mut restored = Vec::new();
            let written = decompressor.decompress_into(&mut restored, None).unwrap();

            assert_eq!(written, INPUT.len() as u64);
            assert_eq!(restored, INPUT);
            assert_eq!(decompressor.stats().members, INPUT.len().div_ceil(128));
            assert_eq!(decompressor.stats().compressed_bytes, encoded.len() as u64);
        }
    }
}

#[test]
fn read_in_small_pieces() {
    let mut encoded = Vec::new();
    let mut compressor = Compressor::new(&compress_args(Format::Gzip), &mut encoded);
    compressor.write_all(INPUT).unwrap();
    compressor.finish().unwrap();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&encoded).unwrap();

    let mut decompressor = Decompressor::with_opts(file.path(), DecodeOptions::new()).unwrap();
    let mut restored = Vec::new();
    let mut piece = [0u8; 7];
    loop {
        let n = decompressor.read(&mut piece).unwrap();
        if n == 0 {
            break;
        }
        restored.extend_from_slice(&piece[..n]);
    }

    assert_eq!(restored, INPUT);
}

#[test]
fn corrupt_input_fails() {
    let mut encoded = Vec::new();
    let mut compressor = Compressor::new(&compress_args(Format::Zlib), &mut encoded);
    compressor.write_all(INPUT).unwrap();
    compressor.finish().unwrap();
    // Flip a bit in the Adler-32 trailer of the last member
    let last = encoded.len() - 1;
    encoded[last] ^= 0x01;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&encoded).unwrap();

    let mut decompressor = Decompressor::with_opts(file.path(), DecodeOptions::new()).unwrap();
    assert!(decompressor.decompress_into(&mut Vec::new(), None).is_err());
}
