//! This crate decodes buffers that hold many independently compressed members back to back, such
//! as concatenated gzip files, BGZF blocks, chains of zlib streams or multi-frame zstd files.
//!
//! Decoding such a buffer serially produces the same bytes as decoding every member on its own
//! and concatenating the results. Concatz uses this to decode members concurrently: a boundary
//! scanner first finds where each member starts and ends without producing output, then a pool of
//! workers decodes the members, and the results are joined in their original order.
//!
//! The zlib and gzip members are inflated with [flate2], zstd frames use the bindings from the
//! [zstd_safe] crate. Members are decoded on a [rayon] thread pool.
//!
//! # Decompression
//!
//! [`decode`] decodes a complete buffer with one worker per logical CPU. The output is the same
//! for every parallelism.
//!
//! ```no_run
//! let compressed = std::fs::read("data.gz")?;
//! let data = concatz::decode(&compressed)?;
//! # Ok::<(), concatz::Error>(())
//! ```
//!
//! A streaming [`Decoder`] overlaps the boundary scan with decoding and implements
//! [`std::io::Read`].
//!
//! ```no_run
//! use std::{fs::File, io};
//! use concatz::{DecodeOptions, Decoder};
//!
//! let input = File::open("data.gz")?;
//! let opts = DecodeOptions::new().parallelism(4);
//! let mut decoder = Decoder::from_reader(input, opts)?;
//! io::copy(&mut decoder, &mut io::stdout())?;
//! # Ok::<(), concatz::Error>(())
//! ```
//!
//! # Compression
//!
//! An [`Encoder`] splits its input into members of 64KiB each. See [`EncodeOptions`] to change
//! this and other compression parameters.
//!
//! ```
//! use std::io::Write;
//! use concatz::{EncodeOptions, Format};
//!
//! let mut compressed = vec![];
//! let mut encoder = EncodeOptions::new()
//!     .format(Format::Zlib)
//!     .member_size(4)
//!     .into_encoder(&mut compressed);
//! encoder.write_all(b"hello world")?;
//! let (_, members) = encoder.finish()?;
//! assert_eq!(members.num_members(), 3);
//!
//! assert_eq!(concatz::decode(&compressed)?, b"hello world");
//! # Ok::<(), concatz::Error>(())
//! ```
//!
//! [flate2]: https://docs.rs/flate2/latest/flate2/
//! [zstd_safe]: https://docs.rs/zstd-safe/latest/zstd_safe/
//! [rayon]: https://docs.rs/rayon/latest/rayon/

pub mod codec;
mod decode;
mod deflate_walk;
mod encode;
mod error;
mod format;
pub mod member;
pub mod scan;
mod stats;

pub use codec::{MemberDecoder, decoder_for};
pub use decode::{DEFAULT_CHUNK_SIZE, DecodeOptions, Decoded, Decoder, concat_decode};
pub use encode::{EncodeOptions, Encoder, encode_member};
pub use error::{Error, Location, Result};
pub use format::{Format, GZIP_MAGIC, GZIP_TRAILER_SIZE, ZLIB_TRAILER_SIZE};
pub use member::{Member, MemberState, MemberTable};
pub use scan::ScanStrategy;
pub use stats::DecodeStats;
// Re-export as it's part of the API.
pub use zstd_safe::CompressionLevel;

/// Decodes all members of `buf` with one worker per logical CPU.
///
/// # Errors
///
/// Fails if any member is malformed, corrupt or truncated.
pub fn decode(buf: &[u8]) -> Result<Vec<u8>> {
    DecodeOptions::new().decode(buf).map(Decoded::into_inner)
}

/// Decodes all members of `buf` with `parallelism` workers.
///
/// # Errors
///
/// Fails if `parallelism` is zero or any member is malformed, corrupt or truncated.
pub fn decode_with_parallelism(buf: &[u8], parallelism: usize) -> Result<Vec<u8>> {
    DecodeOptions::new()
        .parallelism(parallelism)
        .decode(buf)
        .map(Decoded::into_inner)
}

/// Finds all members of `buf` without decoding them.
///
/// # Errors
///
/// Fails if a member header is invalid or the buffer ends inside a member.
pub fn scan(buf: &[u8]) -> Result<MemberTable> {
    scan::Scanner::new(buf, None, ScanStrategy::default()).into_table()
}
