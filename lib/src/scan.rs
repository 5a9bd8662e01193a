//! Discovery of member boundaries.
//!
//! The boundary scanner walks a concatenated buffer member by member and records where each
//! member starts and ends. The structural strategy never produces decompressed output, it only
//! parses headers and block structure. The trial strategy decodes every member into a scratch
//! buffer and is mainly useful to cross check the structural one.

use std::{fmt, sync::Arc};

use tracing::trace;

use crate::{
    codec::{MemberDecoder, decoder_for, zstd_error},
    deflate_walk,
    error::{Error, Result},
    format::{
        Format, GZIP_TRAILER_SIZE, ZLIB_TRAILER_SIZE, parse_gzip_header, parse_zlib_header,
        read_le32,
    },
    member::{Member, MemberState, MemberTable},
};

/// How member boundaries are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Parse headers and block structure without producing output.
    #[default]
    Structural,
    /// Decode each member into a scratch buffer and use the consumed length.
    Trial,
}

/// The result of scanning for the end of a single member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// The member ends right before `end`, an offset into the scanned buffer.
    Complete {
        end: usize,
        decompressed_size: Option<u64>,
    },
    /// The buffer ends before the member does.
    Incomplete,
}

/// Finds the end of the member starting at `offset` in `buf`.
///
/// # Errors
///
/// Fails with a malformed stream error if the member header or its block structure is invalid.
/// A trial scan can also fail with a corrupt member error.
pub fn scan_member(
    buf: &[u8],
    offset: usize,
    format: Format,
    strategy: ScanStrategy,
) -> Result<Boundary> {
    find_boundary(buf, offset, format, strategy, None)
}

/// Like [`scan_member`], but a trial scan runs `decoder` instead of the default one.
fn find_boundary(
    buf: &[u8],
    offset: usize,
    format: Format,
    strategy: ScanStrategy,
    decoder: Option<&dyn MemberDecoder>,
) -> Result<Boundary> {
    let data = &buf[offset.min(buf.len())..];
    let boundary = match (strategy, decoder) {
        (ScanStrategy::Structural, _) => match format {
            Format::Zlib => zlib_boundary(data)?,
            Format::Gzip => gzip_boundary(data)?,
            Format::Zstd => zstd_boundary(data)?,
        },
        (ScanStrategy::Trial, Some(decoder)) => trial_boundary(data, decoder)?,
        (ScanStrategy::Trial, None) => trial_boundary(data, decoder_for(format).as_ref())?,
    };

    Ok(match boundary {
        Boundary::Complete {
            end,
            decompressed_size,
        } => Boundary::Complete {
            end: offset + end,
            decompressed_size,
        },
        Boundary::Incomplete => Boundary::Incomplete,
    })
}

fn zlib_boundary(data: &[u8]) -> Result<Boundary> {
    let Some(header_len) = parse_zlib_header(data)? else {
        return Ok(Boundary::Incomplete);
    };
    let Some(walked) = deflate_walk::walk(&data[header_len..])? else {
        return Ok(Boundary::Incomplete);
    };

    let end = header_len + walked.consumed + ZLIB_TRAILER_SIZE;
    if end > data.len() {
        return Ok(Boundary::Incomplete);
    }

    Ok(Boundary::Complete {
        end,
        decompressed_size: Some(walked.decompressed),
    })
}

fn gzip_boundary(data: &[u8]) -> Result<Boundary> {
    let Some(header) = parse_gzip_header(data)? else {
        return Ok(Boundary::Incomplete);
    };

    // BGZF members state their own size, so the body can be skipped
    if let Some(size) = header.block_size {
        if size > data.len() {
            return Ok(Boundary::Incomplete);
        }
        return Ok(Boundary::Complete {
            end: size,
            decompressed_size: Some(u64::from(read_le32!(data, size - 4))),
        });
    }

    let Some(walked) = deflate_walk::walk(&data[header.len..])? else {
        return Ok(Boundary::Incomplete);
    };

    let end = header.len + walked.consumed + GZIP_TRAILER_SIZE;
    if end > data.len() {
        return Ok(Boundary::Incomplete);
    }

    Ok(Boundary::Complete {
        end,
        decompressed_size: Some(walked.decompressed),
    })
}

fn zstd_boundary(data: &[u8]) -> Result<Boundary> {
    let end = match zstd_safe::find_frame_compressed_size(data) {
        Ok(end) => end,
        Err(code) => {
            let err = zstd_error(code);
            if err.is_truncated_member() {
                return Ok(Boundary::Incomplete);
            }
            return Err(err);
        }
    };

    Ok(Boundary::Complete {
        end,
        decompressed_size: zstd_safe::get_frame_content_size(&data[..end])
            .ok()
            .flatten(),
    })
}

fn trial_boundary(data: &[u8], decoder: &dyn MemberDecoder) -> Result<Boundary> {
    let mut scratch = Vec::new();
    match decoder.decode_into(data, &mut scratch) {
        Ok(end) => Ok(Boundary::Complete {
            end,
            decompressed_size: Some(scratch.len() as u64),
        }),
        Err(err) if err.is_truncated_member() => Ok(Boundary::Incomplete),
        Err(err) => Err(err),
    }
}

/// An iterator over the members of a concatenated buffer.
///
/// Yields members in order. The first error ends the iteration. A buffer that ends inside a
/// member yields a truncated member error, unless the remaining bytes cannot start a member at
/// all, which is a malformed stream.
///
/// ```
/// use concatz::{Format, scan::{ScanStrategy, Scanner}};
///
/// let buf: &[u8] = &[];
/// let mut scanner = Scanner::new(buf, Some(Format::Gzip), ScanStrategy::Structural);
/// assert!(scanner.next().is_none());
/// ```
#[derive(Clone)]
pub struct Scanner<'a> {
    buf: &'a [u8],
    format: Option<Format>,
    strategy: ScanStrategy,
    decoder: Option<Arc<dyn MemberDecoder>>,
    offset: usize,
    index: usize,
    failed: bool,
}

impl fmt::Debug for Scanner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("len", &self.buf.len())
            .field("format", &self.format)
            .field("strategy", &self.strategy)
            .field("custom_decoder", &self.decoder.is_some())
            .field("offset", &self.offset)
            .field("index", &self.index)
            .field("failed", &self.failed)
            .finish()
    }
}

impl<'a> Scanner<'a> {
    /// Creates a scanner over `buf`.
    ///
    /// If `format` is `None`, it is detected from the first member.
    pub fn new(buf: &'a [u8], format: Option<Format>, strategy: ScanStrategy) -> Self {
        Self {
            buf,
            format,
            strategy,
            decoder: None,
            offset: 0,
            index: 0,
            failed: false,
        }
    }

    /// Uses `decoder` for trial scans. Its format applies if no format was given.
    pub fn with_decoder(mut self, decoder: Arc<dyn MemberDecoder>) -> Self {
        self.format = self.format.or(Some(decoder.format()));
        self.decoder = Some(decoder);
        self
    }

    /// Continues a previous scan at `offset`, numbering the next member `index`.
    pub(crate) fn resume_at(mut self, offset: usize, index: usize) -> Self {
        self.offset = offset;
        self.index = index;
        self
    }

    /// The member format, once known.
    pub fn format(&self) -> Option<Format> {
        self.format
    }

    /// The offset where the next member starts.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The index the next member will get.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Scans the remaining buffer into a [`MemberTable`].
    ///
    /// # Errors
    ///
    /// Fails with the first error the scan runs into.
    pub fn into_table(self) -> Result<MemberTable> {
        let mut table = MemberTable::new();
        for member in self {
            table.push(member?);
        }

        Ok(table)
    }

    fn scan_next(&mut self) -> Result<Member> {
        let index = self.index;
        let offset = self.offset;
        let format = match self.format {
            Some(format) => format,
            None => {
                let format = Format::detect(&self.buf[offset..])
                    .ok_or_else(|| Error::malformed("unrecognized member header"))?;
                self.format = Some(format);
                format
            }
        };

        trace!(index, offset, from = ?MemberState::Pending, to = ?MemberState::Scanning);
        let decoder = self.decoder.as_deref();
        match find_boundary(self.buf, offset, format, self.strategy, decoder)? {
            Boundary::Complete {
                end,
                decompressed_size,
            } => {
                // Every member holds at least its header
                debug_assert!(end > offset);
                self.offset = end;
                self.index += 1;

                Ok(Member::new(
                    index,
                    offset as u64,
                    (end - offset) as u64,
                    decompressed_size,
                ))
            }
            Boundary::Incomplete if !format.is_header_prefix(&self.buf[offset..]) => {
                Err(Error::malformed("trailing bytes do not start a member"))
            }
            Boundary::Incomplete => Err(Error::truncated()),
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<Member>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let (index, offset) = (self.index, self.offset);
        let res = self.scan_next().map_err(|e| {
            self.failed = true;
            trace!(index, offset, from = ?MemberState::Scanning, to = ?MemberState::Failed);
            e.at_member(index, offset as u64)
        });

        Some(res)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{
        Compression,
        write::{GzEncoder, ZlibEncoder},
    };

    use super::*;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(vec![], Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(vec![], Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zstd(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(zstd_safe::compress_bound(data.len()));
        zstd_safe::compress(&mut out, data, 3).unwrap();
        out
    }

    fn members(compress: fn(&[u8]) -> Vec<u8>) -> (Vec<u8>, Vec<usize>) {
        let mut buf = vec![];
        let mut sizes = vec![];
        for part in [&b"hello "[..], b"", b"world, world, world, world", b"!"] {
            let member = compress(part);
            sizes.push(member.len());
            buf.extend_from_slice(&member);
        }
        (buf, sizes)
    }

    fn check_scan(compress: fn(&[u8]) -> Vec<u8>, format: Format) {
        let (buf, sizes) = members(compress);

        for strategy in [ScanStrategy::Structural, ScanStrategy::Trial] {
            for fmt in [None, Some(format)] {
                let table = Scanner::new(&buf, fmt, strategy).into_table().unwrap();
                assert_eq!(table.num_members(), sizes.len());
                assert_eq!(table.size_comp(), buf.len() as u64);
                assert_eq!(table.size_decomp(), Some(33));
                for (member, size) in table.members().iter().zip(&sizes) {
                    assert_eq!(member.size(), *size as u64);
                }
            }
        }
    }

    #[test]
    fn scan_zlib() {
        check_scan(zlib, Format::Zlib);
    }

    #[test]
    fn scan_gzip() {
        check_scan(gzip, Format::Gzip);
    }

    #[test]
    fn scan_zstd() {
        check_scan(zstd, Format::Zstd);
    }

    #[test]
    fn two_members_cover_the_buffer() {
        let mut buf = gzip(b"hello ");
        buf.extend_from_slice(&gzip(b"world"));

        let table = Scanner::new(&buf, None, ScanStrategy::Structural)
            .into_table()
            .unwrap();
        assert_eq!(table.num_members(), 2);
        assert_eq!(table.member_start(0).unwrap(), 0);
        assert_eq!(table.member_end(0).unwrap(), table.member_start(1).unwrap());
        assert_eq!(table.member_end(1).unwrap(), buf.len() as u64);
    }

    #[test]
    fn truncated_last_member() {
        let mut buf = zlib(b"hello ");
        let first = buf.len();
        buf.extend_from_slice(&zlib(b"world"));
        buf.pop();

        let mut scanner = Scanner::new(&buf, None, ScanStrategy::Structural);
        assert!(scanner.next().unwrap().is_ok());
        let err = scanner.next().unwrap().unwrap_err();
        assert!(err.is_truncated_member());
        assert_eq!(err.member_index(), Some(1));
        assert_eq!(err.offset(), Some(first as u64));
        assert!(scanner.next().is_none());
    }

    #[test]
    fn mixed_formats_are_malformed() {
        let mut buf = zstd(b"hello ");
        buf.extend_from_slice(&gzip(b"world"));

        let err = Scanner::new(&buf, None, ScanStrategy::Structural)
            .into_table()
            .unwrap_err();
        assert!(err.is_malformed_stream(), "{err}");
        assert_eq!(err.member_index(), Some(1));
    }

    #[test]
    fn trailing_garbage_is_malformed() {
        let mut buf = gzip(b"hello");
        buf.extend_from_slice(b"garbage");

        let err = Scanner::new(&buf, Some(Format::Gzip), ScanStrategy::Structural)
            .into_table()
            .unwrap_err();
        assert!(err.is_malformed_stream());
        assert_eq!(err.member_index(), Some(1));
    }

    #[test]
    fn short_trailing_bytes_are_malformed() {
        let cases: [(fn(&[u8]) -> Vec<u8>, &[u8]); 5] = [
            (zlib, &[0xff]),
            (zlib, b"\n"),
            (gzip, &[0x1f, 0x00]),
            (zstd, &[0x00]),
            (zstd, &[0x28, 0xb5, 0x00]),
        ];

        for (compress, tail) in cases {
            let mut buf = compress(b"hello");
            let first = buf.len();
            buf.extend_from_slice(tail);

            for strategy in [ScanStrategy::Structural, ScanStrategy::Trial] {
                let err = Scanner::new(&buf, None, strategy)
                    .into_table()
                    .unwrap_err();
                assert!(err.is_malformed_stream(), "{tail:?}: {err}");
                assert_eq!(err.member_index(), Some(1));
                assert_eq!(err.offset(), Some(first as u64));
            }
        }
    }

    #[test]
    fn short_header_prefix_is_truncated() {
        let cases: [(fn(&[u8]) -> Vec<u8>, &[u8]); 3] = [
            (zlib, &[0x78]),
            (gzip, &[0x1f, 0x8b, 8]),
            (zstd, &[0x28, 0xb5, 0x2f]),
        ];

        for (compress, tail) in cases {
            let mut buf = compress(b"hello");
            buf.extend_from_slice(tail);

            let err = Scanner::new(&buf, None, ScanStrategy::Structural)
                .into_table()
                .unwrap_err();
            assert!(err.is_truncated_member(), "{tail:?}: {err}");
            assert_eq!(err.member_index(), Some(1));
        }
    }

    #[test]
    fn trial_scan_runs_the_given_decoder() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(AtomicUsize);

        impl MemberDecoder for Counting {
            fn decode_into(&self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
                self.0.fetch_add(1, Ordering::Relaxed);
                decoder_for(Format::Gzip).decode_into(input, out)
            }

            fn format(&self) -> Format {
                Format::Gzip
            }
        }

        let (buf, sizes) = members(gzip);
        let counting = Arc::new(Counting(AtomicUsize::new(0)));

        let table = Scanner::new(&buf, None, ScanStrategy::Trial)
            .with_decoder(counting.clone())
            .into_table()
            .unwrap();
        assert_eq!(table.num_members(), sizes.len());
        assert_eq!(counting.0.load(Ordering::Relaxed), sizes.len());

        // Structural scans never decode
        Scanner::new(&buf, None, ScanStrategy::Structural)
            .with_decoder(counting.clone())
            .into_table()
            .unwrap();
        assert_eq!(counting.0.load(Ordering::Relaxed), sizes.len());
    }

    #[test]
    fn unknown_header() {
        let err = Scanner::new(b"plain text", None, ScanStrategy::Structural)
            .into_table()
            .unwrap_err();
        assert!(err.is_malformed_stream());
        assert_eq!(err.member_index(), Some(0));
    }

    #[test]
    fn bgzf_member_is_not_walked() {
        // The body is garbage, only the block size is used
        let mut member = vec![0x1f, 0x8b, 8, 0x04, 0, 0, 0, 0, 0, 255, 6, 0, b'B', b'C', 2, 0];
        let size: u16 = 18 + 4 + 8 - 1;
        member.extend_from_slice(&size.to_le_bytes());
        member.extend_from_slice(&[0xff; 4]);
        member.extend_from_slice(&[0, 0, 0, 0, 7, 0, 0, 0]);

        let boundary = scan_member(&member, 0, Format::Gzip, ScanStrategy::Structural).unwrap();
        assert_eq!(
            boundary,
            Boundary::Complete {
                end: member.len(),
                decompressed_size: Some(7)
            }
        );

        let boundary =
            scan_member(&member[..20], 0, Format::Gzip, ScanStrategy::Structural).unwrap();
        assert_eq!(boundary, Boundary::Incomplete);
    }

    #[test]
    fn resume_scan() {
        let (buf, sizes) = members(zstd);

        let mut scanner = Scanner::new(&buf, None, ScanStrategy::Structural);
        scanner.next().unwrap().unwrap();
        let (offset, index, format) = (scanner.offset(), scanner.index(), scanner.format());
        assert_eq!(offset, sizes[0]);

        let rest = Scanner::new(&buf, format, ScanStrategy::Structural)
            .resume_at(offset, index)
            .map(|m| m.unwrap().index())
            .collect::<Vec<_>>();
        assert_eq!(rest, vec![1, 2, 3]);
    }
}
