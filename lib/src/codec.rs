use std::sync::Arc;

use flate2::{Crc, Decompress, FlushDecompress, Status};
use zstd_safe::{DCtx, InBuffer, OutBuffer, zstd_sys::ZSTD_ErrorCode};

use crate::{
    Format,
    error::{Error, Result},
    format::{GZIP_TRAILER_SIZE, parse_gzip_header, read_le32},
};

/// The smallest amount of spare output capacity handed to an inflate call.
const MIN_OUT_SPARE: usize = 32 * 1024;
/// Upper bound for output memory reserved from a size a member claims for itself.
pub(crate) const MAX_RESERVE: u64 = 0x400_0000;

/// Decompresses exactly one member.
///
/// Implementations must be pure: no state is shared between calls, so a single instance can be
/// used from every worker at the same time.
pub trait MemberDecoder: Send + Sync {
    /// Decodes the member at the start of `input` and appends its content to `out`.
    ///
    /// Returns the number of bytes of `input` that belong to the member. Bytes after the member
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Fails with a truncated member error if `input` ends before the member is complete, with a
    /// corrupt member error if the compressed data or its checksum is invalid, and with a
    /// malformed stream error if the header is invalid.
    fn decode_into(&self, input: &[u8], out: &mut Vec<u8>) -> Result<usize>;

    /// The format this decoder understands.
    fn format(&self) -> Format;
}

/// Returns the default [`MemberDecoder`] for `format`.
pub fn decoder_for(format: Format) -> Arc<dyn MemberDecoder> {
    match format {
        Format::Zlib => Arc::new(ZlibMember),
        Format::Gzip => Arc::new(GzipMember),
        Format::Zstd => Arc::new(ZstdMember),
    }
}

/// Decodes zlib members with flate2, which verifies the Adler-32 trailer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibMember;

impl MemberDecoder for ZlibMember {
    fn decode_into(&self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        crate::format::parse_zlib_header(input)?.ok_or_else(Error::truncated)?;
        let mut inflater = Decompress::new(true);
        inflate(&mut inflater, input, out)
    }

    fn format(&self) -> Format {
        Format::Zlib
    }
}

/// Decodes gzip members, checking CRC-32 and ISIZE of the trailer.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipMember;

impl MemberDecoder for GzipMember {
    fn decode_into(&self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let header = parse_gzip_header(input)?.ok_or_else(Error::truncated)?;
        let out_start = out.len();
        let mut inflater = Decompress::new(false);
        let body = inflate(&mut inflater, &input[header.len..], out)?;

        let trailer_start = header.len + body;
        let trailer = input
            .get(trailer_start..trailer_start + GZIP_TRAILER_SIZE)
            .ok_or_else(Error::truncated)?;

        let mut crc = Crc::new();
        crc.update(&out[out_start..]);
        if read_le32!(trailer, 0) != crc.sum() {
            return Err(Error::corrupt("gzip crc32 mismatch"));
        }
        if read_le32!(trailer, 4) != crc.amount() {
            return Err(Error::corrupt("gzip size mismatch"));
        }

        let end = trailer_start + GZIP_TRAILER_SIZE;
        if let Some(size) = header.block_size {
            if size != end {
                return Err(Error::corrupt("BGZF block size does not match the member"));
            }
        }

        Ok(end)
    }

    fn format(&self) -> Format {
        Format::Gzip
    }
}

// Runs `inflater` until the end of its stream, returning the consumed input.
fn inflate(inflater: &mut Decompress, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
    loop {
        if out.capacity() - out.len() < MIN_OUT_SPARE {
            out.reserve(MIN_OUT_SPARE.max(out.len()));
        }

        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status = inflater
            .decompress_vec(&input[consumed..], out, FlushDecompress::None)
            .map_err(|e| Error::corrupt(e.to_string()))?;

        match status {
            Status::StreamEnd => return Ok(inflater.total_in() as usize),
            Status::Ok | Status::BufError => {
                let progress =
                    inflater.total_in() as usize != consumed || inflater.total_out() != produced;
                // No progress with spare output means more input is required
                if !progress && out.len() < out.capacity() {
                    return Err(Error::truncated());
                }
            }
        }
    }
}

/// Decodes zstd frames with a streaming decompression context.
///
/// Skippable frames decode to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdMember;

impl MemberDecoder for ZstdMember {
    fn decode_into(&self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let frame_size = zstd_safe::find_frame_compressed_size(input).map_err(zstd_error)?;
        let frame = &input[..frame_size];

        if let Ok(Some(size)) = zstd_safe::get_frame_content_size(frame) {
            out.reserve(usize::try_from(size.min(MAX_RESERVE)).unwrap_or(0));
        }

        let mut dctx = DCtx::try_create()
            .ok_or_else(|| Error::worker_failure("failed to create decompression context"))?;
        let mut buf = vec![0u8; DCtx::out_size()];
        let mut in_buffer = InBuffer::around(frame);

        loop {
            let mut out_buffer = OutBuffer::around(&mut buf[..]);
            let hint = dctx
                .decompress_stream(&mut out_buffer, &mut in_buffer)
                .map_err(zstd_error)?;
            let n = out_buffer.pos();
            out.extend_from_slice(&buf[..n]);

            if hint == 0 {
                return Ok(in_buffer.pos());
            }
            if in_buffer.pos() == frame.len() && n < buf.len() {
                return Err(Error::truncated());
            }
        }
    }

    fn format(&self) -> Format {
        Format::Zstd
    }
}

/// Classifies a zstd error code.
pub(crate) fn zstd_error(code: usize) -> Error {
    let name = zstd_safe::get_error_name(code);
    match 0_usize.wrapping_sub(code) {
        c if c == ZSTD_ErrorCode::ZSTD_error_srcSize_wrong as usize => Error::truncated(),
        c if c == ZSTD_ErrorCode::ZSTD_error_prefix_unknown as usize
            || c == ZSTD_ErrorCode::ZSTD_error_frameParameter_unsupported as usize =>
        {
            Error::malformed(name)
        }
        _ => Error::corrupt(name),
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

    const INPUT: &[u8] = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod \
        tempor incididunt ut labore et dolore magna aliqua. Lorem ipsum dolor sit amet.";

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

    fn check_decoder(decoder: &dyn MemberDecoder, member: &[u8]) {
        let mut out = vec![];
        let n = decoder.decode_into(member, &mut out).unwrap();
        assert_eq!(n, member.len());
        assert_eq!(out, INPUT);

        // Input after the member is left alone
        let mut padded = member.to_vec();
        padded.extend_from_slice(member);
        let mut out = b"prefix".to_vec();
        let n = decoder.decode_into(&padded, &mut out).unwrap();
        assert_eq!(n, member.len());
        assert_eq!(&out[..6], b"prefix");
        assert_eq!(&out[6..], INPUT);

        // Every truncation is detected
        for len in [1, member.len() / 2, member.len() - 1] {
            let err = decoder.decode_into(&member[..len], &mut vec![]).unwrap_err();
            assert!(err.is_truncated_member(), "{len}: {err}");
        }
    }

    #[test]
    fn zlib_member() {
        check_decoder(&ZlibMember, &zlib(INPUT));
    }

    #[test]
    fn gzip_member() {
        check_decoder(&GzipMember, &gzip(INPUT));
    }

    #[test]
    fn zstd_member() {
        check_decoder(&ZstdMember, &zstd(INPUT));
    }

    #[test]
    fn zlib_checksum_mismatch() {
        let mut member = zlib(INPUT);
        let last = member.len() - 1;
        member[last] ^= 0xff;

        let err = ZlibMember.decode_into(&member, &mut vec![]).unwrap_err();
        assert!(err.is_corrupt_member(), "{err}");
    }

    #[test]
    fn gzip_checksum_and_size_mismatch() {
        let member = gzip(INPUT);
        for pos in [member.len() - 8, member.len() - 1] {
            let mut corrupted = member.clone();
            corrupted[pos] ^= 0x01;

            let err = GzipMember.decode_into(&corrupted, &mut vec![]).unwrap_err();
            assert!(err.is_corrupt_member(), "{err}");
        }
    }

    #[test]
    fn zstd_claimed_content_size_is_not_trusted() {
        // Single segment frame claiming 1TiB of content, holding one raw byte
        let mut frame = vec![0x28, 0xb5, 0x2f, 0xfd, 0xe0];
        frame.extend_from_slice(&(1u64 << 40).to_le_bytes());
        frame.extend_from_slice(&[0x09, 0x00, 0x00, b'x']);

        let mut out = vec![];
        let err = ZstdMember.decode_into(&frame, &mut out).unwrap_err();
        assert!(err.is_corrupt_member(), "{err}");
        assert!(out.capacity() < 1 << 30);
    }

    #[test]
    fn malformed_headers() {
        let err = ZlibMember.decode_into(&[0x78, 0x00, 0x00], &mut vec![]).unwrap_err();
        assert!(err.is_malformed_stream());

        let err = GzipMember.decode_into(&[0x1f, 0x8c, 8, 0], &mut vec![]).unwrap_err();
        assert!(err.is_malformed_stream());

        let err = ZstdMember.decode_into(&[1, 2, 3, 4, 5, 6, 7, 8], &mut vec![]).unwrap_err();
        assert!(err.is_malformed_stream(), "{err}");
    }

    #[test]
    fn decoder_for_format() {
        for format in [Format::Zlib, Format::Gzip, Format::Zstd] {
            assert_eq!(decoder_for(format).format(), format);
        }
    }
}
