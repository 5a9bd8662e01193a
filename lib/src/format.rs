use std::{fmt::Display, str::FromStr};

use zstd_safe::zstd_sys::{ZSTD_MAGIC_SKIPPABLE_MASK, ZSTD_MAGIC_SKIPPABLE_START, ZSTD_MAGICNUMBER};

use crate::error::{Error, Result};

// Reads 2 bytes from buf starting at offset into an u16
macro_rules! read_le16 {
    ($buf:expr, $offset:expr) => {
        ($buf[$offset] as u16) | (($buf[$offset + 1] as u16) << 8)
    };
}

// Reads 4 bytes from buf starting at offset into an u32
macro_rules! read_le32 {
    ($buf:expr, $offset:expr) => {
        ($buf[$offset] as u32)
            | (($buf[$offset + 1] as u32) << 8)
            | (($buf[$offset + 2] as u32) << 16)
            | (($buf[$offset + 3] as u32) << 24)
    };
}

pub(crate) use read_le32;

/// The size of the Adler-32 trailer of a zlib member.
pub const ZLIB_TRAILER_SIZE: usize = 4;
/// The size of the CRC-32 and ISIZE trailer of a gzip member.
pub const GZIP_TRAILER_SIZE: usize = 8;
/// The two magic bytes every gzip member starts with.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const ZLIB_HEADER_SIZE: usize = 2;
const GZIP_FIXED_HEADER_SIZE: usize = 10;
const DEFLATE_METHOD: u8 = 8;

const FTEXT: u8 = 0x01;
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = !(FTEXT | FHCRC | FEXTRA | FNAME | FCOMMENT);

/// The compressed format of the members in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// RFC 1950 streams: a deflate body between a 2 byte header and an Adler-32 trailer.
    Zlib,
    /// RFC 1952 members, optionally carrying a BGZF block size.
    Gzip,
    /// Zstandard frames, including skippable frames.
    Zstd,
}

impl Format {
    /// Detects the format from the first bytes of a member.
    ///
    /// Returns `None` if no supported header is recognized.
    pub fn detect(buf: &[u8]) -> Option<Self> {
        if is_zstd_magic(buf) {
            Some(Self::Zstd)
        } else if buf.starts_with(&GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if matches!(parse_zlib_header(buf), Ok(Some(_))) {
            Some(Self::Zlib)
        } else {
            None
        }
    }

    /// A short lowercase name of the format.
    pub fn name(self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    /// The file extension commonly used for the format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zlib => "zz",
            Self::Gzip => "gz",
            Self::Zstd => "zst",
        }
    }

    /// Whether `buf` could be the beginning of a member of this format.
    ///
    /// Only the bytes present are checked, so any prefix of a valid header passes.
    pub(crate) fn is_header_prefix(self, buf: &[u8]) -> bool {
        match self {
            Self::Zlib => buf
                .first()
                .is_none_or(|&cmf| cmf & 0x0f == DEFLATE_METHOD && cmf >> 4 <= 7),
            Self::Gzip => buf
                .iter()
                .zip([GZIP_MAGIC[0], GZIP_MAGIC[1], DEFLATE_METHOD])
                .all(|(&b, m)| b == m),
            Self::Zstd => {
                let matches = |magic: u32, first_mask: u8| {
                    buf.iter()
                        .zip(magic.to_le_bytes())
                        .enumerate()
                        .all(|(i, (&b, m))| match i {
                            0 => b & first_mask == m & first_mask,
                            _ => b == m,
                        })
                };
                matches(ZSTD_MAGICNUMBER, 0xff) || matches(ZSTD_MAGIC_SKIPPABLE_START, 0xf0)
            }
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "zlib" | "zz" => Ok(Self::Zlib),
            "gzip" | "gz" => Ok(Self::Gzip),
            "zstd" | "zst" => Ok(Self::Zstd),
            _ => Err(Error::malformed(format!("unknown format {s:?}"))),
        }
    }
}

pub(crate) fn is_zstd_magic(buf: &[u8]) -> bool {
    if buf.len() < 4 {
        return false;
    }
    let magic = read_le32!(buf, 0);

    magic == ZSTD_MAGICNUMBER
        || (magic & ZSTD_MAGIC_SKIPPABLE_MASK) == ZSTD_MAGIC_SKIPPABLE_START
}

/// Validates a zlib header and returns its length.
///
/// Returns `Ok(None)` if `buf` is too short to contain a header.
pub(crate) fn parse_zlib_header(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < ZLIB_HEADER_SIZE {
        return Ok(None);
    }

    let cmf = buf[0];
    let flg = buf[1];
    if cmf & 0x0f != DEFLATE_METHOD {
        return Err(Error::malformed("zlib compression method is not deflate"));
    }
    if cmf >> 4 > 7 {
        return Err(Error::malformed("zlib window size too large"));
    }
    if (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
        return Err(Error::malformed("zlib header check failed"));
    }
    if flg & 0x20 != 0 {
        return Err(Error::malformed("zlib preset dictionaries are not supported"));
    }

    Ok(Some(ZLIB_HEADER_SIZE))
}

/// A parsed gzip member header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GzipHeader {
    /// The length of the header, i.e. the offset of the deflate body.
    pub len: usize,
    /// The total member size taken from a BGZF `BC` extra subfield.
    pub block_size: Option<usize>,
}

/// Parses a gzip member header.
///
/// Returns `Ok(None)` if `buf` ends inside the header.
pub(crate) fn parse_gzip_header(buf: &[u8]) -> Result<Option<GzipHeader>> {
    if buf.len() < GZIP_FIXED_HEADER_SIZE {
        if !GZIP_MAGIC.starts_with(&buf[..buf.len().min(2)]) {
            return Err(Error::malformed("missing gzip magic"));
        }
        return Ok(None);
    }
    if !buf.starts_with(&GZIP_MAGIC) {
        return Err(Error::malformed("missing gzip magic"));
    }
    if buf[2] != DEFLATE_METHOD {
        return Err(Error::malformed("gzip compression method is not deflate"));
    }

    let flags = buf[3];
    if flags & FRESERVED != 0 {
        return Err(Error::malformed("reserved gzip flags are set"));
    }

    let mut pos = GZIP_FIXED_HEADER_SIZE;
    let mut block_size = None;

    if flags & FEXTRA != 0 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        let xlen = read_le16!(buf, pos) as usize;
        pos += 2;
        if buf.len() < pos + xlen {
            return Ok(None);
        }
        block_size = bgzf_block_size(&buf[pos..pos + xlen]);
        pos += xlen;
    }

    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            match buf[pos..].iter().position(|&b| b == 0) {
                Some(n) => pos += n + 1,
                None => return Ok(None),
            }
        }
    }

    if flags & FHCRC != 0 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        pos += 2;
    }

    if let Some(size) = block_size {
        if size < pos + GZIP_TRAILER_SIZE {
            return Err(Error::malformed("BGZF block size smaller than its header"));
        }
    }

    Ok(Some(GzipHeader {
        len: pos,
        block_size,
    }))
}

// Walks the extra subfields looking for the BGZF `BC` subfield.
fn bgzf_block_size(extra: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let slen = read_le16!(extra, pos + 2) as usize;
        if extra[pos] == b'B' && extra[pos + 1] == b'C' && slen == 2 && pos + 6 <= extra.len() {
            // BSIZE is the total block size minus one
            return Some(read_le16!(extra, pos + 4) as usize + 1);
        }
        pos += 4 + slen;
    }

    None
}
