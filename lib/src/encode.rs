use std::io::Write;

use flate2::{Compression, Crc, write::DeflateEncoder, write::ZlibEncoder};
use zstd_safe::{CCtx, CParameter, CompressionLevel};

use crate::{
    Format,
    error::{Error, Result},
    format::GZIP_MAGIC,
    member::{Member, MemberTable},
};

/// The largest member a BGZF block size can describe.
const BGZF_MAX_BLOCK_SIZE: usize = 0x1_0000;
/// Fixed gzip header plus the 6 byte `BC` extra field.
const BGZF_HEADER_SIZE: usize = 18;

/// Options that configure how data is compressed into members.
///
/// # Examples
///
/// Supports builder like chaining.
///
/// ```
/// use concatz::{EncodeOptions, Format};
///
/// let encoder = EncodeOptions::new()
///     .format(Format::Zstd)
///     .compression_level(5)
///     .member_size(8192)
///     .into_encoder(Vec::<u8>::new());
/// # Ok::<(), concatz::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    format: Format,
    level: Option<CompressionLevel>,
    member_size: usize,
    checksum_flag: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeOptions {
    /// Creates a set of options with default values.
    ///
    /// The defaults are gzip members of 64KiB uncompressed data each, compressed with the default
    /// level of the format. zstd members carry a content checksum.
    pub fn new() -> Self {
        Self {
            format: Format::Gzip,
            level: None,
            member_size: 0x1_0000,
            checksum_flag: true,
        }
    }

    /// Sets the member format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Sets the compression level.
    ///
    /// Levels of zlib and gzip members are clamped to `0..=9`.
    pub fn compression_level(mut self, level: CompressionLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Sets the amount of uncompressed data per member. A size of zero is treated as one.
    pub fn member_size(mut self, size: usize) -> Self {
        self.member_size = size.max(1);
        self
    }

    /// Whether zstd members carry a content checksum. Defaults to `true`.
    ///
    /// Without it, damaged zstd content can decode without an error.
    /// zlib and gzip members always carry their checksum.
    pub fn checksum_flag(mut self, flag: bool) -> Self {
        self.checksum_flag = flag;
        self
    }

    /// Compresses `data` into a single member.
    ///
    /// # Errors
    ///
    /// Fails if compression fails.
    pub fn encode_member(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        MemberEncoder::new(self).encode(data, &mut out)?;
        Ok(out)
    }

    /// Creates an [`Encoder`] writing to `writer`.
    pub fn into_encoder<W>(self, writer: W) -> Encoder<W> {
        Encoder::with_opts(writer, self)
    }
}

/// Compresses `data` into a single member of `format`.
///
/// # Errors
///
/// Fails if compression fails.
pub fn encode_member(format: Format, level: CompressionLevel, data: &[u8]) -> Result<Vec<u8>> {
    EncodeOptions::new()
        .format(format)
        .compression_level(level)
        .encode_member(data)
}

struct MemberEncoder {
    format: Format,
    level: CompressionLevel,
    checksum_flag: bool,
    cctx: Option<CCtx<'static>>,
}

impl MemberEncoder {
    fn new(opts: &EncodeOptions) -> Self {
        let level = opts.level.unwrap_or(match opts.format {
            Format::Zlib | Format::Gzip => 6,
            Format::Zstd => zstd_safe::CLEVEL_DEFAULT,
        });

        Self {
            format: opts.format,
            level,
            checksum_flag: opts.checksum_flag,
            cctx: None,
        }
    }

    fn deflate_level(&self) -> Compression {
        // Clamped to 0..=9 above, the cast cannot lose information
        #[allow(clippy::cast_sign_loss)]
        Compression::new(self.level.clamp(0, 9) as u32)
    }

    // Appends one complete member holding `data` to `out`.
    fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self.format {
            Format::Zlib => {
                let mut enc = ZlibEncoder::new(out, self.deflate_level());
                enc.write_all(data)?;
                enc.finish()?;
            }
            Format::Gzip => self.encode_gzip(data, out)?,
            Format::Zstd => self.encode_zstd(data, out)?,
        }

        Ok(())
    }

    fn encode_gzip(&self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut enc = DeflateEncoder::new(Vec::new(), self.deflate_level());
        enc.write_all(data)?;
        let body = enc.finish()?;

        let mut crc = Crc::new();
        crc.update(data);

        let bgzf_size = BGZF_HEADER_SIZE + body.len() + 8;
        if bgzf_size <= BGZF_MAX_BLOCK_SIZE {
            // FEXTRA with a single `BC` subfield holding the block size minus one
            out.extend_from_slice(&[GZIP_MAGIC[0], GZIP_MAGIC[1], 8, 0x04, 0, 0, 0, 0, 0, 0xff]);
            out.extend_from_slice(&[6, 0, b'B', b'C', 2, 0]);
            let bsize = u16::try_from(bgzf_size - 1).expect("BGZF block size fits in u16");
            out.extend_from_slice(&bsize.to_le_bytes());
        } else {
            out.extend_from_slice(&[GZIP_MAGIC[0], GZIP_MAGIC[1], 8, 0, 0, 0, 0, 0, 0, 0xff]);
        }

        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&crc.amount().to_le_bytes());

        Ok(())
    }

    fn encode_zstd(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.cctx.is_none() {
            let mut cctx = CCtx::try_create()
                .ok_or_else(|| Error::worker_failure("failed to create compression context"))?;
            cctx.set_parameter(CParameter::CompressionLevel(self.level))?;
            cctx.set_parameter(CParameter::ChecksumFlag(self.checksum_flag))?;
            self.cctx = Some(cctx);
        }
        let cctx = self.cctx.as_mut().expect("Compression context is initialized");

        let mut buf = Vec::with_capacity(zstd_safe::compress_bound(data.len()));
        cctx.compress2(&mut buf, data)?;
        out.extend_from_slice(&buf);

        Ok(())
    }
}

/// Splits written data into members and writes them back to back.
///
/// Data is buffered until a member is full. The last, possibly smaller, member is written by
/// [`Encoder::finish`].
///
/// # Examples
///
/// ```no_run
/// use std::{fs::File, io};
/// use concatz::Encoder;
///
/// let mut input = File::open("foo")?;
/// let output = File::create("foo.gz")?;
/// let mut encoder = Encoder::new(output);
/// io::copy(&mut input, &mut encoder)?;
/// let (written, members) = encoder.finish()?;
/// # Ok::<(), concatz::Error>(())
/// ```
pub struct Encoder<W> {
    member_encoder: MemberEncoder,
    member_size: usize,
    pending: Vec<u8>,
    out_buf: Vec<u8>,
    writer: W,
    table: MemberTable,
}

impl<W> Encoder<W> {
    /// Creates a new `Encoder` with default parameters.
    ///
    /// This is equivalent to calling `EncodeOptions::new().into_encoder(writer)`.
    pub fn new(writer: W) -> Self {
        Self::with_opts(writer, EncodeOptions::new())
    }

    /// Creates a new `Encoder` with the given [`EncodeOptions`].
    pub fn with_opts(writer: W, opts: EncodeOptions) -> Self {
        Self {
            member_encoder: MemberEncoder::new(&opts),
            member_size: opts.member_size,
            pending: Vec::with_capacity(opts.member_size.min(0x40_0000)),
            out_buf: Vec::new(),
            writer,
            table: MemberTable::new(),
        }
    }

    /// The members written so far.
    pub fn member_table(&self) -> &MemberTable {
        &self.table
    }

    /// The total number of compressed bytes written to the internal writer.
    pub fn written_compressed(&self) -> u64 {
        self.table.size_comp()
    }
}

impl<W: Write> Encoder<W> {
    /// Consumes input data from `buf`, writing every completed member.
    ///
    /// # Errors
    ///
    /// If compression or writing fails.
    pub fn compress(&mut self, mut buf: &[u8]) -> Result<usize> {
        let len = buf.len();

        while !buf.is_empty() {
            let n = (self.member_size - self.pending.len()).min(buf.len());
            self.pending.extend_from_slice(&buf[..n]);
            buf = &buf[n..];

            if self.pending.len() == self.member_size {
                self.end_member()?;
            }
        }

        Ok(len)
    }

    /// Compresses the buffered data into a member and writes it.
    ///
    /// Returns the compressed size of the member, or zero if nothing was buffered.
    ///
    /// # Errors
    ///
    /// If compression or writing fails.
    pub fn end_member(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        self.out_buf.clear();
        self.member_encoder.encode(&self.pending, &mut self.out_buf)?;
        self.writer.write_all(&self.out_buf)?;

        let member = Member::new(
            self.table.num_members(),
            self.table.size_comp(),
            self.out_buf.len() as u64,
            Some(self.pending.len() as u64),
        );
        self.table.push(member);
        self.pending.clear();

        Ok(self.out_buf.len())
    }

    /// Writes the last member and flushes the writer.
    ///
    /// Returns the total number of compressed bytes written and the table of written members.
    ///
    /// # Errors
    ///
    /// Fails if the last member cannot be written.
    pub fn finish(mut self) -> Result<(u64, MemberTable)> {
        self.end_member()?;
        self.writer.flush()?;

        Ok((self.table.size_comp(), self.table))
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.compress(buf).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
