use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use concatz::{EncodeOptions, Encoder, MemberTable};
use indicatif::ProgressBar;

use crate::args::CompressArgs;

const READ_SIZE: usize = 0x2_0000;

/// Totals of a finished compression.
#[derive(Debug)]
pub struct Compressed {
    pub read: u64,
    pub written: u64,
    pub members: MemberTable,
}

pub struct Compressor<W> {
    encoder: Encoder<W>,
}

impl<W> Compressor<W> {
    pub fn new(args: &CompressArgs, writer: W) -> Self {
        let mut opts = EncodeOptions::new()
            .format(args.format)
            .member_size(args.member_size.as_usize())
            .checksum_flag(!args.no_checksum);
        if let Some(level) = args.compression_level {
            opts = opts.compression_level(level);
        }

        Self {
            encoder: opts.into_encoder(writer),
        }
    }
}

impl<W: Write> Compressor<W> {
    pub fn compress_reader<R: Read>(
        mut self,
        reader: &mut R,
        bar: Option<&ProgressBar>,
    ) -> Result<Compressed> {
        let mut buf = vec![0; READ_SIZE];
        let mut read = 0;

        loop {
            let limit = match reader.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read input"),
            };
            if limit == 0 {
                break;
            }
            read += limit as u64;
            if let Some(b) = bar {
                b.inc(limit as u64);
            }

            let mut buf_pos = 0;
            while buf_pos < limit {
                let n = self
                    .encoder
                    .compress(&buf[buf_pos..limit])
                    .context("Failed to compress data")?;
                buf_pos += n;
            }
        }

        let (written, members) = self.finish()?;
        if let Some(b) = bar {
            b.finish_and_clear();
        }

        Ok(Compressed {
            read,
            written,
            members,
        })
    }

    pub fn finish(self) -> Result<(u64, MemberTable)> {
        self.encoder
            .finish()
            .context("Failed to finish compression")
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}
