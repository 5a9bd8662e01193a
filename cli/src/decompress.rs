use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use concatz::{DEFAULT_CHUNK_SIZE, DecodeOptions, DecodeStats, Decoder};
use indicatif::ProgressBar;
use memmap2::Mmap;

use crate::args::DecompressArgs;

enum Source {
    Mapped(Decoder<Mmap>),
    Buffered(Decoder<Vec<u8>>),
}

pub struct Decompressor {
    source: Source,
}

impl Decompressor {
    pub fn new(args: &DecompressArgs) -> Result<Self> {
        let mut opts = DecodeOptions::new()
            .parallelism(args.parallelism())
            .scan_strategy(args.scan.into());
        if let Some(format) = args.format.get() {
            opts = opts.format(format);
        }
        if let Some(n) = args.batch_members {
            opts = opts.batch_members(n);
        }

        Self::with_opts(&args.input_file, opts)
    }

    /// Maps `input_file` into memory, or buffers STDIN if it is `-`.
    pub fn with_opts(input_file: &Path, opts: DecodeOptions) -> Result<Self> {
        let source = if input_file == Path::new("-") {
            let decoder = Decoder::from_reader(io::stdin().lock(), opts)
                .context("Failed to read compressed input")?;
            Source::Buffered(decoder)
        } else {
            let file = File::open(input_file).context("Failed to open input file")?;
            // SAFETY: the mapping is read only and the file is not modified while it is decoded
            let mmap = unsafe { Mmap::map(&file) }.context("Failed to map input file")?;
            let decoder = Decoder::with_opts(mmap, opts).context("Failed to create decoder")?;
            Source::Mapped(decoder)
        };

        Ok(Self { source })
    }

    pub fn stats(&self) -> &DecodeStats {
        match &self.source {
            Source::Mapped(d) => d.stats(),
            Source::Buffered(d) => d.stats(),
        }
    }

    pub fn decompress_into<W: Write>(
        &mut self,
        writer: &mut W,
        bar: Option<&ProgressBar>,
    ) -> Result<u64> {
        let mut buf = vec![0; DEFAULT_CHUNK_SIZE];
        let mut written = 0;

        loop {
            let n = self.read(&mut buf).context("Failed to decompress data")?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .context("Failed to write decompressed data")?;
            written += n as u64;
            if let Some(b) = bar {
                b.set_position(self.stats().compressed_bytes);
            }
        }
        writer.flush().context("Failed to flush output")?;
        if let Some(b) = bar {
            b.finish_and_clear();
        }

        Ok(written)
    }
}

impl Read for Decompressor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Source::Mapped(d) => d.read(buf),
            Source::Buffered(d) => d.read(buf),
        }
    }
}
