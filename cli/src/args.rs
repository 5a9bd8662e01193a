use std::{path::PathBuf, str::FromStr};

use anyhow::bail;
use clap::{Args, Parser, ValueEnum};
use concatz::{CompressionLevel, Format, ScanStrategy};

#[derive(Debug, Clone)]
pub struct ByteValue(u64);

impl ByteValue {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl FromStr for ByteValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit): (String, String) = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .partition(|c| c.is_ascii_digit());
        let value: u64 = value.parse()?;

        let factor: u64 = match unit.as_str() {
            "" | "B" => 1,
            "K" | "kib" => 1024,
            "M" | "mib" => 1024 * 1024,
            "G" | "gib" => 1024 * 1024 * 1024,
            "T" | "tib" => 1024 * 1024 * 1024 * 1024,
            _ => bail!("Unknown unit: {unit:?}"),
        };

        match value.checked_mul(factor) {
            Some(v) => Ok(Self(v)),
            None => bail!("Byte value {s:?} is too large"),
        }
    }
}

/// A member format or `auto` to detect it from the first member.
#[derive(Debug, Clone, Copy)]
pub struct MemberFormat(Option<Format>);

impl MemberFormat {
    pub fn get(self) -> Option<Format> {
        self.0
    }
}

impl FromStr for MemberFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self(None));
        }

        Ok(Self(Some(s.parse()?)))
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScanArg {
    /// Parse member headers and block structure without decompressing.
    Structural,
    /// Decompress every member into a scratch buffer.
    Trial,
}

impl From<ScanArg> for ScanStrategy {
    fn from(value: ScanArg) -> Self {
        match value {
            ScanArg::Structural => Self::Structural,
            ScanArg::Trial => Self::Trial,
        }
    }
}

#[derive(Debug, Args)]
pub struct CliFlags {
    /// Disable output checks.
    #[arg(short, long, action, global = true)]
    pub force: bool,

    /// Suppress output.
    #[arg(short, long, action, global = true)]
    pub quiet: bool,

    /// Write to STDOUT.
    #[arg(short = 'c', long, action, global = true)]
    pub stdout: bool,

    /// Do not show the progress counter.
    #[arg(long, action, global = true)]
    pub no_progress: bool,

    /// Print raw byte values instead of human readable ones like 1KiB.
    #[arg(long, action, global = true)]
    pub raw_bytes: bool,

    /// Log filter, e.g. `debug` or `concatz=trace`.
    #[arg(long, env = "CONCATZ_LOG", default_value = "warn", global = true)]
    pub log_level: String,
}

impl CliFlags {
    pub fn is_with_progress(&self) -> bool {
        !self.quiet && !self.stdout && !self.no_progress
    }

    pub fn print_summary(&self) -> bool {
        !self.quiet
    }
}

#[derive(Debug, Parser)]
pub struct CompressArgs {
    /// The format of the written members.
    #[arg(long, default_value = "gzip")]
    pub format: Format,

    /// Compression level. zlib and gzip accept 0 to 9, zstd accepts 1 to 22. Defaults to the
    /// default level of the format.
    #[arg(short = 'l', long)]
    pub compression_level: Option<CompressionLevel>,

    /// The amount of uncompressed data per member. Accepts the suffixes kib, mib, gib and tib.
    #[arg(long, default_value = "64K")]
    pub member_size: ByteValue,

    /// Don't include content checksums in zstd members.
    #[arg(long, action)]
    pub no_checksum: bool,

    /// Input file.
    #[arg(default_value = "-")]
    pub input_file: PathBuf,

    /// Write data to the specified file.
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct DecompressArgs {
    /// The number of members decoded concurrently. Defaults to the number of logical CPUs.
    #[arg(short, long, env = "CONCATZ_PARALLELISM")]
    pub parallelism: Option<usize>,

    /// The member format, `auto` detects it from the first member.
    #[arg(long, default_value = "auto")]
    pub format: MemberFormat,

    /// How member boundaries are discovered.
    #[arg(long, value_enum, default_value_t = ScanArg::Structural)]
    pub scan: ScanArg,

    /// The number of members scanned and decoded per batch.
    #[arg(long)]
    pub batch_members: Option<usize>,

    /// Input file; reads from STDIN if `-`.
    pub input_file: PathBuf,

    /// Write data to the specified file.
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,
}

impl DecompressArgs {
    pub fn parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// The member index at which listing starts.
    #[arg(long)]
    pub from_member: Option<usize>,

    /// The member index at which listing ends (exclusive).
    #[arg(long)]
    pub to_member: Option<usize>,

    /// Detailed listing of individual members, automatically implied when member boundaries are
    /// provided.
    #[arg(short, long, action)]
    pub detail: bool,

    /// The member format, `auto` detects it from the first member.
    #[arg(long, default_value = "auto")]
    pub format: MemberFormat,

    /// Input file; reads from STDIN if `-`.
    pub input_file: PathBuf,
}

#[derive(Debug, Parser)]
pub struct BenchArgs {
    /// Files holding one compressed member each. They are repeated in turn to build the benchmark
    /// input.
    #[arg(required = true)]
    pub input_files: Vec<PathBuf>,

    /// The number of files taken from the repeated inputs.
    #[arg(long, default_value_t = 1000)]
    pub count: usize,

    /// Comma separated parallelism levels to measure. Defaults to 1, 2, 4, 8 and the number of
    /// logical CPUs.
    #[arg(short, long, value_delimiter = ',')]
    pub parallelism: Vec<usize>,

    /// The size of the reads when decoding as a stream.
    #[arg(long, default_value = "1M")]
    pub chunk_size: ByteValue,

    /// Also write the benchmark input to this file and time decoding it from there.
    #[arg(long)]
    pub save_input: Option<PathBuf>,
}

impl BenchArgs {
    pub fn parallelism_levels(&self) -> Vec<usize> {
        if !self.parallelism.is_empty() {
            return self.parallelism.clone();
        }

        let mut levels = vec![1, 2, 4, 8, num_cpus::get()];
        levels.sort_unstable();
        levels.dedup();
        levels
    }
}
