use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, IsTerminal, Read, Write},
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use concatz::{DecodeOptions, Format, MemberTable};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use memmap2::Mmap;

use crate::{
    args::{BenchArgs, CliFlags, CompressArgs, DecompressArgs, ListArgs},
    bench,
    compress::Compressor,
    decompress::Decompressor,
};

// HumanBytes can mess up intendation if not formatted
#[inline]
pub fn human_bytes(n: u64) -> String {
    format!("{}", HumanBytes(n))
}

#[inline]
pub fn raw_bytes(n: u64) -> String {
    format!("{n}")
}

const KNOWN_EXTENSIONS: [Format; 3] = [Format::Zlib, Format::Gzip, Format::Zstd];

#[derive(Debug, Subcommand)]
#[command(arg_required_else_help(true))]
pub enum Command {
    /// Compress INPUT_FILE (default) into independent members; reads from STDIN if INPUT_FILE is
    /// `-` or not provided
    #[clap(alias = "c")]
    Compress(CompressArgs),
    /// Decompress concatenated members of INPUT_FILE in parallel; reads from STDIN if INPUT_FILE
    /// is `-`
    #[clap(alias = "d")]
    Decompress(DecompressArgs),
    /// Print the members of a file holding concatenated members
    #[clap(alias = "l")]
    List(ListArgs),
    /// Measure serial, parallel and streaming decoding of repeated input members
    #[clap(alias = "b")]
    Bench(BenchArgs),
}

impl Command {
    fn in_path(&self) -> Option<&Path> {
        let input_file = match self {
            Command::Compress(CompressArgs { input_file, .. })
            | Command::Decompress(DecompressArgs { input_file, .. })
            | Command::List(ListArgs { input_file, .. }) => input_file,
            Command::Bench(_) => return None,
        };

        (input_file != Path::new("-")).then_some(input_file.as_path())
    }

    fn out_path(&self, is_stdout: bool) -> Option<PathBuf> {
        if is_stdout {
            return None;
        }

        match self {
            Command::Compress(CompressArgs {
                output_file,
                format,
                ..
            }) => output_file
                .clone()
                .or_else(|| self.in_path().map(|p| with_format_extension(p, *format))),
            Command::Decompress(DecompressArgs { output_file, .. }) => output_file
                .clone()
                .or_else(|| self.in_path().map(strip_format_extension)),
            Command::List(_) | Command::Bench(_) => None,
        }
    }

    fn writer(&self, flags: &CliFlags, out_path: Option<&Path>) -> Result<Box<dyn Write>> {
        let writer: Box<dyn Write> = match out_path {
            Some(path) => {
                let meta = fs::metadata(path).ok();
                if !flags.force
                    && path.exists()
                    && !meta.is_some_and(|m| m.file_type().is_char_device())
                {
                    if flags.quiet || self.in_path().is_none() {
                        bail!("{} already exists; not overwritten", path.display());
                    }

                    eprint!("{} already exists; overwrite (y/n) ? ", path.display());
                    io::stderr().flush()?;
                    let mut buf = String::new();
                    io::stdin()
                        .read_line(&mut buf)
                        .context("Failed to read stdin")?;
                    if buf.trim_end() != "y" {
                        bail!("{} already exists", path.display());
                    }
                }

                Box::new(File::create(path).context("Failed to open output file")?)
            }
            None => {
                let stdout = io::stdout();
                if !flags.force && stdout.is_terminal() {
                    bail!("stdout is a terminal, aborting");
                }

                Box::new(stdout.lock())
            }
        };

        Ok(writer)
    }

    pub fn run(self, flags: &CliFlags) -> Result<()> {
        let byte_fmt = if flags.raw_bytes {
            raw_bytes
        } else {
            human_bytes
        };
        let in_name = self
            .in_path()
            .map_or_else(|| "STDIN".into(), |p| p.display().to_string());

        let mode = match self {
            Command::Compress(ref args) => {
                let out_path = self.out_path(flags.stdout);
                let writer = self.writer(flags, out_path.as_deref())?;
                let reader: Box<dyn Read> = match self.in_path() {
                    Some(p) => Box::new(File::open(p).context("Failed to open input file")?),
                    None => Box::new(io::stdin().lock()),
                };

                ExecMode::Compress {
                    reader,
                    compressor: Compressor::new(args, writer),
                    out_name: out_path.map_or_else(|| "STDOUT".into(), |p| p.display().to_string()),
                    bar: flags
                        .is_with_progress()
                        .then(|| with_bar(self.in_path())),
                }
            }
            Command::Decompress(ref args) => {
                let out_path = self.out_path(flags.stdout);
                let writer = self.writer(flags, out_path.as_deref())?;

                ExecMode::Decompress {
                    decompressor: Decompressor::new(args)?,
                    writer,
                    bar: flags
                        .is_with_progress()
                        .then(|| with_bar(self.in_path())),
                }
            }
            Command::List(args) => {
                let mut opts = DecodeOptions::new();
                if let Some(format) = args.format.get() {
                    opts = opts.format(format);
                }
                let table = if args.input_file == Path::new("-") {
                    let mut buf = Vec::new();
                    io::stdin()
                        .lock()
                        .read_to_end(&mut buf)
                        .context("Failed to read stdin")?;
                    opts.scan(&buf)
                } else {
                    let file =
                        File::open(&args.input_file).context("Failed to open input file")?;
                    // SAFETY: the mapping is read only and the file is not modified while scanned
                    let mmap = unsafe { Mmap::map(&file) }.context("Failed to map input file")?;
                    opts.scan(&mmap)
                }
                .context("Failed to scan members")?;

                ExecMode::List {
                    table,
                    from_member: args.from_member,
                    to_member: args.to_member,
                    detail: args.detail,
                }
            }
            Command::Bench(args) => return bench::run(&args, flags),
        };

        Executor {
            mode,
            in_name,
            byte_fmt,
            print_summary: flags.print_summary(),
        }
        .run()
    }
}

fn with_format_extension(path: &Path, format: Format) -> PathBuf {
    // TODO: Use `add_extension` when stable: https://github.com/rust-lang/rust/issues/127292
    let extension = path.extension().map_or_else(
        || OsString::from(format.extension()),
        |e| {
            let mut ext = OsString::from(e);
            ext.push(".");
            ext.push(format.extension());
            ext
        },
    );

    path.with_extension(extension)
}

fn strip_format_extension(path: &Path) -> PathBuf {
    let known = path.extension().is_some_and(|e| {
        KNOWN_EXTENSIONS
            .iter()
            .any(|f| e.eq_ignore_ascii_case(f.extension()))
    });

    if known {
        path.with_extension("")
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".out");
        PathBuf::from(name)
    }
}

enum ExecMode {
    Compress {
        reader: Box<dyn Read>,
        compressor: Compressor<Box<dyn Write>>,
        out_name: String,
        bar: Option<ProgressBar>,
    },
    Decompress {
        decompressor: Decompressor,
        writer: Box<dyn Write>,
        bar: Option<ProgressBar>,
    },
    List {
        table: MemberTable,
        from_member: Option<usize>,
        to_member: Option<usize>,
        detail: bool,
    },
}

struct Executor {
    mode: ExecMode,
    in_name: String,
    byte_fmt: fn(u64) -> String,
    print_summary: bool,
}

impl Executor {
    fn run(self) -> Result<()> {
        match self.mode {
            ExecMode::Compress {
                mut reader,
                compressor,
                out_name,
                bar,
            } => {
                let compressed = compressor.compress_reader(&mut reader, bar.as_ref())?;

                if self.print_summary {
                    eprintln!(
                        "{in_name} : {ratio:.2}% ( {bytes_read} => {bytes_written}, {members} members, {out_name})",
                        in_name = self.in_name,
                        ratio = 100. / compressed.read as f64 * compressed.written as f64,
                        bytes_read = (self.byte_fmt)(compressed.read),
                        bytes_written = (self.byte_fmt)(compressed.written),
                        members = compressed.members.num_members(),
                    );
                }
            }
            ExecMode::Decompress {
                mut decompressor,
                mut writer,
                bar,
            } => {
                let written = decompressor.decompress_into(&mut writer, bar.as_ref())?;
                let stats = decompressor.stats();
                tracing::info!(
                    members = stats.members,
                    scan_ms = stats.scan_time.as_millis(),
                    decode_ms = stats.decode_time.as_millis(),
                    "decompressed"
                );

                if self.print_summary {
                    eprintln!(
                        "{in_name} : {bytes_written} ( {members} members, {secs:.3}s)",
                        in_name = self.in_name,
                        bytes_written = (self.byte_fmt)(written),
                        members = stats.members,
                        secs = stats.elapsed().as_secs_f64(),
                    );
                }
            }
            ExecMode::List {
                table,
                from_member,
                to_member,
                detail,
            } => {
                if from_member.is_none() && to_member.is_none() && !detail {
                    list_summarize(&table, &self.in_name, self.byte_fmt);
                } else {
                    list_members(&table, from_member, to_member, self.byte_fmt)?;
                }
            }
        }

        Ok(())
    }
}

fn list_summarize(table: &MemberTable, in_name: &str, byte_fmt: fn(u64) -> String) {
    let num_members = table.num_members();
    let compressed = table.size_comp();
    let uncompressed = table.size_decomp();
    let ratio = uncompressed.map_or_else(
        || "-".to_string(),
        |u| format!("{:.3}", u as f64 / compressed as f64),
    );
    let compressed = (byte_fmt)(compressed);
    let uncompressed = uncompressed.map_or_else(|| "-".to_string(), byte_fmt);
    let max_member_size = (byte_fmt)(table.max_member_size_comp());

    println!(
        "{: <15} {: <15} {: <15} {: <15} {: <10} {: <15}",
        "Members", "Compressed", "Uncompressed", "Max Member Size", "Ratio", "Filename"
    );
    println!(
        "{num_members: <15} {compressed: <15} {uncompressed: <15} {max_member_size: <15} {ratio: <10} {in_name: <15}",
    );
}

fn list_members(
    table: &MemberTable,
    from_member: Option<usize>,
    to_member: Option<usize>,
    byte_fmt: fn(u64) -> String,
) -> Result<()> {
    use std::fmt::Write as _;

    let member_err = |index| format!("Failed to get data of member {index}");
    let start = from_member.unwrap_or(0);
    let end = to_member.unwrap_or_else(|| table.num_members());
    if start > end {
        bail!("Start member ({start}) cannot be greater than end member ({end})");
    }
    // line length (71) times lines
    let mut buf = String::with_capacity(71 * 100);

    println!(
        "{: <15} {: <15} {: <15} {: <20}",
        "Member Index", "Compressed", "Uncompressed", "Compressed Offset"
    );

    let mut cnt = 0;
    for n in start..end {
        let member = table.member(n).with_context(|| member_err(n))?;
        let comp = (byte_fmt)(member.size());
        let uncomp = member
            .decompressed_size()
            .map_or_else(|| "-".to_string(), byte_fmt);
        let comp_off = (byte_fmt)(member.offset());

        writeln!(&mut buf, "{n: <15} {comp: <15} {uncomp: <15} {comp_off: <20}")?;

        cnt += 1;
        if cnt == 100 {
            cnt = 0;
            print!("{buf}");
            buf.clear();
        }
    }
    print!("{buf}");

    Ok(())
}

fn with_bar(in_path: Option<&Path>) -> ProgressBar {
    let len = in_path.and_then(|p| fs::metadata(p).map(|m| m.len()).ok());
    ProgressBar::with_draw_target(len, ProgressDrawTarget::stderr_with_hz(5)).with_style(
        ProgressStyle::with_template("{binary_bytes} of {binary_total_bytes}")
            .expect("Static template always works"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_paths() {
        assert_eq!(
            with_format_extension(Path::new("data.txt"), Format::Gzip),
            PathBuf::from("data.txt.gz")
        );
        assert_eq!(
            with_format_extension(Path::new("data"), Format::Zstd),
            PathBuf::from("data.zst")
        );
        assert_eq!(
            strip_format_extension(Path::new("data.txt.gz")),
            PathBuf::from("data.txt")
        );
        assert_eq!(
            strip_format_extension(Path::new("data.ZZ")),
            PathBuf::from("data")
        );
        assert_eq!(
            strip_format_extension(Path::new("data.bin")),
            PathBuf::from("data.bin.out")
        );
    }
}
