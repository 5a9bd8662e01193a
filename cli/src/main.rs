use anyhow::Result;
use args::{CliFlags, CompressArgs};
use clap::Parser;
use command::Command;

mod args;
mod bench;
mod command;
mod compress;
mod decompress;
#[cfg(test)]
mod tests;

/// Compress data into independent members and decompress concatenated zlib, gzip and zstd
/// members in parallel.
#[derive(Debug, Parser)]
#[command(version, about)]
#[clap(args_conflicts_with_subcommands = true)]
struct Cli {
    #[clap(flatten)]
    flags: CliFlags,

    #[clap(subcommand)]
    command: Option<Command>,

    #[clap(flatten)]
    compress_args: CompressArgs,
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.flags.log_level);

    cli.command
        .unwrap_or(Command::Compress(cli.compress_args))
        .run(&cli.flags)
}
