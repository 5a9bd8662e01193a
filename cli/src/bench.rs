use std::{
    fs,
    io::Read,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail, ensure};
use concatz::{DecodeOptions, concat_decode};
use tracing::info;

use crate::{
    args::{BenchArgs, CliFlags},
    command::{human_bytes, raw_bytes},
    decompress::Decompressor,
};

const MIB: f64 = 1024.0 * 1024.0;

struct Report {
    rows: Vec<(String, Duration)>,
    decompressed: u64,
}

impl Report {
    fn record(&mut self, label: String, elapsed: Duration) {
        info!(label, secs = elapsed.as_secs_f64(), "measured");
        self.rows.push((label, elapsed));
    }

    fn print(&self) {
        println!("{: <44} {: <12} {: <15}", "Method", "Seconds", "Throughput");
        for (label, elapsed) in &self.rows {
            let secs = elapsed.as_secs_f64();
            let throughput = if secs > 0.0 {
                format!("{:.1} MiB/s", self.decompressed as f64 / secs / MIB)
            } else {
                "-".to_string()
            };
            println!("{label: <44} {secs: <12.4} {throughput: <15}");
        }
    }
}

fn timed<T>(f: impl FnOnce() -> Result<T>) -> Result<(T, Duration)> {
    let start = Instant::now();
    let value = f()?;
    Ok((value, start.elapsed()))
}

/// Reads `decoder` in chunks of `chunk_size` and drops them, returning the number of bytes read.
fn read_and_discard<R: Read>(decoder: &mut R, chunk_size: usize) -> Result<u64> {
    let mut chunk = vec![0; chunk_size];
    let mut total = 0;

    loop {
        let n = decoder.read(&mut chunk).context("Failed to decode stream")?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

pub fn run(args: &BenchArgs, flags: &CliFlags) -> Result<()> {
    ensure!(args.count > 0, "The member count must be greater than zero");
    ensure!(
        args.chunk_size.as_u64() > 0,
        "The chunk size must be greater than zero"
    );
    let byte_fmt = if flags.raw_bytes {
        raw_bytes
    } else {
        human_bytes
    };

    let inputs = args
        .input_files
        .iter()
        .map(|p| fs::read(p).with_context(|| format!("Failed to read {}", p.display())))
        .collect::<Result<Vec<_>>>()?;
    let parts = inputs
        .iter()
        .map(Vec::as_slice)
        .cycle()
        .take(args.count)
        .collect::<Vec<_>>();
    let fixture = parts.concat();
    if let Some(path) = &args.save_input {
        fs::write(path, &fixture)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let (separate, elapsed) = timed(|| {
        parts
            .iter()
            .map(|p| concat_decode(p).context("Failed to decode input"))
            .collect::<Result<Vec<_>>>()
    })?;
    let mut report = Report {
        rows: Vec::new(),
        decompressed: separate.iter().map(|d| d.len() as u64).sum(),
    };
    report.record("each input separately".into(), elapsed);

    let (reference, elapsed) = timed(|| Ok(separate.concat()))?;
    report.record("each input separately, joined".into(), elapsed);
    drop(separate);
    info!(
        inputs = args.count,
        compressed = fixture.len(),
        decompressed = reference.len(),
        "benchmark input"
    );

    let check = |label: &str, data: &[u8]| {
        if data != reference.as_slice() {
            bail!("{label}: output differs from decoding each input separately");
        }
        Ok(())
    };

    let (data, elapsed) = timed(|| concat_decode(&fixture).context("Serial decode failed"))?;
    check("serial", &data)?;
    report.record("serial".into(), elapsed);
    drop(data);

    let (decoded, elapsed) = timed(|| {
        DecodeOptions::new()
            .decode_members(&parts)
            .context("Decoding separate members failed")
    })?;
    check("separate members", &decoded.data)?;
    report.record(
        format!("separate members parallelism={}", num_cpus::get()),
        elapsed,
    );
    drop(decoded);

    for parallelism in args.parallelism_levels() {
        let opts = DecodeOptions::new().parallelism(parallelism);

        let (decoded, elapsed) = timed(|| opts.decode(&fixture).context("Parallel decode failed"))?;
        check("parallel", &decoded.data)?;
        report.record(format!("parallel parallelism={parallelism}"), elapsed);
        drop(decoded);

        let (read, elapsed) = timed(|| {
            let mut decoder = opts
                .clone()
                .into_decoder(fixture.as_slice())
                .context("Failed to create decoder")?;
            read_and_discard(&mut decoder, args.chunk_size.as_usize())
        })?;
        ensure!(
            read == reference.len() as u64,
            "streaming: read {read} of {} bytes",
            reference.len()
        );
        report.record(
            format!(
                "stream {} chunks parallelism={parallelism}",
                byte_fmt(args.chunk_size.as_u64())
            ),
            elapsed,
        );

        // Includes opening and mapping the saved input
        if let Some(path) = &args.save_input {
            let (read, elapsed) = timed(|| {
                let mut decompressor = Decompressor::with_opts(path, opts.clone())?;
                read_and_discard(&mut decompressor, args.chunk_size.as_usize())
            })?;
            ensure!(
                read == reference.len() as u64,
                "from file: read {read} of {} bytes",
                reference.len()
            );
            report.record(format!("from file parallelism={parallelism}"), elapsed);
        }
    }

    if flags.print_summary() {
        eprintln!(
            "{members} inputs, {compressed} => {decompressed}",
            members = args.count,
            compressed = byte_fmt(fixture.len() as u64),
            decompressed = byte_fmt(reference.len() as u64),
        );
    }
    report.print();

    Ok(())
}
