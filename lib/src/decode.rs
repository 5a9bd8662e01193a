use std::{
    any::Any,
    io::{self, Read},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use tracing::{debug, trace, warn};

use crate::{
    Format,
    codec::{MAX_RESERVE, MemberDecoder, decoder_for},
    error::{Error, Result},
    member::{Member, MemberState, MemberTable},
    scan::{ScanStrategy, Scanner},
    stats::DecodeStats,
};

/// Default size of the reads that fill the source of [`Decoder::from_reader`].
pub const DEFAULT_CHUNK_SIZE: usize = 0x10_0000;
/// Members per worker and batch if no batch size is configured.
const MEMBERS_PER_WORKER: usize = 4;
const NOT_FAILED: usize = usize::MAX;

/// Options that configure how members are decoded.
///
/// # Examples
///
/// Supports builder like chaining.
///
/// ```
/// use concatz::{DecodeOptions, Format, ScanStrategy};
///
/// let decoded = DecodeOptions::new()
///     .parallelism(4)
///     .format(Format::Gzip)
///     .scan_strategy(ScanStrategy::Structural)
///     .decode(&[])?;
/// assert!(decoded.data.is_empty());
/// # Ok::<(), concatz::Error>(())
/// ```
#[derive(Clone)]
pub struct DecodeOptions {
    parallelism: usize,
    format: Option<Format>,
    scan_strategy: ScanStrategy,
    decoder: Option<Arc<dyn MemberDecoder>>,
    batch_members: Option<usize>,
    chunk_size: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("parallelism", &self.parallelism)
            .field("format", &self.format)
            .field("scan_strategy", &self.scan_strategy)
            .field("decoder", &self.decoder.as_ref().map(|d| d.format()))
            .field("batch_members", &self.batch_members)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl DecodeOptions {
    /// Creates a set of options with default values.
    ///
    /// Parallelism defaults to the number of logical CPUs and the member format is detected from
    /// the first member.
    pub fn new() -> Self {
        Self {
            parallelism: num_cpus::get(),
            format: None,
            scan_strategy: ScanStrategy::default(),
            decoder: None,
            batch_members: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the number of workers that decode members concurrently.
    ///
    /// A parallelism of zero is rejected when decoding starts.
    pub fn parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    /// Sets the member format instead of detecting it.
    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Sets how member boundaries are discovered.
    pub fn scan_strategy(mut self, strategy: ScanStrategy) -> Self {
        self.scan_strategy = strategy;
        self
    }

    /// Sets the decoder used for every member.
    ///
    /// The format of the decoder is used as member format, unless a format is set explicitly.
    pub fn decoder(mut self, decoder: Arc<dyn MemberDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Sets the number of members a streaming [`Decoder`] scans and decodes at once.
    ///
    /// Defaults to four members per worker. A value of zero is treated as one.
    pub fn batch_members(mut self, n: usize) -> Self {
        self.batch_members = Some(n.max(1));
        self
    }

    /// Sets the size of the reads of [`Decoder::from_reader`]. Defaults to 1MiB.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn member_format(&self) -> Option<Format> {
        self.format.or_else(|| self.decoder.as_ref().map(|d| d.format()))
    }

    fn member_decoder(&self, format: Format) -> Arc<dyn MemberDecoder> {
        self.decoder
            .clone()
            .unwrap_or_else(|| decoder_for(format))
    }

    fn scanner<'a>(&self, buf: &'a [u8], format: Option<Format>) -> Scanner<'a> {
        let scanner = Scanner::new(buf, format, self.scan_strategy);
        match &self.decoder {
            Some(decoder) => scanner.with_decoder(Arc::clone(decoder)),
            None => scanner,
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_members
            .unwrap_or(self.parallelism.saturating_mul(MEMBERS_PER_WORKER))
    }

    fn thread_pool(&self) -> Result<ThreadPool> {
        if self.parallelism == 0 {
            return Err(Error::invalid_parallelism());
        }

        ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name(|i| format!("concatz-worker-{i}"))
            .build()
            .map_err(Error::thread_pool)
    }

    /// Discovers all members of `buf` without decoding them.
    ///
    /// # Errors
    ///
    /// Fails if a member header is invalid or the buffer ends inside a member.
    pub fn scan(&self, buf: &[u8]) -> Result<MemberTable> {
        self.scanner(buf, self.member_format()).into_table()
    }

    /// Decodes all members of `buf` and concatenates their content in order.
    ///
    /// Members are discovered sequentially first, then decoded by a pool of `parallelism`
    /// workers. The output is the same for every parallelism. Nothing is returned if any member
    /// fails; the error refers to the failing member with the lowest index. If the scan stops
    /// early, the members found before that point are still decoded, so a damaged member that
    /// misleads the scan is reported instead of the member after it.
    ///
    /// # Errors
    ///
    /// Fails if the parallelism is zero, the worker pool cannot be built, or any member fails to
    /// scan or decode.
    pub fn decode(&self, buf: &[u8]) -> Result<Decoded> {
        let pool = self.thread_pool()?;

        let start = Instant::now();
        let mut scanner = self.scanner(buf, self.member_format());
        let mut members = Vec::new();
        let mut scan_error = None;
        for res in scanner.by_ref() {
            match res {
                Ok(member) => members.push(member),
                Err(err) => {
                    scan_error = Some(err);
                    break;
                }
            }
        }
        let scan_time = start.elapsed();

        let Some(format) = scanner.format() else {
            return scan_error.map_or_else(|| Ok(Decoded::default()), Err);
        };
        if let Some(err) = &scan_error {
            debug!(
                members = members.len(),
                error = %err,
                "scan stopped early, decoding the members before it"
            );
        }
        debug!(
            members = members.len(),
            bytes = buf.len(),
            parallelism = self.parallelism,
            %format,
            "decoding members"
        );

        let jobs = members
            .iter()
            .map(|m| Job::scanned(buf, m))
            .collect::<Vec<_>>();

        let start = Instant::now();
        let parts = decode_jobs(&pool, self.member_decoder(format).as_ref(), &jobs)?;
        let decode_time = start.elapsed();
        if let Some(err) = scan_error {
            return Err(err);
        }

        let data = parts.concat();
        let stats = DecodeStats {
            members: members.len(),
            compressed_bytes: buf.len() as u64,
            decompressed_bytes: data.len() as u64,
            scan_time,
            decode_time,
        };
        debug!(?stats, "decoded members");

        Ok(Decoded { data, stats })
    }

    /// Decodes members that were already split by the caller and concatenates them in order.
    ///
    /// No boundary scan takes place, each slice must hold exactly one member. Error offsets
    /// refer to the position the member would have if all slices were concatenated.
    ///
    /// # Errors
    ///
    /// Fails if the parallelism is zero, the worker pool cannot be built, or any member fails to
    /// decode.
    pub fn decode_members(&self, members: &[&[u8]]) -> Result<Decoded> {
        let pool = self.thread_pool()?;

        let Some(first) = members.iter().find(|m| !m.is_empty()) else {
            // Empty slices hold no member header
            return match members.len() {
                0 => Ok(Decoded::default()),
                _ => Err(Error::truncated().at_member(0, 0)),
            };
        };
        let format = self
            .member_format()
            .or_else(|| Format::detect(first))
            .ok_or_else(|| Error::malformed("unrecognized member header").at_member(0, 0))?;

        let mut offset = 0;
        let jobs = members
            .iter()
            .enumerate()
            .map(|(index, input)| {
                let job = Job {
                    index,
                    offset,
                    input,
                    size_hint: None,
                };
                offset += input.len() as u64;
                job
            })
            .collect::<Vec<_>>();
        debug!(
            members = jobs.len(),
            bytes = offset,
            parallelism = self.parallelism,
            %format,
            "decoding split members"
        );

        let start = Instant::now();
        let parts = decode_jobs(&pool, self.member_decoder(format).as_ref(), &jobs)?;
        let data = parts.concat();

        Ok(Decoded {
            stats: DecodeStats {
                members: jobs.len(),
                compressed_bytes: offset,
                decompressed_bytes: data.len() as u64,
                scan_time: std::time::Duration::ZERO,
                decode_time: start.elapsed(),
            },
            data,
        })
    }

    /// Builds a streaming [`Decoder`] over `src` with the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the parallelism is zero or the worker pool cannot be built.
    pub fn into_decoder<S: AsRef<[u8]>>(self, src: S) -> Result<Decoder<S>> {
        Decoder::with_opts(src, self)
    }
}

/// The decompressed content of a buffer together with the statistics of the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// The concatenated content of all members.
    pub data: Vec<u8>,
    pub stats: DecodeStats,
}

impl Decoded {
    /// Consumes this value and returns the decompressed content.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// A unit of work for the pool: one member and its position.
#[derive(Debug, Clone, Copy)]
struct Job<'a> {
    index: usize,
    offset: u64,
    input: &'a [u8],
    size_hint: Option<u64>,
}

impl<'a> Job<'a> {
    fn scanned(buf: &'a [u8], member: &Member) -> Self {
        Self {
            index: member.index(),
            offset: member.offset(),
            input: &buf[member.range()],
            size_hint: member.decompressed_size(),
        }
    }
}

// Decodes all jobs on `pool`, returning their contents in job order.
//
// Every job gets its own result slot. A job whose index is higher than an already failed one is
// skipped, the reported error is the one with the lowest index.
fn decode_jobs(
    pool: &ThreadPool,
    decoder: &dyn MemberDecoder,
    jobs: &[Job<'_>],
) -> Result<Vec<Vec<u8>>> {
    let failed = AtomicUsize::new(NOT_FAILED);
    let mut slots: Vec<Option<Result<Vec<u8>>>> = Vec::new();
    slots.resize_with(jobs.len(), || None);

    pool.install(|| {
        jobs.par_iter()
            .zip(slots.par_iter_mut())
            .for_each(|(job, slot)| {
                if job.index > failed.load(Ordering::Acquire) {
                    trace!(index = job.index, "skipping member after earlier failure");
                    return;
                }

                let res = decode_job(decoder, job);
                if res.is_err() {
                    failed.fetch_min(job.index, Ordering::AcqRel);
                }
                *slot = Some(res);
            });
    });

    let first_failed = failed.into_inner();
    slots
        .into_iter()
        .zip(jobs)
        .map(|(slot, job)| match slot {
            Some(res) => res,
            // Only members behind a failure are skipped
            None => Err(Error::worker_failure(format!(
                "member skipped after member {first_failed} failed"
            ))
            .at_member(job.index, job.offset)),
        })
        .collect()
}

fn decode_job(decoder: &dyn MemberDecoder, job: &Job<'_>) -> Result<Vec<u8>> {
    trace!(index = job.index, from = ?MemberState::Scanning, to = ?MemberState::Decoding);

    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        let reserve = job.size_hint.unwrap_or(0).min(MAX_RESERVE);
        let mut out = Vec::with_capacity(usize::try_from(reserve).unwrap_or(0));
        let n = decoder.decode_into(job.input, &mut out)?;
        if n != job.input.len() {
            return Err(Error::malformed(format!(
                "member ends after {n} of {} bytes",
                job.input.len()
            )));
        }
        Ok(out)
    }))
    .unwrap_or_else(|panic| Err(Error::worker_failure(panic_message(panic.as_ref()))));

    match &res {
        Ok(data) => trace!(
            index = job.index,
            bytes = data.len(),
            from = ?MemberState::Decoding,
            to = ?MemberState::Done
        ),
        Err(err) => warn!(
            index = job.index,
            offset = job.offset,
            error = %err,
            from = ?MemberState::Decoding,
            to = ?MemberState::Failed,
            "member failed"
        ),
    }

    res.map_err(|e| e.at_member(job.index, job.offset))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "member decoder panicked".to_string()
    }
}

/// Decodes members serially, restarting the member decoder where the previous member ends.
///
/// This needs no boundary scan and serves as the reference every parallel decode is compared
/// against.
///
/// # Errors
///
/// Fails if a member is invalid or the buffer ends inside a member.
pub fn concat_decode(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let format = Format::detect(buf)
        .ok_or_else(|| Error::malformed("unrecognized member header").at_member(0, 0))?;
    let decoder = decoder_for(format);

    let mut out = Vec::new();
    let mut pos = 0;
    let mut index = 0;
    while pos < buf.len() {
        let n = decoder
            .decode_into(&buf[pos..], &mut out)
            .map_err(|e| e.at_member(index, pos as u64))?;
        debug_assert!(n > 0);
        pos += n;
        index += 1;
    }

    Ok(out)
}

/// Members scanned for a batch, with the error that ended the scan early.
#[derive(Debug, Default)]
struct Batch {
    members: Vec<Member>,
    error: Option<Error>,
}

/// The position of the scan between batches.
#[derive(Debug, Clone, Copy)]
struct ScanCursor {
    offset: usize,
    index: usize,
    format: Option<Format>,
}

fn scan_batch(buf: &[u8], cursor: ScanCursor, opts: &DecodeOptions) -> (Batch, ScanCursor) {
    let mut scanner = opts
        .scanner(buf, cursor.format)
        .resume_at(cursor.offset, cursor.index);
    let mut batch = Batch::default();

    for res in scanner.by_ref().take(opts.batch_size()) {
        match res {
            Ok(member) => batch.members.push(member),
            Err(err) => {
                batch.error = Some(err);
                break;
            }
        }
    }

    let cursor = ScanCursor {
        offset: scanner.offset(),
        index: scanner.index(),
        format: scanner.format(),
    };
    (batch, cursor)
}

/// Decodes concatenated members from an in-memory source as a stream.
///
/// Members are scanned and decoded in batches. While the workers decode one batch, the next
/// batch is scanned, so at most two batches of members are held in memory at a time.
///
/// Unlike [`DecodeOptions::decode`], content of members before a failing member is returned by
/// earlier reads. Once a read fails, every later read fails with the same error.
///
/// # Examples
///
/// ```no_run
/// use std::{fs, io};
/// use concatz::DecodeOptions;
///
/// let compressed = fs::read("data.gz")?;
/// let mut decoder = DecodeOptions::new().parallelism(8).into_decoder(compressed)?;
/// io::copy(&mut decoder, &mut io::stdout())?;
/// # Ok::<(), concatz::Error>(())
/// ```
pub struct Decoder<S> {
    src: S,
    pool: ThreadPool,
    opts: DecodeOptions,
    member_decoder: Option<Arc<dyn MemberDecoder>>,
    cursor: ScanCursor,
    pending: Option<Batch>,
    failed: Option<Error>,
    out_buf: Vec<u8>,
    out_buf_pos: usize,
    stats: DecodeStats,
}

impl Decoder<Vec<u8>> {
    /// Reads all of `reader` and creates a `Decoder` over it.
    ///
    /// The source is read once, up front, in reads of the configured chunk size.
    ///
    /// # Errors
    ///
    /// Fails if reading fails, the parallelism is zero, or the worker pool cannot be built.
    pub fn from_reader<R: Read>(mut reader: R, opts: DecodeOptions) -> Result<Self> {
        let mut src = Vec::new();
        let mut chunk = vec![0; opts.chunk_size];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => src.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(bytes = src.len(), "read compressed source");

        Self::with_opts(src, opts)
    }
}

impl<S: AsRef<[u8]>> Decoder<S> {
    /// Creates a new `Decoder` with default parameters and `src` as source.
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot be built.
    pub fn new(src: S) -> Result<Self> {
        Self::with_opts(src, DecodeOptions::new())
    }

    /// Creates a new `Decoder` with the given [`DecodeOptions`].
    ///
    /// # Errors
    ///
    /// Fails if the parallelism is zero or the worker pool cannot be built.
    pub fn with_opts(src: S, opts: DecodeOptions) -> Result<Self> {
        let pool = opts.thread_pool()?;
        let cursor = ScanCursor {
            offset: 0,
            index: 0,
            format: opts.member_format(),
        };

        let start = Instant::now();
        let (batch, cursor) = scan_batch(src.as_ref(), cursor, &opts);
        let stats = DecodeStats {
            scan_time: start.elapsed(),
            ..Default::default()
        };

        Ok(Self {
            src,
            pool,
            opts,
            member_decoder: None,
            cursor,
            pending: Some(batch),
            failed: None,
            out_buf: Vec::new(),
            out_buf_pos: 0,
            stats,
        })
    }

    /// Decodes the next batch into the output buffer.
    ///
    /// Returns `false` once all members are decoded.
    fn fill(&mut self) -> Result<bool> {
        let Some(batch) = self.pending.take() else {
            return Ok(false);
        };
        if batch.members.is_empty() {
            return batch.error.map_or(Ok(false), Err);
        }

        let Some(format) = self.cursor.format else {
            unreachable!("format is known once a member was scanned");
        };
        let decoder = Arc::clone(
            self.member_decoder
                .get_or_insert_with(|| self.opts.member_decoder(format)),
        );

        let buf = self.src.as_ref();
        let jobs = batch
            .members
            .iter()
            .map(|m| Job::scanned(buf, m))
            .collect::<Vec<_>>();
        let scan_next = batch.error.is_none();
        let cursor = self.cursor;
        trace!(
            first = jobs[0].index,
            members = jobs.len(),
            "decoding batch"
        );

        let (pool, opts) = (&self.pool, &self.opts);
        let ((parts, decode_time), next) = pool.join(
            || {
                let start = Instant::now();
                let parts = decode_jobs(pool, decoder.as_ref(), &jobs);
                (parts, start.elapsed())
            },
            || {
                scan_next.then(|| {
                    let start = Instant::now();
                    let (batch, cursor) = scan_batch(buf, cursor, opts);
                    (batch, cursor, start.elapsed())
                })
            },
        );

        // Nothing after a failed member is decoded
        let parts = parts?;
        self.out_buf = parts.concat();
        self.out_buf_pos = 0;
        self.stats.merge(&DecodeStats {
            members: batch.members.len(),
            compressed_bytes: jobs.iter().map(|j| j.input.len() as u64).sum(),
            decompressed_bytes: self.out_buf.len() as u64,
            decode_time,
            ..Default::default()
        });

        self.pending = match next {
            Some((batch, cursor, scan_time)) => {
                self.cursor = cursor;
                self.stats.scan_time += scan_time;
                Some(batch)
            }
            // The scan error is reported after the members scanned before it
            None => Some(Batch {
                members: Vec::new(),
                error: batch.error,
            }),
        };

        Ok(true)
    }

    /// The statistics of everything decoded so far.
    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    /// The member format, once the first member was scanned.
    pub fn format(&self) -> Option<Format> {
        self.cursor.format
    }

    /// Gets a reference to the source.
    pub fn get_ref(&self) -> &S {
        &self.src
    }

    /// Consumes this decoder, returning the source.
    pub fn into_inner(self) -> S {
        self.src
    }
}

impl<S: AsRef<[u8]>> Read for Decoder<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(err) = &self.failed {
            return Err(io::Error::other(err.clone()));
        }

        while self.out_buf_pos == self.out_buf.len() {
            match self.fill() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(err) => {
                    self.failed = Some(err.clone());
                    return Err(io::Error::other(err));
                }
            }
        }

        let n = buf.len().min(self.out_buf.len() - self.out_buf_pos);
        buf[..n].copy_from_slice(&self.out_buf[self.out_buf_pos..self.out_buf_pos + n]);
        self.out_buf_pos += n;

        Ok(n)
    }
}
