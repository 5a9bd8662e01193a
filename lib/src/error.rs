use std::{borrow::Cow, fmt::Display};

use zstd_safe::{ErrorCode, get_error_name};

/// A `Result` alias where the `Err` case is `concatz::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur when working with this crate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: Kind,
    location: Option<Location>,
}

/// The position of the member an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// The zero based index of the member.
    pub index: usize,
    /// The offset of the member start in the compressed buffer.
    pub offset: u64,
}

impl Error {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            location: None,
        }
    }

    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Kind::MalformedStream(reason.into()))
    }

    pub(crate) fn corrupt(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Kind::CorruptMember(reason.into()))
    }

    pub(crate) fn truncated() -> Self {
        Self::new(Kind::TruncatedMember)
    }

    pub(crate) fn worker_failure(msg: impl Into<String>) -> Self {
        Self::new(Kind::WorkerFailure(msg.into()))
    }

    pub(crate) fn invalid_parallelism() -> Self {
        Self::new(Kind::InvalidParallelism)
    }

    pub(crate) fn member_index_out_of_range() -> Self {
        Self::new(Kind::MemberIndexOutOfRange)
    }

    pub(crate) fn thread_pool(msg: impl Display) -> Self {
        Self::new(Kind::ThreadPool(msg.to_string()))
    }

    /// Attaches the member location to this error, keeping an already attached location.
    pub(crate) fn at_member(mut self, index: usize, offset: u64) -> Self {
        if self.location.is_none() {
            self.location = Some(Location { index, offset });
        }
        self
    }

    /// Whether a member header failed structural validation.
    pub fn is_malformed_stream(&self) -> bool {
        matches!(self.kind, Kind::MalformedStream(_))
    }

    /// Whether a member failed trailer or checksum validation.
    pub fn is_corrupt_member(&self) -> bool {
        matches!(self.kind, Kind::CorruptMember(_))
    }

    /// Whether the input ended before a member was complete.
    pub fn is_truncated_member(&self) -> bool {
        matches!(self.kind, Kind::TruncatedMember)
    }

    /// Whether a worker thread panicked while decoding a member.
    pub fn is_worker_failure(&self) -> bool {
        matches!(self.kind, Kind::WorkerFailure(_))
    }

    /// Whether the configured parallelism was zero.
    pub fn is_invalid_parallelism(&self) -> bool {
        matches!(self.kind, Kind::InvalidParallelism)
    }

    /// Whether a member index was out of range.
    pub fn is_member_index_out_of_range(&self) -> bool {
        matches!(self.kind, Kind::MemberIndexOutOfRange)
    }

    /// The location of the member this error refers to, if any.
    pub fn location(&self) -> Option<Location> {
        self.location
    }

    /// The index of the member this error refers to, if any.
    pub fn member_index(&self) -> Option<usize> {
        self.location.map(|l| l.index)
    }

    /// The compressed start offset of the member this error refers to, if any.
    pub fn offset(&self) -> Option<u64> {
        self.location.map(|l| l.offset)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::MalformedStream(reason) => write!(f, "malformed stream: {reason}")?,
            Kind::CorruptMember(reason) => write!(f, "corrupt member: {reason}")?,
            Kind::TruncatedMember => f.write_str("truncated member")?,
            Kind::WorkerFailure(msg) => write!(f, "worker failure: {msg}")?,
            Kind::InvalidParallelism => f.write_str("parallelism must be greater than zero")?,
            Kind::MemberIndexOutOfRange => f.write_str("member index out of range")?,
            Kind::ThreadPool(msg) => write!(f, "failed to build thread pool: {msg}")?,
            Kind::IO(err) => write!(f, "io error: {err}")?,
            Kind::Zstd(code) => f.write_str(get_error_name(*code))?,
        }

        if let Some(Location { index, offset }) = self.location {
            write!(f, " (member {index} at offset {offset})")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            Kind::IO(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(Kind::IO(value))
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self::new(Kind::Zstd(value))
    }
}

#[derive(Debug)]
enum Kind {
    /// A member header is invalid at the expected offset.
    MalformedStream(Cow<'static, str>),
    /// Checksum or trailer validation failed, or the compressed data is invalid.
    CorruptMember(Cow<'static, str>),
    /// The input ends before the member's end marker.
    TruncatedMember,
    /// A worker panicked.
    WorkerFailure(String),
    /// Parallelism of zero.
    InvalidParallelism,
    /// The passed member index is too large.
    MemberIndexOutOfRange,
    /// The worker pool could not be created.
    ThreadPool(String),
    /// IO error.
    IO(std::io::Error),
    /// An error from the zstd library.
    Zstd(ErrorCode),
}

impl Clone for Kind {
    fn clone(&self) -> Self {
        match self {
            Self::MalformedStream(reason) => Self::MalformedStream(reason.clone()),
            Self::CorruptMember(reason) => Self::CorruptMember(reason.clone()),
            Self::TruncatedMember => Self::TruncatedMember,
            Self::WorkerFailure(msg) => Self::WorkerFailure(msg.clone()),
            Self::InvalidParallelism => Self::InvalidParallelism,
            Self::MemberIndexOutOfRange => Self::MemberIndexOutOfRange,
            Self::ThreadPool(msg) => Self::ThreadPool(msg.clone()),
            // io::Error is not Clone, keep its kind and message
            Self::IO(err) => Self::IO(std::io::Error::new(err.kind(), err.to_string())),
            Self::Zstd(code) => Self::Zstd(*code),
        }
    }
}
