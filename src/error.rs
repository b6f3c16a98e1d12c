use thiserror::Error;

use crate::type_alias::*;

/// Errors of this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A pool is exhausted and has used up its retry budget.
    #[error("pool `{0}` is out of resources")]
    OutOfResource(String),

    /// A pool is momentarily empty; retry later.
    #[error("pool `{0}` is temporarily out of resources")]
    TempOutOfResource(String),

    #[error("path container has no free slot")]
    NoPathSlots,

    #[error("no active path reaches process {0}")]
    NoPath(ProcId),

    /// The message is bound to an inactive path and must be rebound.
    #[error("message bound to an inactive path")]
    BadPath,

    #[error("process {0} is unreachable over this path")]
    Unreachable(ProcId),

    #[error("corrupt {what}: expected checksum {expected:#010x}, computed {computed:#010x}")]
    CorruptData {
        what: &'static str,
        expected: u32,
        computed: u32,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("admin channel codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the failure is backpressure that a later retry may clear.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TempOutOfResource(_))
    }

    /// Whether the failure is pool exhaustion of either kind.
    #[inline]
    pub fn is_resource(&self) -> bool {
        matches!(self, Error::TempOutOfResource(_) | Error::OutOfResource(_))
    }

    fn category(&self) -> &'static str {
        match self {
            Error::OutOfResource(_) | Error::TempOutOfResource(_) => "out of resource",
            Error::NoPathSlots | Error::NoPath(_) | Error::BadPath | Error::Unreachable(_) => {
                "routing"
            }
            Error::CorruptData { .. } => "data corruption",
            Error::Protocol(_) => "protocol",
            Error::Setup(_) | Error::Codec(_) | Error::Io(_) => "fabric",
            Error::Fatal(_) => "fatal",
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Escalate `err` to a fatal error of process `rank`.
///
/// With `abort` set the process prints a diagnostic and exits; otherwise the
/// error is returned as [`Error::Fatal`] for the caller to propagate.
#[cold]
pub(crate) fn fatal(rank: ProcId, abort: bool, err: Error) -> Error {
    log::error!("[rank {}] {} error: {}", rank, err.category(), err);
    if abort {
        eprintln!("[rank {}] aborting: {}", rank, err);
        std::process::exit(1);
    }
    Error::Fatal(format!("[rank {}] {}", rank, err))
}

pub type Result<T> = std::result::Result<T, Error>;
