//! Module `error` collects every failure mode the engine can surface.
//!
//! Following the rest of this crate, `Error` carries a human-readable
//! string payload rather than leaning on a derive-macro crate: every
//! variant here is something a caller is expected to match on, not just
//! print, so the payload is context for a log line or a bug report.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The allocator refused a page request. Once this is returned by
    /// `Storage::apply_transaction`, the blob it was raised against has
    /// already been marked immutable and every later call returns the
    /// same error.
    InsufficientResources(String),
    /// An invariant the engine relies on internally was violated. These
    /// are bugs, not user errors; callers should not try to recover.
    Invariant(String),
    /// A version counter or offset would overflow its storage.
    VersionOverflow(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InsufficientResources(msg) => {
                write!(f, "insufficient resources: {}", msg)
            }
            Error::Invariant(msg) => write!(f, "invariant violation: {}", msg),
            Error::VersionOverflow(msg) => write!(f, "version overflow: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of `Storage::apply_transaction`.
///
/// Deliberately not folded into `Error`: `AppliedWithNoEffect` is a
/// steady-state result (a failed `require_*` precondition), not a bug
/// or a resource failure, and callers branch on it routinely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    /// The transaction's mutations are now visible at the returned version.
    Applied { version: u64 },
    /// A `require_*` precondition failed. The storage version still
    /// advanced (so replicated deployments stay deterministic) but no
    /// key or subkey was mutated.
    AppliedWithNoEffect { version: u64 },
    /// The allocator could not supply enough pages either to extend the
    /// current blob or to build a merged replacement. The storage is now
    /// permanently wedged: every subsequent `apply_transaction` call will
    /// return this same variant.
    FailedDueToInsufficientResources,
}
