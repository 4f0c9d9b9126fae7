//! Error types for the fossilite crate.
//!
//! One enum covers failures from the blob store, the manifest codec, the crosslink
//! projector, the check-in engine, and the backoffice scheduler. Callers that need to
//! distinguish "normal, expected" conditions (not found, conflict) from corruption or
//! I/O failure match on the variant; everything else just displays.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FossilError {
    /// Caller supplied arguments that don't make sense together (e.g. both `--all` and
    /// an explicit file list to a partial check-in).
    #[error("usage error: {0}")]
    Usage(String),

    /// A requested row (blob, check-in, tag, user) does not exist in the catalog.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name or prefix resolved to more than one artifact.
    #[error("ambiguous: {0}")]
    Ambiguous(String),

    /// A guard in §4.4 rejected the operation (fork, closed leaf, younger-than-ancestor,
    /// empty commit, unknown user).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A delta chain, checksum, or card ordering invariant was violated on read.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The backoffice lease for this repository is held by another live process.
    #[error("backoffice is busy")]
    BackofficeBusy,

    /// Interactive warning policy rejected the check-in (binary/CRLF/non-UTF8 content,
    /// user declined).
    #[error("check-in aborted by warning policy: {0}")]
    WarningDeclined(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("{0}")]
    Custom(String),
}
