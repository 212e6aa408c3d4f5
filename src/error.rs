//! Error types for `rwdx`.
//!
//! This module provides a unified error type for all index, dictionary, and
//! store operations. Error codes follow the pattern `RWDX-XXX` for easy
//! debugging.

use thiserror::Error;

/// Result type alias for `rwdx` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `rwdx` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Dictionary lookup for an unknown name/id (RWDX-001).
    ///
    /// Not a hard failure for the query evaluator: a missing term degrades
    /// to "contributes no posting" rather than aborting the query.
    #[error("[RWDX-001] not found: {0}")]
    NotFound(String),

    /// Ingest called after `seal()` (RWDX-002).
    ///
    /// A programming error: the caller is responsible for not mutating a
    /// sealed index.
    #[error("[RWDX-002] ingest attempted after seal")]
    SealedViolation,

    /// The file does not start with the `RWDX` magic (RWDX-003).
    #[error("[RWDX-003] bad magic: expected RWDX container")]
    BadMagic,

    /// The file declares a version this build does not understand (RWDX-004).
    #[error("[RWDX-004] unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// The file's directory or section bytes are internally inconsistent (RWDX-005).
    #[error("[RWDX-005] corrupt file: {0}")]
    CorruptFile(String),

    /// Underlying file I/O failure during load or save (RWDX-006).
    #[error("[RWDX-006] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration failed validation (RWDX-007).
    #[error("[RWDX-007] configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the error code (e.g., "RWDX-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "RWDX-001",
            Self::SealedViolation => "RWDX-002",
            Self::BadMagic => "RWDX-003",
            Self::UnsupportedVersion(_) => "RWDX-004",
            Self::CorruptFile(_) => "RWDX-005",
            Self::Io(_) => "RWDX-006",
            Self::Config(_) => "RWDX-007",
        }
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
