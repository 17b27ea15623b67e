//! Error taxonomy for the core engine.
//!
//! Mirrors the layering of the teacher's `CvmfsError`: one flat enum, one
//! `#[error(...)]` message per variant, and `From` impls at the I/O boundary
//! so `?` works end to end without manual wrapping.

use std::fmt::Debug;

pub type CoreResult<R> = Result<R, CoreError>;

/// Errors surfaced by the chunk codec, object store, branch/journal manager
/// and node cache.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Cipher rejected ciphertext, or a journal frame failed to decrypt, or
    /// a journal hash-chain link did not match its predecessor.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Well-authenticated bytes failed schema decoding, or a varint was
    /// truncated or oversized.
    #[error("decoding failed: {0}")]
    Decoding(String),

    /// A named branch or reference does not exist.
    #[error("unknown name: {0}")]
    UnknownName(String),

    /// Attempt to create a branch whose head file is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A failure from the backing filesystem.
    #[error("I/O error: {0}")]
    Io(String),

    /// Malformed filename-encoded digest.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Catch-all for conditions that don't belong to the taxonomy above.
    #[error("{0}")]
    Generic(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::UnknownName(e.to_string()),
            _ => CoreError::Io(e.to_string()),
        }
    }
}

impl From<String> for CoreError {
    fn from(value: String) -> Self {
        CoreError::Generic(value)
    }
}

impl From<&str> for CoreError {
    fn from(value: &str) -> Self {
        CoreError::Generic(value.to_string())
    }
}
