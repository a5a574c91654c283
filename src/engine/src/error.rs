//! Error types shared across the image engine.

use std::sync::Arc;

use thiserror::Error;

use crate::digest::Digest;

/// Errors produced while loading, building, or writing container images.
///
/// The registry variants (`Transport`, `Auth`, `NotFound`) are surfaced by
/// remote loaders; the engine itself never produces them but callers can
/// match on them to distinguish network failures from image-level ones.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// The input is not a usable OCI image layout archive.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// Streamed content did not hash to the digest that referenced it.
    #[error("content does not match digest {digest}")]
    DigestMismatch { digest: Digest },

    /// A manifest, index, or layer carries a media type the engine does not
    /// accept.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A structural constraint of the image spec was violated.
    #[error("{0}")]
    SchemaViolation(String),

    /// A tar entry path escapes the archive root.
    #[error("add {path}: entry outside of archive")]
    EntryOutsideArchive { path: String },

    /// A tar entry path collides with a previously written entry.
    #[error("add {path}: duplicate entry")]
    DuplicateEntry { path: String },

    /// An operation was attempted on a finished builder.
    #[error("builder closed")]
    BuilderClosed,

    /// An underlying reader or writer failed.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// A cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The registry could not be reached or answered outside the protocol.
    #[error("registry transport error: {0}")]
    Transport(String),

    /// The registry rejected our credentials (or the lack of them).
    #[error("registry authentication failed: {0}")]
    Auth(String),

    /// The registry does not know the requested manifest or blob.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> Self {
        ImageError::Io(Arc::new(err))
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ImageError>;
