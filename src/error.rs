//! Error types shared across the index.
//!
//! Every fallible public operation returns [`Result`]. The variants mirror the
//! distinct failure classes of the index: caller mistakes
//! ([`IndexError::InvalidArgument`]), broken internal assumptions
//! ([`IndexError::InvariantViolation`]), unreadable files
//! ([`IndexError::Format`]), plain I/O failures ([`IndexError::Io`]), and
//! lookups of ordinals that were never inserted ([`IndexError::NotFound`]).
//!
//! A search that runs out of its visit budget is *not* an error: it returns a
//! partial [`crate::search::SearchResult`] flagged incomplete. The
//! [`IndexError::ResourceExhausted`] variant exists for callers that want to
//! convert that flag into a hard failure at their own boundary.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IndexError>;

/// The error type for all index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Malformed parameters: non-positive degree or beam width, a query whose
    /// dimension does not match the index, a similarity unsupported by the
    /// requested scoring path, and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal assumption was broken, e.g. cleanup ran while inserts were
    /// in flight, or an ordinal mapper was asked about an ordinal outside its
    /// domain. These indicate a programming error in the caller or the crate.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The on-disk layout could not be understood: bad magic, an unsupported
    /// version, a feature bitmap referencing an unknown feature, or a file
    /// whose length disagrees with its own header.
    #[error("format error: {0}")]
    Format(String),

    /// An underlying read or write failed; surfaced as-is.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A budgeted operation hit its limit. Searches report this condition via
    /// the `incomplete` flag on their result instead of returning this.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The given ordinal is not present in the graph.
    #[error("ordinal {0} not found")]
    NotFound(u32),
}

impl IndexError {
    /// Shorthand for an [`IndexError::InvalidArgument`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        IndexError::InvalidArgument(msg.into())
    }

    /// Shorthand for an [`IndexError::InvariantViolation`] with a formatted message.
    pub fn invariant(msg: impl Into<String>) -> Self {
        IndexError::InvariantViolation(msg.into())
    }

    /// Shorthand for an [`IndexError::Format`] with a formatted message.
    pub fn format(msg: impl Into<String>) -> Self {
        IndexError::Format(msg.into())
    }
}
