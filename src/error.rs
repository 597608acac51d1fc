//! Error types for the sync core.
//!
//! Nothing in the reconciliation path is fatal: network and server failures
//! are turned into offline fallbacks or left-pending queue rows by the
//! callers. The variants here exist so those callers can tell the cases
//! apart (and so local storage failures, the one thing that must surface,
//! carry a useful message).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Local SQLite failure (open, migrate, read, write).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Transport-level HTTP failure (connect, DNS, timeout, TLS).
    #[error("{0}")]
    Http(String),

    /// The server answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    /// The server answered 2xx but the body was not what we expected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// An update or delete was routed without an `id`/`_id` on the payload.
    #[error("payload for {collection} {kind} has no id")]
    MissingId {
        collection: &'static str,
        kind: &'static str,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The database mutex was poisoned by a panicking holder.
    #[error("database lock poisoned: {0}")]
    Lock(String),
}

impl CoreError {
    /// True for failures that mean "the server could not be talked to",
    /// as opposed to local problems.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CoreError::Http(_) | CoreError::Status { .. } | CoreError::InvalidResponse(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
