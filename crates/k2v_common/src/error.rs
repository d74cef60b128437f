use std::sync::Arc;

use thiserror::Error;

/// Convenience alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error classification for callers deciding on retry.
///
/// - `Misuse`    — the caller broke the transaction contract; retrying the same call fails again
/// - `Transient` — I/O or a failed background task; the caller MAY retry
/// - `Fatal`     — on-disk state the engine refuses to interpret; needs an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Misuse,
    Transient,
    Fatal,
}

/// Errors raised by the generational store and its decorators.
///
/// `Clone` so that one physical failure can be handed, unchanged, to every
/// logical caller that shared the transaction which produced it.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The generation file ends before its header is complete.
    #[error("Generation truncated [{path}]: {detail}")]
    Truncated { path: String, detail: String },

    /// The generation file is present but cannot be interpreted.
    #[error("Generation corrupt [{path}]: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("Generation file missing: {0}")]
    MissingGeneration(String),

    /// Unexpected or missing files in the store directory.
    #[error("Store layout inconsistency: {0}")]
    Layout(String),

    #[error("Misuse: {0}")]
    Misuse(String),

    /// The generation was superseded and no longer accepts writers.
    #[error("Generation {0} is frozen")]
    Frozen(String),

    #[error("Batch rolled back: its last joiner closed without committing")]
    RolledBack,

    #[error("Background compaction failed: {0}")]
    Compaction(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

impl StoreError {
    pub fn misuse(msg: impl Into<String>) -> Self {
        StoreError::Misuse(msg.into())
    }

    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Misuse(_) | StoreError::Frozen(_) => ErrorKind::Misuse,
            StoreError::Io(_) | StoreError::RolledBack | StoreError::Compaction(_) => {
                ErrorKind::Transient
            }
            StoreError::Truncated { .. }
            | StoreError::Corrupt { .. }
            | StoreError::MissingGeneration(_)
            | StoreError::Layout(_) => ErrorKind::Fatal,
        }
    }

    /// True for the one condition the startup recovery ladder may step over.
    pub fn is_truncated(&self) -> bool {
        matches!(self, StoreError::Truncated { .. })
    }
}
