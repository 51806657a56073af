use thiserror::Error;

/// A convenience `Result` alias using [`ResumoError`].
pub type ResumoResult<T> = Result<T, ResumoError>;

/// Why a byte sequence could not be decoded into a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The input ends in the middle of a frame.
    Truncated,
    /// A frame is complete but its length, checksum or payload is invalid.
    Malformed,
    /// The header announces a format version this build cannot read.
    VersionUnsupported,
}

/// A decode failure. Decoding never yields a partially populated record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {detail}")]
pub struct DecodeError {
    /// The failure class.
    pub kind: DecodeErrorKind,
    /// Human-readable context (offset, frame index, cause).
    pub detail: String,
}

impl DecodeError {
    /// A frame ends before its declared length.
    pub fn truncated(detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::Truncated,
            detail: detail.into(),
        }
    }

    /// A frame is structurally invalid.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::Malformed,
            detail: detail.into(),
        }
    }

    /// The record was written by a newer format.
    pub fn version_unsupported(found: u32, supported: u32) -> Self {
        Self {
            kind: DecodeErrorKind::VersionUnsupported,
            detail: format!("format version {found} (this build reads up to {supported})"),
        }
    }
}

/// Top-level error type for the Resumo engine.
///
/// Each variant corresponds to a failure class the caller can act on differently:
/// create a new session, wait and retry, or recover the record administratively.
#[derive(Error, Debug)]
pub enum ResumoError {
    /// No session exists for the identifier.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// A session already exists for the identifier.
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// Another writer holds the session's exclusive lock.
    #[error("Session is locked by another writer: {0}")]
    SessionLocked(String),

    /// The session was administratively closed and cannot be resumed.
    #[error("Session is closed: {0}")]
    Closed(String),

    /// Stored content exists but fails its integrity checks.
    #[error("Corrupt session {id}: {reason}")]
    Corrupt {
        /// The affected session.
        id: String,
        /// What failed.
        reason: String,
    },

    /// A byte sequence failed to decode.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The conversational channel failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The underlying filesystem failed (disk full, permissions, ...).
    #[error("Storage IO error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// A JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration or identifier.
    #[error("Config error: {0}")]
    Config(String),

    /// The operation is not legal in the controller's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ResumoError {
    /// Whether retrying the same storage operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ResumoError::StorageIo(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
