//! Error types for the sync engine.

use meshkv_sync_protocol::{CodecError, RecvCode};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync engine.
///
/// Storage and codec failures are carried through, never thrown past the
/// engine boundary; the state machine only looks at [`SyncError::outcome`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage is locked; the caller may retry after backoff.
    #[error("storage busy")]
    Busy,

    /// An expected ack or peer message did not arrive in time.
    #[error("operation timed out")]
    Timeout,

    /// Malformed packet or out-of-range time.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The peer's table shape diverged; the task aborts and a schema
    /// resync is required before retrying.
    #[error("peer schema changed")]
    SchemaChanged,

    /// No schema exists for the requested query.
    #[error("schema not found")]
    SchemaNotFound,

    /// First-ever sync with this peer; an ability handshake is required.
    #[error("peer metadata not found")]
    NotFound,

    /// Peer security label incompatible; permanent reject for this pairing.
    #[error("security option check failed")]
    SecurityCheck,

    /// Request exceeds the peer's limits.
    #[error("over max limits")]
    OverMaxLimits,

    /// Operation outside the peer's capabilities.
    #[error("not supported by peer")]
    NotSupport,

    /// Packet could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The communicator failed to deliver a message.
    #[error("communicator error: {message}")]
    Communicator {
        /// Error message.
        message: String,
        /// Whether delivery can be retried.
        retryable: bool,
    },

    /// Storage adapter failure outside the taxonomy above.
    #[error("storage error: {0}")]
    Storage(String),

    /// The task was cancelled while the operation was in flight.
    #[error("sync task cancelled")]
    Cancelled,
}

/// Tri-state the state machine derives from a raw error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Operation succeeded.
    Ok,
    /// Transient failure; retry with the same time range.
    Retry,
    /// Permanent for this task; abort without poisoning future tasks.
    Abort,
}

impl SyncError {
    /// Creates a retryable communicator error.
    pub fn comm_retryable(message: impl Into<String>) -> Self {
        Self::Communicator {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable communicator error.
    pub fn comm_fatal(message: impl Into<String>) -> Self {
        Self::Communicator {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the same operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Busy | SyncError::Timeout => true,
            SyncError::Communicator { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Collapses the error into the tri-state the state machine acts on.
    pub fn outcome(&self) -> TaskOutcome {
        if self.is_retryable() {
            TaskOutcome::Retry
        } else {
            TaskOutcome::Abort
        }
    }

    /// Maps a negative ack code from the wire into an engine error.
    pub fn from_recv_code(code: RecvCode) -> Option<Self> {
        match code {
            RecvCode::Ok | RecvCode::WaterMarkInvalid => None,
            RecvCode::Busy => Some(SyncError::Busy),
            RecvCode::InvalidArgs => Some(SyncError::InvalidArgs("peer rejected packet".into())),
            RecvCode::SchemaChanged => Some(SyncError::SchemaChanged),
            RecvCode::SchemaNotFound => Some(SyncError::SchemaNotFound),
            RecvCode::NotFound => Some(SyncError::NotFound),
            RecvCode::SecurityCheckFailed => Some(SyncError::SecurityCheck),
            RecvCode::NotSupport => Some(SyncError::NotSupport),
            RecvCode::OverMaxLimits => Some(SyncError::OverMaxLimits),
        }
    }

    /// Maps an engine error to the ack code reported to the peer.
    pub fn to_recv_code(&self) -> RecvCode {
        match self {
            SyncError::Busy | SyncError::Timeout => RecvCode::Busy,
            SyncError::SchemaChanged => RecvCode::SchemaChanged,
            SyncError::SchemaNotFound => RecvCode::SchemaNotFound,
            SyncError::NotFound => RecvCode::NotFound,
            SyncError::SecurityCheck => RecvCode::SecurityCheckFailed,
            SyncError::OverMaxLimits => RecvCode::OverMaxLimits,
            SyncError::NotSupport => RecvCode::NotSupport,
            _ => RecvCode::InvalidArgs,
        }
    }
}
