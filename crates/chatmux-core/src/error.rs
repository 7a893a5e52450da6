use thiserror::Error;

use crate::status::ConnectionStatus;

/// Errors produced by the session connection layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The protocol transport could not be constructed or failed to open.
    #[error("transport init failed: {0}")]
    TransportInit(String),

    /// An operation that needs a connected session was called in another state.
    #[error("session {session_id} not ready (status: {status})")]
    NotReady {
        session_id: String,
        status: ConnectionStatus,
    },

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// A live transport reported a failure (send, end).
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection attempt was replaced or cleaned up while it was opening.
    #[error("connection attempt for {0} was superseded")]
    Superseded(String),

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("status mirror error: {0}")]
    Mirror(String),

    /// Raised by the sweeper when it evicts a record.
    #[error("stale session {session_id}: {reason}")]
    Stale { session_id: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SessionError {
    /// Whether the caller can recover by polling status and retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::NotReady { .. } | SessionError::Timeout | SessionError::Superseded(_)
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
