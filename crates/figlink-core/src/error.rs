use crate::identity::IdentityError;
use crate::wire::FrameError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no route for '{kind}' under token '{token}'")]
    RouteNotFound { token: String, kind: String },
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("invalid connection identifier: {0}")]
    InvalidIdentifier(#[from] IdentityError),
    #[error("no channel joined; join a channel before sending commands")]
    NoChannel,
    #[error("not connected to the hub")]
    NotConnected,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("gave up after {attempts} reconnection attempts")]
    RetriesExhausted { attempts: u32 },
}

impl RelayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::RequestTimeout { .. })
    }
}

impl From<FrameError> for RelayError {
    fn from(err: FrameError) -> Self {
        RelayError::ProtocolError(err.to_string())
    }
}
