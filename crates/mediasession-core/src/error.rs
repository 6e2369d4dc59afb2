//! Error taxonomy for session negotiation.

use std::fmt;

use thiserror::Error;

/// An asynchronous wait that can time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LocalDescription,
    Signaling,
    RemoteDescription,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::LocalDescription => "local description",
            Step::Signaling => "signaling response",
            Step::RemoteDescription => "remote description",
        };
        f.write_str(name)
    }
}

/// Failures of the request/response exchange itself. HTTP-level failures
/// and unparseable bodies land here so callers see one category.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("error in HTTP request: status {0}")]
    Status(u16),

    #[error("no valid JSON-RPC response: {0}")]
    MalformedBody(String),

    #[error("response id {got} does not match request {expected}")]
    UnexpectedId { expected: u64, got: u64 },
}

/// Why a negotiation failed. Delivered to the exception handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("error in JSON-RPC response: {message} ({code})")]
    Protocol { code: i64, message: String },

    #[error("local media error: {0}")]
    LocalMedia(String),

    #[error("timed out waiting for {0}")]
    Timeout(Step),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    LocalMedia,
    Timeout,
}

impl SessionError {
    pub fn local_media(msg: impl fmt::Display) -> Self {
        Self::LocalMedia(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Protocol { .. } => ErrorKind::Protocol,
            SessionError::LocalMedia(_) => ErrorKind::LocalMedia,
            SessionError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}
