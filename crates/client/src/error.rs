//! Client error type.

use std::time::Duration;

use modelsync_shared::{ClientError, ProtocolError};

/// Everything the client can fail with.
///
/// `Clone` so a single connect outcome can be shared by every caller
/// awaiting it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Network failure or non-2xx response.
    #[error("transport error: {0}")]
    Transport(#[from] ClientError),
    #[error("too many retries (attempt {attempt}, limit {max_retries})")]
    TooManyRetries { attempt: u32, max_retries: u32 },
    #[error("execution has been aborted")]
    ExecutionAborted,
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("an access token is required to open a socket")]
    MissingCredential,
    #[error("a project is required for the project socket scope")]
    MissingProject,
    #[error("hook is already registered")]
    DuplicateHook,
    #[error("model `{0}` is already registered with a different record type")]
    ModelTypeMismatch(String),
    #[error("hook failed: {0}")]
    Hook(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("connection closed")]
    Disconnected,
}

impl Error {
    pub fn hook(message: impl Into<String>) -> Self {
        Error::Hook(message.into())
    }

    /// The structured server error, when this is a transport failure.
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
