//! Shared error types: structured server errors and protocol violations.

use serde::{Deserialize, Serialize};

/// Fallback message when an error response carries nothing readable.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Structured error decoded from a non-2xx HTTP response, or raised for a
/// network failure before any response arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "unknown_message")]
    pub message: String,
    /// HTTP status of the response this error was decoded from.
    #[serde(skip)]
    pub status: Option<u16>,
}

fn unknown_message() -> String {
    UNKNOWN_ERROR.to_string()
}

/// Envelope of JSON error bodies: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ClientError>,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_ERROR)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Decode an error response according to its declared content type:
    /// JSON bodies yield the `error` field, plain text becomes the message,
    /// anything else is an opaque "Unknown error".
    pub fn from_response(status: u16, content_type: Option<&str>, body: &[u8]) -> Self {
        let content_type = content_type.unwrap_or_default();

        let error = if content_type.contains("application/json") {
            serde_json::from_slice::<ErrorBody>(body)
                .ok()
                .and_then(|parsed| parsed.error)
                .unwrap_or_else(Self::unknown)
        } else if content_type.contains("text/plain") {
            Self::new(String::from_utf8_lossy(body).into_owned())
        } else {
            Self::unknown()
        };

        error.with_status(status)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, self.status) {
            (Some(code), Some(status)) => write!(f, "[{} {}] {}", status, code, self.message),
            (Some(code), None) => write!(f, "[{}] {}", code, self.message),
            (None, Some(status)) => write!(f, "[{}] {}", status, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ClientError {}

/// Violations of the realtime protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("change event for model `{model}` carries no ids")]
    EmptyIds { model: String },
    #[error("unknown socket scope `{0}`")]
    UnknownScope(String),
}
