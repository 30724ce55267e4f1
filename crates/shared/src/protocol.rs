//! Wire protocol: WebSocket frames, handshake parameters and path templates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::ChangeEvent;

/// Query parameter carrying the access credential in the socket handshake.
pub const QUERY_ACCESS_TOKEN: &str = "accessToken";
/// Query parameter carrying the project identifier in the socket handshake.
pub const QUERY_PROJECT: &str = "project";

/// Frames sent by the client over the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Replace the set of models this connection receives events for.
    /// The payload is the comma-joined list of model slugs.
    #[serde(rename = "subscribeModels")]
    SubscribeModels(String),
}

impl ClientCommand {
    pub fn subscribe_models<S: AsRef<str>>(models: &[S]) -> Self {
        let joined = models.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        ClientCommand::SubscribeModels(joined)
    }
}

/// Frames sent by the server over the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    #[serde(rename = "realtime:event")]
    RealtimeEvent(ChangeEvent),
    #[serde(rename = "info")]
    Info { message: String },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Split a `subscribeModels` payload back into slugs.
pub fn parse_model_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|slug| !slug.is_empty())
        .map(str::to_string)
        .collect()
}

/// Credentials embedded in the socket handshake URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub access_token: String,
    pub project: Option<String>,
}

impl HandshakeParams {
    pub fn to_query_string(&self) -> String {
        let mut query = format!(
            "{}={}",
            QUERY_ACCESS_TOKEN,
            urlencoding::encode(&self.access_token)
        );
        if let Some(project) = &self.project {
            query.push_str(&format!("&{}={}", QUERY_PROJECT, urlencoding::encode(project)));
        }
        query
    }
}

/// Substitute `:name` and `:name?` placeholders in a controller path.
///
/// Values are percent-encoded. A placeholder without a (non-empty) value
/// renders as the empty string, whether or not it is marked optional.
pub fn render_path(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ':' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if name.is_empty() {
            out.push(':');
            continue;
        }

        if chars.peek() == Some(&'?') {
            chars.next();
        }

        if let Some(value) = params.get(&name).filter(|v| !v.is_empty()) {
            out.push_str(&encode_component(value));
        }
    }

    out
}

/// Percent-encode a path segment, leaving the URI mark characters
/// `! * ' ( )` as they are.
fn encode_component(value: &str) -> String {
    urlencoding::encode(value)
        .replace("%21", "!")
        .replace("%2A", "*")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
}
