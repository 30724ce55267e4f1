//! Domain types: change notifications, controllers and connection scopes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// --- Change events ---

/// Kind of remote mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A decoded notification that one or more entities of a model changed.
///
/// `ids` is an ordered set: never empty, no duplicates, first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChangeEvent", rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation: Operation,
    pub model: String,
    ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Identifier of the socket the event was received on, stamped by the
    /// receiving side so adapters can recognise their own echoes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_connection_id: Option<String>,
}

/// Wire shape of a change event before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeEvent {
    operation: Operation,
    model: String,
    ids: Vec<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    origin_connection_id: Option<String>,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = ProtocolError;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let mut event = ChangeEvent::new(raw.operation, raw.model, raw.ids)?;
        if let Some(ts) = raw.timestamp {
            event.timestamp = ts;
        }
        event.origin_connection_id = raw.origin_connection_id;
        Ok(event)
    }
}

impl ChangeEvent {
    /// Build an event stamped with the current time.
    pub fn new<I, S>(operation: Operation, model: impl Into<String>, ids: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = model.into();
        let mut unique: Vec<String> = Vec::new();
        for id in ids {
            let id = id.into();
            if !unique.contains(&id) {
                unique.push(id);
            }
        }

        if unique.is_empty() {
            return Err(ProtocolError::EmptyIds { model });
        }

        Ok(Self {
            operation,
            model,
            ids: unique,
            timestamp: Utc::now(),
            origin_connection_id: None,
        })
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Whether the event touches the entity with the given id.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|candidate| candidate == id)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_origin(mut self, connection_id: impl Into<String>) -> Self {
        self.origin_connection_id = Some(connection_id.into());
        self
    }

    /// True when the event was received on the given connection.
    pub fn is_from(&self, connection_id: &str) -> bool {
        self.origin_connection_id.as_deref() == Some(connection_id)
    }
}

// --- Controllers ---

/// HTTP verbs a controller can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Put,
    Post,
    Patch,
    Delete,
    Get,
    Options,
}

impl HttpMethod {
    /// Selection order for polymorphic endpoints: most specific verb first.
    pub const PRIORITY: [HttpMethod; 6] = [
        HttpMethod::Put,
        HttpMethod::Post,
        HttpMethod::Patch,
        HttpMethod::Delete,
        HttpMethod::Get,
        HttpMethod::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Get => "GET",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Pick the first verb of [`HttpMethod::PRIORITY`] present in `allowed`,
    /// falling back to GET.
    pub fn select(allowed: &[HttpMethod]) -> HttpMethod {
        Self::PRIORITY
            .into_iter()
            .find(|method| allowed.contains(method))
            .unwrap_or(HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of a backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerDefinition {
    pub name: String,
    /// Path template with `:name` / `:name?` placeholders.
    pub path: String,
    pub methods: Vec<HttpMethod>,
}

impl ControllerDefinition {
    pub fn new(name: impl Into<String>, path: impl Into<String>, methods: &[HttpMethod]) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            methods: methods.to_vec(),
        }
    }

    pub fn method(&self) -> HttpMethod {
        HttpMethod::select(&self.methods)
    }
}

// --- Scopes ---

/// A named persistent-connection context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Connection to the configured project's host.
    Project,
    /// Connection to the bare endpoint.
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project => f.write_str("project"),
            Scope::Global => f.write_str("global"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "project" => Ok(Scope::Project),
            "global" => Ok(Scope::Global),
            other => Err(ProtocolError::UnknownScope(other.to_string())),
        }
    }
}
