//! Client configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use modelsync_shared::{HandshakeParams, Scope};
use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_SOCKET_PATH: &str = "/ws";

/// Settings of the realtime engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeOptions {
    /// How long a socket may take to acknowledge the handshake.
    pub connect_timeout: Duration,
    /// Models subscribed on the project scope at startup.
    pub subscribe_models: Vec<String>,
    /// Subscribe every model registered on the client.
    pub auto_subscribe: bool,
    /// Follow option changes, connecting and disconnecting scopes as the
    /// credential comes and goes.
    pub auto_connect: bool,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_models: Vec::new(),
            auto_subscribe: false,
            auto_connect: true,
        }
    }
}

/// Options shared by the request executor and the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Backend host, without scheme (e.g. `api.example.com`).
    pub endpoint: String,
    /// Project identifier; project traffic goes to `{project}.{endpoint}`.
    pub project: Option<String>,
    pub ssl: bool,
    pub access_token: Option<String>,
    /// Retries allowed after the first attempt. `0` means a single attempt,
    /// not an unlimited budget.
    pub max_retries: u32,
    /// Headers added to every request.
    pub headers: BTreeMap<String, String>,
    /// Scopes that should hold a persistent connection.
    pub sockets: Vec<Scope>,
    pub socket_path: String,
    pub realtime: RealtimeOptions,
}

impl ClientOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            project: None,
            ssl: true,
            access_token: None,
            max_retries: DEFAULT_MAX_RETRIES,
            headers: BTreeMap::new(),
            sockets: vec![Scope::Project],
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            realtime: RealtimeOptions::default(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_sockets(mut self, sockets: &[Scope]) -> Self {
        self.sockets = sockets.to_vec();
        self
    }

    pub fn with_realtime(mut self, realtime: RealtimeOptions) -> Self {
        self.realtime = realtime;
        self
    }

    /// Read options from environment variables.
    ///
    /// Environment variables:
    /// - `MODELSYNC_ENDPOINT`: backend host (default: "localhost:8080")
    /// - `MODELSYNC_PROJECT`: project identifier (default: none)
    /// - `MODELSYNC_ACCESS_TOKEN`: access credential (default: none)
    /// - `MODELSYNC_SSL`: "true" | "false" (default: "true")
    /// - `MODELSYNC_MAX_RETRIES`: retry budget per operation (default: 3)
    /// - `MODELSYNC_SOCKETS`: comma-separated scopes (default: "project")
    /// - `MODELSYNC_CONNECT_TIMEOUT_MS`: handshake timeout (default: 5000)
    pub fn from_env() -> Self {
        let endpoint =
            std::env::var("MODELSYNC_ENDPOINT").unwrap_or_else(|_| "localhost:8080".to_string());
        let mut options = Self::new(endpoint);

        options.project = non_empty_var("MODELSYNC_PROJECT");
        options.access_token = non_empty_var("MODELSYNC_ACCESS_TOKEN");

        if let Some(ssl) = non_empty_var("MODELSYNC_SSL") {
            options.ssl = !matches!(ssl.to_lowercase().as_str(), "false" | "0" | "no");
        }

        if let Some(max_retries) = non_empty_var("MODELSYNC_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            options.max_retries = max_retries;
        }

        if let Some(sockets) = non_empty_var("MODELSYNC_SOCKETS") {
            options.sockets = sockets
                .split(',')
                .filter_map(|scope| match scope.parse::<Scope>() {
                    Ok(scope) => Some(scope),
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring socket scope");
                        None
                    }
                })
                .collect();
        }

        if let Some(ms) = non_empty_var("MODELSYNC_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            options.realtime.connect_timeout = Duration::from_millis(ms);
        }

        options
    }

    /// The access credential, if one is set and non-empty.
    pub fn credential(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|token| !token.is_empty())
    }

    fn host(&self) -> String {
        match &self.project {
            Some(project) if !project.is_empty() => format!("{}.{}", project, self.endpoint),
            _ => self.endpoint.clone(),
        }
    }

    /// Base URL for HTTP requests.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.ssl { "https" } else { "http" };
        Ok(Url::parse(&format!("{}://{}", scheme, self.host()))?)
    }

    /// Handshake URL for the persistent connection of a scope.
    pub fn socket_url(&self, scope: Scope) -> Result<Url> {
        let access_token = self.credential().ok_or(Error::MissingCredential)?.to_string();
        let scheme = if self.ssl { "wss" } else { "ws" };

        let host = match scope {
            Scope::Project => {
                if self.project.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::MissingProject);
                }
                self.host()
            }
            Scope::Global => self.endpoint.clone(),
        };

        let params = HandshakeParams {
            access_token,
            project: self.project.clone(),
        };

        Ok(Url::parse(&format!(
            "{}://{}{}?{}",
            scheme,
            host,
            self.socket_path,
            params.to_query_string()
        ))?)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ClientOptions::new("api.example.com");
        assert!(options.ssl);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.sockets, vec![Scope::Project]);
        assert_eq!(options.realtime.connect_timeout, Duration::from_millis(5000));
        assert!(options.realtime.auto_connect);
        assert_eq!(options.credential(), None);
    }

    #[test]
    fn base_url_uses_project_subdomain() {
        let options = ClientOptions::new("api.example.com");
        assert_eq!(options.base_url().unwrap().as_str(), "https://api.example.com/");

        let options = options.with_project("acme").with_ssl(false);
        assert_eq!(options.base_url().unwrap().as_str(), "http://acme.api.example.com/");
    }

    #[test]
    fn socket_url_embeds_handshake() {
        let options = ClientOptions::new("api.example.com")
            .with_project("acme")
            .with_access_token("secret");

        let url = options.socket_url(Scope::Project).unwrap();
        assert_eq!(url.as_str(), "wss://acme.api.example.com/ws?accessToken=secret&project=acme");

        let url = options.socket_url(Scope::Global).unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
    }

    #[test]
    fn socket_url_requirements() {
        let options = ClientOptions::new("api.example.com");
        assert!(matches!(options.socket_url(Scope::Global), Err(Error::MissingCredential)));

        let options = options.with_access_token("");
        assert!(matches!(options.socket_url(Scope::Global), Err(Error::MissingCredential)));

        let options = options.with_access_token("secret");
        assert!(matches!(options.socket_url(Scope::Project), Err(Error::MissingProject)));
        assert!(options.socket_url(Scope::Global).is_ok());
    }
}
