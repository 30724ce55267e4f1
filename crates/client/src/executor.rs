//! Request execution: builds requests from controller definitions, runs them
//! through the hook pipeline and decides between returning, retrying and
//! failing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use modelsync_shared::{render_path, ClientError, ControllerDefinition, HttpMethod};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use url::Url;

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::hooks::{HookError, HookPayload, HookRegistry, Phase};
use crate::transaction::{Outcome, Transaction};

/// A request as seen (and rewritten) by hooks.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| Error::InvalidHeader(name.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader(name.to_string()))?;
        self.headers.insert(name, value);
        Ok(())
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON; an empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Ok(serde_json::from_str("null")?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn to_client_error(&self) -> ClientError {
        ClientError::from_response(self.status, self.content_type(), &self.body)
    }
}

/// The wire. Failing here means no response at all (DNS, TLS, reset...).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<Response>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<Response> {
        let method = match request.method {
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        };

        let mut rb = self
            .client
            .request(method, request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            rb = rb.body(body.clone());
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| Error::Transport(ClientError::new(e.to_string())))?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(ClientError::new(format!("failed to read body: {e}"))))?;

        Ok(Response {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Per-call parameters of [`RequestExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Values for the controller's path placeholders.
    pub path: HashMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// Overrides the client's retry budget.
    pub max_retries: Option<u32>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Runs controllers through the hook pipeline.
#[derive(Clone)]
pub struct RequestExecutor {
    hooks: Arc<HookRegistry>,
    transport: Arc<dyn HttpTransport>,
    options: watch::Receiver<ClientOptions>,
}

impl RequestExecutor {
    pub fn new(
        hooks: Arc<HookRegistry>,
        transport: Arc<dyn HttpTransport>,
        options: watch::Receiver<ClientOptions>,
    ) -> Self {
        Self {
            hooks,
            transport,
            options,
        }
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Build the request for one attempt from the current options.
    pub fn build_request(&self, controller: &ControllerDefinition, opts: &ExecuteOptions) -> Result<OutboundRequest> {
        let options = self.options.borrow().clone();

        let path = render_path(&controller.path, &opts.path);
        let mut url = options.base_url()?.join(&path)?;
        if !opts.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &opts.query {
                pairs.append_pair(name, value);
            }
        }

        let mut request = OutboundRequest::new(controller.method(), url);
        for (name, value) in options.headers.iter().chain(opts.headers.iter()) {
            request.set_header(name, value)?;
        }

        if let Some(body) = &opts.body {
            request.body = Some(serde_json::to_vec(body)?);
            if !request.headers.contains_key(CONTENT_TYPE) {
                request
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }

        Ok(request)
    }

    /// Execute a controller as a new operation.
    pub async fn execute(&self, controller: &ControllerDefinition, opts: ExecuteOptions) -> Result<Response> {
        let mut transaction = Transaction::new();
        self.execute_in(controller, &opts, &mut transaction).await
    }

    /// Execute a controller and decode the successful body as JSON.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        controller: &ControllerDefinition,
        opts: ExecuteOptions,
    ) -> Result<T> {
        self.execute(controller, opts).await?.json()
    }

    /// Execute within an existing transaction; every attempt counts against
    /// its retry budget.
    pub async fn execute_in(
        &self,
        controller: &ControllerDefinition,
        opts: &ExecuteOptions,
        transaction: &mut Transaction,
    ) -> Result<Response> {
        let max_retries = opts
            .max_retries
            .unwrap_or_else(|| self.options.borrow().max_retries);

        loop {
            let attempt = transaction.begin_attempt(max_retries)?;
            let request = self.build_request(controller, opts)?;

            tracing::debug!(
                controller = %controller.name,
                attempt,
                method = %request.method,
                url = %request.url,
                "executing request"
            );

            let mut payload = HookPayload::new(controller.name.clone(), request, *transaction);

            self.hooks.run_phase(Phase::BeforeRequest, &mut payload).await?;
            match transaction.resolve(std::mem::take(&mut payload.err)) {
                Outcome::Proceed => {}
                Outcome::Retry => {
                    tracing::debug!(controller = %controller.name, attempt, "retry requested before request");
                    continue;
                }
                Outcome::Fail(err) => return Err(err),
            }

            match self.transport.send(&payload.request).await {
                Ok(response) => {
                    if !response.is_success() {
                        let err = response.to_client_error();
                        tracing::debug!(controller = %controller.name, status = response.status, error = %err, "request failed");
                        payload.err.push(HookError::Failure(Error::Transport(err)));
                    }
                    payload.response = Some(response);
                }
                Err(err) => {
                    tracing::debug!(controller = %controller.name, error = %err, "transport failure");
                    payload.err.push(HookError::Failure(err));
                }
            }

            self.hooks.run_phase(Phase::AfterRequest, &mut payload).await?;
            match transaction.resolve(std::mem::take(&mut payload.err)) {
                Outcome::Proceed => {
                    return payload
                        .response
                        .ok_or_else(|| Error::Transport(ClientError::new("no response received")));
                }
                Outcome::Retry => {
                    tracing::debug!(controller = %controller.name, attempt, "retry requested after request");
                    continue;
                }
                Outcome::Fail(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hook;
    use crate::testing::FakeTransport;
    use modelsync_shared::HttpMethod::*;

    fn executor(transport: Arc<FakeTransport>, options: ClientOptions) -> RequestExecutor {
        let (_tx, rx) = watch::channel(options);
        RequestExecutor::new(Arc::new(HookRegistry::new()), transport, rx)
    }

    fn options() -> ClientOptions {
        ClientOptions::new("api.example.com").with_project("acme")
    }

    fn list_posts() -> ControllerDefinition {
        ControllerDefinition::new("posts.list", "/models/:model/:id?", &[Get, Post])
    }

    #[test]
    fn builds_url_method_and_headers() {
        let transport = Arc::new(FakeTransport::new());
        let exec = executor(transport, options().with_header("x-env", "staging"));

        let opts = ExecuteOptions::new()
            .with_path("model", "posts")
            .with_query("limit", "10")
            .with_header("x-env", "prod")
            .with_body(&serde_json::json!({"title": "hi"}))
            .unwrap();
        let request = exec.build_request(&list_posts(), &opts).unwrap();

        assert_eq!(request.method, Post);
        assert_eq!(request.url.as_str(), "https://acme.api.example.com/models/posts/?limit=10");
        assert_eq!(request.headers.get("x-env").unwrap(), "prod");
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(request.body.as_deref(), Some(br#"{"title":"hi"}"#.as_slice()));
    }

    #[tokio::test]
    async fn returns_successful_response() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_json(200, serde_json::json!({"rows": []}));
        let exec = executor(transport.clone(), options());

        let response = exec.execute(&list_posts(), ExecuteOptions::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn retry_budget_allows_four_attempts() {
        let transport = Arc::new(FakeTransport::new());
        let exec = executor(transport.clone(), options());

        exec.hooks()
            .register(Arc::new(Hook::new(Phase::AfterRequest, |payload: &mut HookPayload| -> Result<(), HookError> {
                payload.retry();
                Ok(())
            })))
            .unwrap();

        let mut tx = Transaction::new();
        let err = exec
            .execute_in(&list_posts(), &ExecuteOptions::new(), &mut tx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TooManyRetries { attempt: 4, max_retries: 3 }));
        assert_eq!(transport.calls(), 4);
        assert_eq!(tx.retries(), 4);
    }

    #[tokio::test]
    async fn per_call_retry_budget() {
        let transport = Arc::new(FakeTransport::new());
        let exec = executor(transport.clone(), options());

        exec.hooks()
            .register(Arc::new(Hook::new(Phase::BeforeRequest, |payload: &mut HookPayload| -> Result<(), HookError> {
                payload.retry();
                Ok(())
            })))
            .unwrap();

        let err = exec
            .execute(&list_posts(), ExecuteOptions::new().with_max_retries(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyRetries { attempt: 2, max_retries: 1 }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn abort_short_circuits_retry() {
        let transport = Arc::new(FakeTransport::new());
        let exec = executor(transport.clone(), options());

        let retry = |payload: &mut HookPayload| -> Result<(), HookError> {
            payload.retry();
            Ok(())
        };
        let abort = |payload: &mut HookPayload| -> Result<(), HookError> {
            payload.abort();
            Ok(())
        };
        exec.hooks().register(Arc::new(Hook::new(Phase::AfterRequest, retry))).unwrap();
        exec.hooks().register(Arc::new(Hook::new(Phase::AfterRequest, abort).order(1))).unwrap();

        let err = exec.execute(&list_posts(), ExecuteOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionAborted));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn error_response_reaches_after_hooks() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_json(401, serde_json::json!({"error": {"code": "TOKEN_EXPIRED", "message": "expired"}}));
        transport.push_json(200, serde_json::json!({"ok": true}));
        let exec = executor(transport.clone(), options());

        // refresh-and-retry style hook
        let refresh = |payload: &mut HookPayload| -> Result<(), HookError> {
            let expired = payload
                .last_failure()
                .and_then(Error::client_error)
                .map_or(false, |err| err.code.as_deref() == Some("TOKEN_EXPIRED"));
            if expired {
                payload.retry();
            }
            Ok(())
        };
        exec.hooks().register(Arc::new(Hook::new(Phase::AfterRequest, refresh))).unwrap();

        let body: serde_json::Value = exec.execute_json(&list_posts(), ExecuteOptions::new()).await.unwrap();
        assert_eq!(body, serde_json::json!({"ok": true}));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn unhandled_error_response_is_raised() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_text(503, "maintenance");
        let exec = executor(transport.clone(), options());

        let err = exec.execute(&list_posts(), ExecuteOptions::new()).await.unwrap_err();
        let client_err = err.client_error().unwrap();
        assert_eq!(client_err.message, "maintenance");
        assert_eq!(client_err.status, Some(503));
    }

    #[tokio::test]
    async fn before_hooks_rewrite_the_request() {
        let transport = Arc::new(FakeTransport::new());
        let exec = executor(transport.clone(), options());

        let auth = |payload: &mut HookPayload| -> Result<(), HookError> {
            payload.request.set_header("authorization", "Bearer abc")?;
            Ok(())
        };
        exec.hooks().register(Arc::new(Hook::new(Phase::BeforeRequest, auth))).unwrap();

        exec.execute(&list_posts(), ExecuteOptions::new()).await.unwrap();
        let sent = transport.requests();
        assert_eq!(sent[0].headers.get("authorization").unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn last_hook_error_wins() {
        let transport = Arc::new(FakeTransport::new());
        let exec = executor(transport.clone(), options());

        let fail = |_: &mut HookPayload| -> Result<(), HookError> { Err(HookError::failure("first")) };
        let fail_again = |_: &mut HookPayload| -> Result<(), HookError> { Err(HookError::failure("second")) };
        exec.hooks().register(Arc::new(Hook::new(Phase::BeforeRequest, fail))).unwrap();
        exec.hooks().register(Arc::new(Hook::new(Phase::BeforeRequest, fail_again).order(1))).unwrap();

        let err = exec.execute(&list_posts(), ExecuteOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Hook(msg) if msg == "second"));
        assert_eq!(transport.calls(), 0);
    }
}
