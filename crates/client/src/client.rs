//! The client: options, hooks, request execution, model adapters and the
//! realtime engine behind one cloneable handle.

use std::sync::Arc;

use modelsync_shared::{ControllerDefinition, Scope};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::adapter::{AdapterRegistry, ModelAdapter, Record};
use crate::collection::{Collection, QueryLoader};
use crate::config::ClientOptions;
use crate::error::Result;
use crate::executor::{ExecuteOptions, HttpTransport, ReqwestTransport, RequestExecutor, Response};
use crate::hooks::{Hook, HookRegistry};
use crate::realtime::{ConnectionManager, ReconnectConfig, SocketConnector, TungsteniteConnector};

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn HttpTransport>>,
    connector: Option<Arc<dyn SocketConnector>>,
    reconnect: Option<ReconnectConfig>,
}

impl ClientBuilder {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            transport: None,
            connector: None,
            reconnect: Some(ReconnectConfig::default()),
        }
    }

    /// Replace the HTTP transport (defaults to `reqwest`).
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the socket connector (defaults to tokio-tungstenite).
    pub fn with_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Backoff used after an established socket drops; `None` disables
    /// reconnecting.
    pub fn with_reconnect(mut self, reconnect: Option<ReconnectConfig>) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Build the client. With `realtime.auto_connect` the option watcher is
    /// started on the current tokio runtime.
    pub fn build(self) -> Client {
        let auto_connect = self.options.realtime.auto_connect;
        let initial_models = self.options.realtime.subscribe_models.clone();

        let (options_tx, options_rx) = watch::channel(self.options);
        let hooks = Arc::new(HookRegistry::new());
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
        let executor = RequestExecutor::new(hooks.clone(), transport, options_rx.clone());

        let adapters = Arc::new(AdapterRegistry::new());
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TungsteniteConnector::new()));
        let realtime = ConnectionManager::new(options_rx.clone(), connector, adapters.clone(), self.reconnect);

        if !initial_models.is_empty() {
            realtime.subscribe_models(Scope::Project, &initial_models);
        }

        if auto_connect {
            if tokio::runtime::Handle::try_current().is_ok() {
                realtime.watch_options(options_rx);
            } else {
                tracing::warn!("no tokio runtime; realtime auto-connect disabled");
            }
        }

        Client {
            inner: Arc::new(ClientInner {
                options: options_tx,
                hooks,
                executor,
                adapters,
                realtime,
            }),
        }
    }
}

struct ClientInner {
    options: watch::Sender<ClientOptions>,
    hooks: Arc<HookRegistry>,
    executor: RequestExecutor,
    adapters: Arc<AdapterRegistry>,
    realtime: ConnectionManager,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // the option watcher holds its own handle on the manager
        self.realtime.close();
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder::new(options)
    }

    pub fn new(options: ClientOptions) -> Self {
        ClientBuilder::new(options).build()
    }

    /// Current options.
    pub fn options(&self) -> ClientOptions {
        self.inner.options.borrow().clone()
    }

    /// Edit the options. Watchers are only notified when something changed.
    pub fn set_options(&self, update: impl FnOnce(&mut ClientOptions)) {
        self.inner.options.send_if_modified(|options| {
            let before = options.clone();
            update(options);
            *options != before
        });
    }

    /// Receiver of option changes.
    pub fn subscribe_options(&self) -> watch::Receiver<ClientOptions> {
        self.inner.options.subscribe()
    }

    /// Register a hook; the returned handle identifies it for removal.
    pub fn hook(&self, hook: Hook) -> Result<Arc<Hook>> {
        let hook = Arc::new(hook);
        self.inner.hooks.register(hook.clone())?;
        Ok(hook)
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.inner.executor
    }

    pub async fn execute(&self, controller: &ControllerDefinition, options: ExecuteOptions) -> Result<Response> {
        self.inner.executor.execute(controller, options).await
    }

    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        controller: &ControllerDefinition,
        options: ExecuteOptions,
    ) -> Result<T> {
        self.inner.executor.execute_json(controller, options).await
    }

    /// The adapter of a model. With `realtime.auto_subscribe` the model is
    /// also subscribed on the project scope.
    pub fn model<R: Record>(&self, slug: &str) -> Result<Arc<ModelAdapter<R>>> {
        let adapter = self.inner.adapters.register::<R>(slug)?;
        if self.inner.options.borrow().realtime.auto_subscribe {
            self.inner.realtime.subscribe_models(Scope::Project, &[slug]);
        }
        Ok(adapter)
    }

    /// A collection of `slug` loaded by executing `controller`.
    pub fn query<R>(
        &self,
        slug: &str,
        controller: ControllerDefinition,
        options: ExecuteOptions,
    ) -> Result<Arc<Collection<R>>>
    where
        R: Record + DeserializeOwned,
    {
        let adapter = self.model::<R>(slug)?;
        let loader = QueryLoader::new(self.inner.executor.clone(), controller, options);
        Ok(adapter.collection(loader))
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.inner.adapters
    }

    pub fn realtime(&self) -> &ConnectionManager {
        &self.inner.realtime
    }

    /// Stop the realtime engine. Requests keep working.
    pub fn close(&self) {
        self.inner.realtime.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.options.borrow().endpoint)
            .field("hooks", &self.inner.hooks.len())
            .field("realtime", &self.inner.realtime)
            .finish()
    }
}
