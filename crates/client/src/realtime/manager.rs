//! Persistent connections, one per scope.
//!
//! Each scope has at most one live transport. Its state is only touched
//! under the manager lock and every background task (driver, connect timer,
//! reconnect loop) carries the generation it was started for; a task whose
//! generation is stale does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use modelsync_shared::{ClientCommand, Scope, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::connection::{ConnectionState, ReconnectConfig, SocketConnector, SocketRequest, TransportEvent};
use crate::broker::ChangeSink;
use crate::config::ClientOptions;
use crate::error::{Error, Result};

/// Outcome of a connect, shared by every caller waiting for it.
pub type PendingConnect = Shared<BoxFuture<'static, Result<()>>>;

struct ScopeState {
    generation: u64,
    state: ConnectionState,
    models: Vec<String>,
    connection_id: Option<String>,
    pending: Option<PendingConnect>,
    settle: Option<oneshot::Sender<Result<()>>>,
    commands: Option<UnboundedSender<ClientCommand>>,
    driver: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    /// Id of the reconnect loop allowed to act on this scope.
    reconnect: Option<u64>,
}

impl Default for ScopeState {
    fn default() -> Self {
        Self {
            generation: 0,
            state: ConnectionState::Disconnected,
            models: Vec::new(),
            connection_id: None,
            pending: None,
            settle: None,
            commands: None,
            driver: None,
            timer: None,
            reconnect: None,
        }
    }
}

impl ScopeState {
    /// Drop the transport and every task attached to it. Waiters of an
    /// unsettled connect see `Disconnected`.
    fn teardown(&mut self) {
        self.commands = None;
        self.settle = None;
        self.pending = None;
        self.connection_id = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn announce(&self, scope: Scope) {
        let Some(commands) = &self.commands else {
            return;
        };
        tracing::debug!(%scope, models = ?self.models, "announcing subscribed models");
        if commands
            .unbounded_send(ClientCommand::subscribe_models(&self.models))
            .is_err()
        {
            tracing::warn!(%scope, "socket gone before announcing models");
        }
    }
}

struct Inner {
    options: watch::Receiver<ClientOptions>,
    connector: Arc<dyn SocketConnector>,
    sink: Arc<dyn ChangeSink>,
    reconnect: Option<ReconnectConfig>,
    scopes: Mutex<HashMap<Scope, ScopeState>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    next_reconnect: Mutex<u64>,
}

/// Owns the persistent connections of a client.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        options: watch::Receiver<ClientOptions>,
        connector: Arc<dyn SocketConnector>,
        sink: Arc<dyn ChangeSink>,
        reconnect: Option<ReconnectConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                connector,
                sink,
                reconnect,
                scopes: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
                next_reconnect: Mutex::new(0),
            }),
        }
    }

    /// Start (or join) a connect for `scope`.
    ///
    /// Fails immediately when the options lack what the scope's handshake
    /// needs. Without `force`, a connect that is pending or already
    /// established is shared instead of opening another socket.
    pub fn start(&self, scope: Scope, force: bool) -> Result<PendingConnect> {
        let (pending, _) = self.open(scope, force, true)?;
        Ok(pending)
    }

    /// Connect and wait for the server's acknowledgment.
    pub async fn connect(&self, scope: Scope, force: bool) -> Result<()> {
        self.start(scope, force)?.await
    }

    fn open(&self, scope: Scope, force: bool, cancel_reconnect: bool) -> Result<(PendingConnect, u64)> {
        let options = self.inner.options.borrow().clone();
        let url = options.socket_url(scope)?;

        let mut scopes = self.inner.scopes.lock();
        let state = scopes.entry(scope).or_default();

        if !force {
            if let Some(pending) = &state.pending {
                return Ok((pending.clone(), state.generation));
            }
        }

        if cancel_reconnect {
            state.reconnect = None;
        }
        state.teardown();
        state.generation += 1;
        let generation = state.generation;

        let (settle_tx, settle_rx) = oneshot::channel();
        let pending: PendingConnect = async move { settle_rx.await.unwrap_or(Err(Error::Disconnected)) }
            .boxed()
            .shared();

        tracing::info!(%scope, generation, host = url.host_str().unwrap_or_default(), "opening socket");
        let link = self.inner.connector.open(SocketRequest { scope, url });

        state.commands = Some(link.commands);
        state.settle = Some(settle_tx);
        state.pending = Some(pending.clone());
        if !matches!(state.state, ConnectionState::Reconnecting { .. }) {
            state.state = ConnectionState::Connecting;
        }
        state.driver = Some(tokio::spawn(self.clone().drive(scope, generation, link.events)));
        state.timer = Some(tokio::spawn(self.clone().expire(
            scope,
            generation,
            options.realtime.connect_timeout,
        )));

        Ok((pending, generation))
    }

    /// Close the scope's socket. Safe to call on an idle scope.
    pub fn disconnect(&self, scope: Scope) {
        let mut scopes = self.inner.scopes.lock();
        let Some(state) = scopes.get_mut(&scope) else {
            return;
        };

        let was_open = state.commands.is_some();
        state.teardown();
        state.reconnect = None;
        state.generation += 1;
        state.state = ConnectionState::Disconnected;

        if was_open {
            tracing::info!(%scope, "socket disconnected");
        }
    }

    /// Add models to the scope's subscribed set. Returns whether the set
    /// changed; a change is announced right away when the scope is connected.
    pub fn subscribe_models<S: AsRef<str>>(&self, scope: Scope, models: &[S]) -> bool {
        let mut scopes = self.inner.scopes.lock();
        let state = scopes.entry(scope).or_default();

        let mut changed = false;
        for model in models {
            let model = model.as_ref();
            if !model.is_empty() && !state.models.iter().any(|m| m == model) {
                state.models.push(model.to_string());
                changed = true;
            }
        }

        if changed && state.state.is_connected() {
            state.announce(scope);
        }
        changed
    }

    pub fn subscribed_models(&self, scope: Scope) -> Vec<String> {
        self.inner
            .scopes
            .lock()
            .get(&scope)
            .map(|state| state.models.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, scope: Scope) -> bool {
        self.state(scope).is_connected()
    }

    pub fn state(&self, scope: Scope) -> ConnectionState {
        self.inner
            .scopes
            .lock()
            .get(&scope)
            .map(|state| state.state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Server-assigned id of the scope's current connection.
    pub fn connection_id(&self, scope: Scope) -> Option<String> {
        self.inner
            .scopes
            .lock()
            .get(&scope)
            .and_then(|state| state.connection_id.clone())
    }

    /// Follow option changes, connecting and disconnecting scopes as the
    /// credential, endpoint and scope list change. Replaces any previous
    /// watcher.
    pub fn watch_options(&self, mut options: watch::Receiver<ClientOptions>) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut previous = options.borrow_and_update().clone();
            manager.apply(ScopePlan::initial(&previous));

            while options.changed().await.is_ok() {
                let next = options.borrow_and_update().clone();
                manager.apply(ScopePlan::between(&previous, &next));
                previous = next;
            }
        });

        if let Some(old) = self.inner.watcher.lock().replace(task) {
            old.abort();
        }
    }

    /// Stop watching options and close every socket.
    pub fn close(&self) {
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        let scopes: Vec<Scope> = self.inner.scopes.lock().keys().copied().collect();
        for scope in scopes {
            self.disconnect(scope);
        }
    }

    fn apply(&self, plan: ScopePlan) {
        for scope in plan.disconnect {
            self.disconnect(scope);
        }

        for scope in plan.connect {
            match self.start(scope, plan.force) {
                Ok(pending) => {
                    tokio::spawn(async move {
                        if let Err(e) = pending.await {
                            tracing::warn!(%scope, error = %e, "connect failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(%scope, error = %e, "cannot connect"),
            }
        }
    }

    async fn drive(self, scope: Scope, generation: u64, mut events: UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.next().await {
            match event {
                TransportEvent::Frame(frame) => self.on_frame(scope, generation, frame),
                TransportEvent::Error(err) => self.on_error(scope, generation, err),
                TransportEvent::Closed => break,
            }
        }
        self.on_closed(scope, generation);
    }

    async fn expire(self, scope: Scope, generation: u64, timeout: Duration) {
        tokio::time::sleep(timeout).await;

        let mut scopes = self.inner.scopes.lock();
        let Some(state) = scopes.get_mut(&scope) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        if let Some(settle) = state.settle.take() {
            tracing::warn!(%scope, ?timeout, "socket did not acknowledge in time");
            let _ = settle.send(Err(Error::ConnectionTimeout(timeout)));
            // this task is finishing; don't abort it from teardown
            state.timer = None;
            state.teardown();
            state.generation += 1;
            state.state = ConnectionState::Disconnected;
        }
    }

    fn on_frame(&self, scope: Scope, generation: u64, frame: ServerEvent) {
        match frame {
            ServerEvent::Connected { connection_id } => {
                let mut scopes = self.inner.scopes.lock();
                let Some(state) = scopes.get_mut(&scope) else {
                    return;
                };
                if state.generation != generation {
                    return;
                }

                tracing::info!(%scope, %connection_id, "socket connected");
                state.connection_id = Some(connection_id);
                state.state = ConnectionState::Connected;
                state.reconnect = None;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                if let Some(settle) = state.settle.take() {
                    let _ = settle.send(Ok(()));
                }
                state.announce(scope);
            }
            ServerEvent::RealtimeEvent(mut event) => {
                {
                    let scopes = self.inner.scopes.lock();
                    let Some(state) = scopes.get(&scope) else {
                        return;
                    };
                    if state.generation != generation {
                        return;
                    }
                    if !state.models.iter().any(|m| *m == event.model) {
                        tracing::debug!(%scope, model = %event.model, "dropping event for unsubscribed model");
                        return;
                    }
                    event.origin_connection_id = state.connection_id.clone();
                }

                tracing::debug!(%scope, model = %event.model, operation = %event.operation, ids = ?event.ids(), "change event");
                self.inner.sink.deliver(event);
            }
            ServerEvent::Info { message } => {
                tracing::info!(%scope, %message, "server info");
            }
            ServerEvent::Error { code, message } => {
                tracing::warn!(%scope, %code, %message, "server error");
            }
        }
    }

    fn on_error(&self, scope: Scope, generation: u64, err: Error) {
        let mut scopes = self.inner.scopes.lock();
        let Some(state) = scopes.get_mut(&scope) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        match state.settle.take() {
            Some(settle) => {
                tracing::warn!(%scope, error = %err, "socket failed before acknowledgment");
                state.state = ConnectionState::Failed {
                    reason: err.to_string(),
                };
                let _ = settle.send(Err(err));
                // the driver is the caller; it stops on its own
                state.driver = None;
                state.teardown();
                state.generation += 1;
            }
            None => tracing::warn!(%scope, error = %err, "socket error"),
        }
    }

    fn on_closed(&self, scope: Scope, generation: u64) {
        let reconnect_id = {
            let mut scopes = self.inner.scopes.lock();
            let Some(state) = scopes.get_mut(&scope) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            let established = state.settle.is_none() && state.state.is_connected();
            if state.settle.is_some() {
                tracing::warn!(%scope, "socket closed before acknowledgment");
                state.state = ConnectionState::Failed {
                    reason: Error::Disconnected.to_string(),
                };
                if let Some(settle) = state.settle.take() {
                    let _ = settle.send(Err(Error::Disconnected));
                }
            } else {
                tracing::info!(%scope, "socket closed");
                state.state = ConnectionState::Disconnected;
            }

            state.driver = None;
            state.teardown();
            state.generation += 1;

            if !established || self.inner.reconnect.is_none() || state.reconnect.is_some() {
                return;
            }

            let id = {
                let mut next = self.inner.next_reconnect.lock();
                *next += 1;
                *next
            };
            state.reconnect = Some(id);
            id
        };

        tokio::spawn(self.clone().reconnect_loop(scope, reconnect_id));
    }

    fn reconnect_owned(&self, scope: Scope, id: u64) -> bool {
        self.inner
            .scopes
            .lock()
            .get(&scope)
            .map_or(false, |state| state.reconnect == Some(id))
    }

    async fn reconnect_loop(self, scope: Scope, id: u64) {
        let Some(config) = self.inner.reconnect.clone() else {
            return;
        };

        let mut attempt = 0u32;
        loop {
            if !config.allows(attempt) {
                let mut scopes = self.inner.scopes.lock();
                if let Some(state) = scopes.get_mut(&scope).filter(|s| s.reconnect == Some(id)) {
                    state.reconnect = None;
                    state.state = ConnectionState::Failed {
                        reason: format!("Max reconnect attempts ({}) exceeded", config.max_attempts),
                    };
                }
                tracing::error!(%scope, attempts = attempt, "giving up on reconnect");
                return;
            }

            let delay = config.delay_for_attempt(attempt);
            {
                let mut scopes = self.inner.scopes.lock();
                match scopes.get_mut(&scope).filter(|s| s.reconnect == Some(id)) {
                    Some(state) => {
                        state.state = ConnectionState::Reconnecting { attempt: attempt + 1 }
                    }
                    None => return,
                }
            }
            tracing::info!(%scope, attempt = attempt + 1, ?delay, "reconnecting");
            tokio::time::sleep(delay).await;

            if !self.reconnect_owned(scope, id) {
                return;
            }

            match self.open(scope, true, false) {
                Ok((pending, _)) => match pending.await {
                    Ok(()) => return,
                    Err(e) => tracing::warn!(%scope, error = %e, attempt = attempt + 1, "reconnect attempt failed"),
                },
                Err(e) => {
                    tracing::warn!(%scope, error = %e, "cannot reconnect");
                    let mut scopes = self.inner.scopes.lock();
                    if let Some(state) = scopes.get_mut(&scope).filter(|s| s.reconnect == Some(id)) {
                        state.reconnect = None;
                        state.state = ConnectionState::Disconnected;
                    }
                    return;
                }
            }

            if !self.reconnect_owned(scope, id) {
                return;
            }
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scopes = self.inner.scopes.lock();
        let mut map = f.debug_map();
        for (scope, state) in scopes.iter() {
            map.entry(scope, &state.state);
        }
        map.finish()
    }
}

/// Scopes to (dis)connect after an option change.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ScopePlan {
    pub connect: Vec<Scope>,
    pub force: bool,
    pub disconnect: Vec<Scope>,
}

impl ScopePlan {
    pub fn initial(options: &ClientOptions) -> Self {
        if options.credential().is_none() {
            return Self::default();
        }
        Self {
            connect: options.sockets.clone(),
            ..Self::default()
        }
    }

    pub fn between(previous: &ClientOptions, next: &ClientOptions) -> Self {
        let identity_changed = previous.credential() != next.credential()
            || previous.endpoint != next.endpoint
            || previous.project != next.project
            || previous.ssl != next.ssl
            || previous.socket_path != next.socket_path;

        let removed: Vec<Scope> = previous
            .sockets
            .iter()
            .filter(|scope| !next.sockets.contains(scope))
            .copied()
            .collect();

        if next.credential().is_none() {
            if !identity_changed {
                return Self {
                    disconnect: removed,
                    ..Self::default()
                };
            }
            let mut disconnect = previous.sockets.clone();
            for scope in &next.sockets {
                if !disconnect.contains(scope) {
                    disconnect.push(*scope);
                }
            }
            return Self {
                disconnect,
                ..Self::default()
            };
        }

        if identity_changed {
            return Self {
                connect: next.sockets.clone(),
                force: true,
                disconnect: removed,
            };
        }

        Self {
            connect: next
                .sockets
                .iter()
                .filter(|scope| !previous.sockets.contains(scope))
                .copied()
                .collect(),
            force: false,
            disconnect: removed,
        }
    }
}
