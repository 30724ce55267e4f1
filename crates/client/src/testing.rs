//! In-memory transports and loaders for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_channel::mpsc::{unbounded, TryRecvError, UnboundedReceiver, UnboundedSender};
use modelsync_shared::{ChangeEvent, ClientCommand, ClientError, Scope, ServerEvent};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tokio::sync::Semaphore;
use url::Url;

use crate::adapter::{Document, Record};
use crate::broker::ChangeSink;
use crate::collection::CollectionLoader;
use crate::error::{Error, Result};
use crate::executor::{HttpTransport, OutboundRequest, Response};
use crate::realtime::{SocketConnector, SocketLink, SocketRequest, TransportEvent};

/// Let spawned tasks catch up on a current-thread runtime.
pub async fn flush() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Replays queued responses; answers `200 {}` once the queue is empty.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<Response>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, status: u16, content_type: &'static str, body: Vec<u8>) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.responses.lock().push_back(Response { status, headers, body });
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(status, "application/json", body.to_string().into_bytes());
    }

    pub fn push_text(&self, status: u16, body: &str) {
        self.push(status, "text/plain; charset=utf-8", body.as_bytes().to_vec());
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<Response> {
        self.requests.lock().push(request.clone());
        let next = self.responses.lock().pop_front();
        Ok(next.unwrap_or_else(|| {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Response {
                status: 200,
                headers,
                body: b"{}".to_vec(),
            }
        }))
    }
}

struct Inbox {
    commands: UnboundedReceiver<ClientCommand>,
    received: Vec<ClientCommand>,
    closed: bool,
}

impl Inbox {
    fn pump(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => self.received.push(cmd),
                Err(TryRecvError::Closed) => {
                    self.closed = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }
}

/// Server side of a socket opened through [`FakeConnector`].
pub struct FakeSocket {
    pub scope: Scope,
    pub url: Url,
    events: UnboundedSender<TransportEvent>,
    inbox: Mutex<Inbox>,
}

impl FakeSocket {
    pub fn emit(&self, frame: ServerEvent) {
        let _ = self.events.unbounded_send(TransportEvent::Frame(frame));
    }

    pub fn ack(&self, connection_id: &str) {
        self.emit(ServerEvent::Connected {
            connection_id: connection_id.to_string(),
        });
    }

    pub fn fail(&self, err: Error) {
        let _ = self.events.unbounded_send(TransportEvent::Error(err));
        let _ = self.events.unbounded_send(TransportEvent::Closed);
    }

    pub fn close(&self) {
        let _ = self.events.unbounded_send(TransportEvent::Closed);
    }

    /// Commands received since the last call.
    pub fn sent(&self) -> Vec<ClientCommand> {
        let mut inbox = self.inbox.lock();
        inbox.pump();
        std::mem::take(&mut inbox.received)
    }

    /// Whether the client let go of the socket.
    pub fn is_closed(&self) -> bool {
        let mut inbox = self.inbox.lock();
        inbox.pump();
        inbox.closed
    }
}

#[derive(Default)]
pub struct FakeConnector {
    sockets: Mutex<Vec<Arc<FakeSocket>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn socket(&self, index: usize) -> Arc<FakeSocket> {
        self.sockets.lock()[index].clone()
    }
}

impl SocketConnector for FakeConnector {
    fn open(&self, request: SocketRequest) -> SocketLink {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        self.sockets.lock().push(Arc::new(FakeSocket {
            scope: request.scope,
            url: request.url,
            events: event_tx,
            inbox: Mutex::new(Inbox {
                commands: command_rx,
                received: Vec::new(),
                closed: false,
            }),
        }));

        SocketLink {
            commands: command_tx,
            events: event_rx,
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }
}

impl ChangeSink for RecordingSink {
    fn deliver(&self, event: ChangeEvent) {
        self.events.lock().push(event);
    }
}

/// Loads whatever it was last given.
#[derive(Clone)]
pub struct StaticLoader<R> {
    items: Arc<Mutex<Vec<R>>>,
    calls: Arc<AtomicUsize>,
}

impl<R: Record> StaticLoader<R> {
    pub fn new(items: Vec<R>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, items: Vec<R>) {
        *self.items.lock() = items;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Record> CollectionLoader<R> for StaticLoader<R> {
    async fn load(&self) -> Result<Vec<R>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.lock().clone())
    }
}

pub struct FailingLoader;

#[async_trait]
impl<R: Record> CollectionLoader<R> for FailingLoader {
    async fn load(&self) -> Result<Vec<R>> {
        Err(Error::Transport(ClientError::new("backend unavailable").with_status(503)))
    }
}

/// Blocks every load until a permit is released. Load `n` returns a single
/// document stamped with second `n`.
#[derive(Clone)]
pub struct GatedLoader {
    started: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
}

impl GatedLoader {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl CollectionLoader<Document> for GatedLoader {
    async fn load(&self) -> Result<Vec<Document>> {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate
            .acquire()
            .await
            .map_err(|_| Error::hook("gate closed"))?
            .forget();

        let mut doc = Document::new("latest");
        doc.updated_at = Utc.timestamp_opt(n as i64, 0).single();
        Ok(vec![doc])
    }
}
