//! WebSocket transport using tokio-tungstenite.

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use modelsync_shared::{ClientCommand, ServerEvent};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::connection::{SocketConnector, SocketLink, SocketRequest, TransportEvent};
use crate::error::Error;

/// Default [`SocketConnector`]: one background task per socket, with a read
/// task and a write task once the handshake succeeds.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SocketConnector for TungsteniteConnector {
    fn open(&self, request: SocketRequest) -> SocketLink {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        tokio::spawn(run_socket(request, command_rx, event_tx));

        SocketLink {
            commands: command_tx,
            events: event_rx,
        }
    }
}

async fn run_socket(
    request: SocketRequest,
    mut commands: UnboundedReceiver<ClientCommand>,
    events: UnboundedSender<TransportEvent>,
) {
    let scope = request.scope;

    let ws_stream = match connect_async(request.url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            tracing::error!(%scope, error = %e, "websocket handshake failed");
            let _ = events.unbounded_send(TransportEvent::Error(Error::Socket(e.to_string())));
            let _ = events.unbounded_send(TransportEvent::Closed);
            return;
        }
    };

    tracing::info!(%scope, host = request.url.host_str().unwrap_or_default(), "websocket open");
    let (mut write, mut read) = ws_stream.split();

    // Channel to signal when connection closes
    let (close_tx, mut close_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let events_for_read = events.clone();
    let close_tx_for_read = close_tx.clone();
    let read_task = tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    tracing::trace!(%scope, frame = text.as_str(), "websocket received");
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(frame) => {
                            if events_for_read.unbounded_send(TransportEvent::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(%scope, error = %e, "failed to parse frame"),
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(%scope, "websocket received close frame");
                    break;
                }
                Ok(_) => {
                    // Pong is handled by tungstenite; binary frames are not part of the protocol
                }
                Err(e) => {
                    tracing::warn!(%scope, error = %e, "websocket read error");
                    let _ = events_for_read.unbounded_send(TransportEvent::Error(Error::Socket(e.to_string())));
                    break;
                }
            }
        }
        let _ = close_tx_for_read.send(());
    });

    let write_task = tokio::spawn(async move {
        loop {
            match commands.next().await {
                Some(cmd) => match serde_json::to_string(&cmd) {
                    Ok(json) => {
                        tracing::debug!(%scope, frame = %json, "websocket send");
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            tracing::warn!(%scope, error = %e, "websocket send failed");
                            break;
                        }
                    }
                    Err(e) => tracing::error!(%scope, error = %e, "failed to serialize command"),
                },
                None => {
                    // Sender dropped: the manager let go of this socket
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = close_tx.send(());
    });

    close_rx.recv().await;
    read_task.abort();
    write_task.abort();

    tracing::info!(%scope, "websocket closed");
    let _ = events.unbounded_send(TransportEvent::Closed);
}
