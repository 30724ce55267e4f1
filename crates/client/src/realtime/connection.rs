//! Socket-level types shared by the connection manager and its transports.

use std::time::Duration;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use modelsync_shared::{ClientCommand, Scope, ServerEvent};
use url::Url;

use crate::error::Error;

/// Connection state of a scope
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Configuration for auto-reconnect after an established socket drops
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u32).min(self.max_delay_ms) as u64)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// What a connector needs to open a socket.
#[derive(Debug, Clone)]
pub struct SocketRequest {
    pub scope: Scope,
    pub url: Url,
}

/// Everything a transport reports back to its driver.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(ServerEvent),
    /// Handshake or I/O failure. A `Closed` follows.
    Error(Error),
    Closed,
}

/// The two ends of an opened socket, as seen by the manager.
///
/// Dropping `commands` asks the transport to close.
pub struct SocketLink {
    pub commands: UnboundedSender<ClientCommand>,
    pub events: UnboundedReceiver<TransportEvent>,
}

/// Opens sockets. Must be called from within a tokio runtime.
pub trait SocketConnector: Send + Sync {
    fn open(&self, request: SocketRequest) -> SocketLink;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(config.delay_for_attempt(20), Duration::from_millis(10000));
    }

    #[test]
    fn attempt_limits() {
        let config = ReconnectConfig::default();
        assert!(config.allows(9));
        assert!(!config.allows(10));

        let unlimited = ReconnectConfig {
            max_attempts: 0,
            ..ReconnectConfig::default()
        };
        assert!(unlimited.allows(1000));
    }
}
