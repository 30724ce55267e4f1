//! modelsync client
//!
//! Turns controller definitions into HTTP calls run through an ordered hook
//! pipeline, caches model records locally and keeps cached records and
//! collections consistent with change events pushed over WebSocket.

pub mod adapter;
pub mod broker;
pub mod client;
pub mod collection;
pub mod config;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod logging;
pub mod realtime;
pub mod reconciler;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{AdapterRegistry, Document, EntityCache, ModelAdapter, Record};
pub use broker::{ChangeSink, Observer, Subscription, SubscriptionBroker};
pub use client::{Client, ClientBuilder};
pub use collection::{Collection, CollectionLoader, LastUpdated, QueryLoader};
pub use config::{ClientOptions, RealtimeOptions};
pub use error::{Error, Result};
pub use executor::{ExecuteOptions, HttpTransport, OutboundRequest, ReqwestTransport, RequestExecutor, Response};
pub use hooks::{Hook, HookError, HookHandler, HookPayload, HookRegistry, Phase};
pub use realtime::{ConnectionManager, ConnectionState, ReconnectConfig};
pub use reconciler::{CollectionReconciler, ReconcilerSubscription};
pub use transaction::{Token, Transaction};

pub use modelsync_shared as shared;
