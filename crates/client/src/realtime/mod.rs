//! Realtime synchronization over persistent WebSocket connections.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                ConnectionManager                    │
//! │   (one socket per scope, driven by option changes)  │
//! └─────────────────────────────────────────────────────┘
//!                │                      │
//!                ▼                      ▼
//!        ┌──────────────┐       ┌──────────────┐
//!        │ socket       │       │ socket       │
//!        │ (project)    │       │ (global)     │
//!        └──────────────┘       └──────────────┘
//!                │                      │
//!                └──────────┬───────────┘
//!                           ▼
//!              ┌─────────────────────────┐
//!              │    AdapterRegistry      │
//!              │  (ChangeSink, by model) │
//!              └─────────────────────────┘
//!                           │
//!          ┌────────────────┼────────────────┐
//!          ▼                ▼                ▼
//!   ┌────────────┐  ┌──────────────┐  ┌──────────────┐
//!   │ entity     │  │ Collection   │  │ Collection   │
//!   │ observers  │  │ Reconciler   │  │ Reconciler   │
//!   └────────────┘  └──────────────┘  └──────────────┘
//! ```
//!
//! Frames of one socket are handled in receipt order by a single driver
//! task. Change events for models the scope did not subscribe to are
//! dropped before they reach the registry.
//!
//! # Usage
//!
//! ```rust,ignore
//! let client = Client::builder(ClientOptions::from_env()).build();
//! client.realtime().subscribe_models(Scope::Project, &["posts"]);
//! client.realtime().connect(Scope::Project, false).await?;
//!
//! let posts = client.model::<Document>("posts")?;
//! let _sub = posts.subscribe(|event| println!("{} {:?}", event.operation, event.ids()));
//! ```

mod connection;
mod manager;
mod tungstenite;

pub use connection::{
    ConnectionState, ReconnectConfig, SocketConnector, SocketLink, SocketRequest, TransportEvent,
};
pub use manager::{ConnectionManager, PendingConnect};
pub use tungstenite::TungsteniteConnector;
