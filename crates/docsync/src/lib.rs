//! # docsync - Live documents over a single reconnecting WebSocket
//!
//! Client side of a document sync backend. One [`SyncClient`] keeps a duplex WebSocket
//! open with backoff, identifies itself with the server, and multiplexes any number of
//! ref-counted document subscriptions over it. Mutating actions travel separately, as
//! one HTTP POST each.
//!
//! Subscriptions survive reconnects: every time the server assigns a new client id,
//! the client re-announces everything it tracks before sending anything else.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::SyncClient;
pub use config::{BackoffOptions, ClientOptions};
pub use connection::{ConnectionStatus, Connector, ConnectorEvent, Link};
pub use dispatch::Dispatcher;
pub use error::{SyncError, SyncResult};
pub use protocol::{ClientMessage, DocUpdate, ServerMessage, SubscriptionKey};
pub use registry::{DocStream, DocValue, Registry};
