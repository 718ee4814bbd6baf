use thiserror::Error;

/// Result type for docsync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in docsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The dispatch request never produced a response
    #[error("Dispatch transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The dispatch endpoint answered with a non-success status
    #[error("Dispatch failed with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The dispatch endpoint answered with a body that is not JSON
    #[error("Expecting JSON but could not parse: {body}")]
    Decode {
        body: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connector is already running")]
    AlreadyConnected,

    #[error("Client has been shut down")]
    Shutdown,

    #[error("No live subscription for document '{name}' in domain '{domain}'")]
    UnknownSubscription { domain: String, name: String },

    #[error("Document '{name}' in domain '{domain}' is already subscribed with a different auth token")]
    AuthMismatch { domain: String, name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
