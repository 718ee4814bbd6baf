//! Unary request/reply channel for mutating actions.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{SyncError, SyncResult};

/// Posts actions to the dispatch endpoint, one request per action
///
/// Stateless and independent of the duplex channel. Failures are returned as they
/// happen; retrying is the caller's decision.
#[derive(Clone)]
pub struct Dispatcher {
    endpoint: String,
    http_client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(endpoint, reqwest::Client::new())
    }

    pub fn with_client(endpoint: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            http_client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Dispatch an action and return the reply as JSON
    pub async fn dispatch<A>(&self, action: &A) -> SyncResult<JsonValue>
    where
        A: Serialize + ?Sized,
    {
        self.dispatch_as(action).await
    }

    /// Dispatch an action and decode the reply into `T`
    pub async fn dispatch_as<T, A>(&self, action: &A) -> SyncResult<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(action)?;
        let started = Instant::now();
        debug!("Dispatching action to {}", self.endpoint);

        let response = self
            .http_client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!("Dispatch to {} failed: {}", self.endpoint, e);
                SyncError::Transport(e)
            })?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            warn!(
                "Dispatch rejected: status={} body=\"{}\" duration_ms={}",
                status,
                text,
                started.elapsed().as_millis()
            );
            return Err(SyncError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        match serde_json::from_str(&text) {
            Ok(result) => {
                debug!(
                    "Dispatch succeeded: status={} duration_ms={}",
                    status,
                    started.elapsed().as_millis()
                );
                Ok(result)
            }
            Err(source) => {
                warn!("Dispatch reply is not the expected JSON: {}", source);
                Err(SyncError::Decode { body: text, source })
            }
        }
    }
}
