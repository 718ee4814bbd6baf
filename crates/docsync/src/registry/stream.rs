use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::warn;

use super::{HandleId, Registry};
use crate::protocol::{DocUpdate, SubscriptionKey};
use crate::SyncResult;

/// A delivered document value, shared by every consumer of the document
pub type DocValue = Arc<DocUpdate>;

/// One consumer's view of a live document
///
/// Yields the last value the registry delivered for the document (if any) first, then
/// every later push in arrival order. Dropping the stream detaches it; use
/// [`DocStream::detach`] to observe the outcome instead.
pub struct DocStream {
    key: SubscriptionKey,
    handle: HandleId,
    registry: Arc<Registry>,
    rx: mpsc::UnboundedReceiver<DocValue>,
    latest: Option<DocValue>,
    detached: bool,
}

impl DocStream {
    pub(super) fn new(
        key: SubscriptionKey,
        handle: HandleId,
        registry: Arc<Registry>,
        rx: mpsc::UnboundedReceiver<DocValue>,
    ) -> Self {
        Self {
            key,
            handle,
            registry,
            rx,
            latest: None,
            detached: false,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Most recent value this consumer has received
    pub fn latest(&self) -> Option<&DocValue> {
        self.latest.as_ref()
    }

    /// Wait for the next value
    ///
    /// Returns `None` once the owning client has shut down.
    pub async fn next_value(&mut self) -> Option<DocValue> {
        let value = self.rx.recv().await?;
        self.latest = Some(value.clone());
        Some(value)
    }

    /// Take the next value if one is already queued
    pub fn try_next_value(&mut self) -> Option<DocValue> {
        let value = self.rx.try_recv().ok()?;
        self.latest = Some(value.clone());
        Some(value)
    }

    /// Detach from the registry, tearing the upstream subscription down if this was the
    /// last consumer
    pub fn detach(mut self) -> SyncResult<()> {
        self.detached = true;
        self.registry.detach(&self.key, self.handle)
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<Registry>) -> bool {
        Arc::ptr_eq(&self.registry, registry)
    }
}

impl Stream for DocStream {
    type Item = DocValue;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(value)) => {
                this.latest = Some(value.clone());
                Poll::Ready(Some(value))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for DocStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStream")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for DocStream {
    fn drop(&mut self) {
        if !self.detached {
            if let Err(e) = self.registry.detach(&self.key, self.handle) {
                warn!("Failed to detach dropped stream for '{}': {}", self.key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Link;
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    fn update(value: i64) -> DocUpdate {
        serde_json::from_value(json!({ "domain": "d", "name": "n", "value": value })).unwrap()
    }

    fn ready_registry() -> (Arc<Registry>, mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(Registry::new());
        let (link, rx) = Link::pair(1);
        registry.go_ready("client-1".to_string(), link).unwrap();
        (registry, rx)
    }

    #[test]
    fn test_next_value_wakes_on_publish() {
        let (registry, _rx) = ready_registry();
        let mut stream = registry.attach(SubscriptionKey::new("d", "n"), None).unwrap();

        let mut next = task::spawn(stream.next_value());
        assert_pending!(next.poll());

        registry.publish(update(5));
        assert!(next.is_woken());
        let value = assert_ready!(next.poll()).unwrap();
        assert_eq!(value.get("value"), Some(&json!(5)));
        drop(next);

        assert_eq!(stream.latest().unwrap().get("value"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_stream_yields_in_arrival_order() {
        let (registry, _rx) = ready_registry();
        let stream = registry.attach(SubscriptionKey::new("d", "n"), None).unwrap();

        for value in 1..=3 {
            registry.publish(update(value));
        }
        registry.close();

        let values: Vec<_> = stream
            .map(|value| value.get("value").cloned().unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_drop_detaches() {
        let (registry, mut rx) = ready_registry();
        let key = SubscriptionKey::new("d", "n");
        let stream = registry.attach(key.clone(), None).unwrap();
        assert_eq!(registry.ref_count(&key), 1);

        drop(stream);

        assert_eq!(registry.ref_count(&key), 0);
        let mut kinds = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let message: serde_json::Value = serde_json::from_str(&text).unwrap();
            kinds.push(message["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["SubscribeDocs", "UnsubscribeDocs"]);
    }
}
