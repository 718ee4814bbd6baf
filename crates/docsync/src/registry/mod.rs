//! Ref-counted live document subscriptions.
//!
//! The registry owns one entry per [`SubscriptionKey`]. The first consumer of a key
//! creates the entry and the last one to detach removes it. Upstream traffic follows the
//! same edges: a subscribe on 0→1, an unsubscribe on 1→0, and nothing in between.
//!
//! While the session is ready the registry also holds the upstream [`Link`] and the set
//! of keys announced on it. Attach, detach and the ready/offline transitions all run
//! under the same lock, so a key that gains its first consumer is either part of the
//! replay or subscribed on its own, never both and never neither.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::connection::Link;
use crate::protocol::{ClientMessage, DocUpdate, SubscriptionKey};
use crate::{SyncError, SyncResult};

pub mod stream;

pub use stream::{DocStream, DocValue};

pub(crate) type HandleId = u64;

struct Entry {
    auth: Option<String>,
    latest: Option<DocValue>,
    consumers: Vec<(HandleId, mpsc::UnboundedSender<DocValue>)>,
}

/// Identified connection the registry announces subscriptions on
struct Upstream {
    client_id: String,
    link: Link,
    announced: HashSet<SubscriptionKey>,
}

impl Upstream {
    fn subscribe(&mut self, key: &SubscriptionKey, auth: Option<&String>) -> SyncResult<()> {
        if !self.announced.insert(key.clone()) {
            error!("Refusing duplicate subscribe for '{}'", key);
            return Err(SyncError::Protocol {
                message: format!("Duplicate subscribe for '{}'", key),
            });
        }

        self.link.send_message(&ClientMessage::SubscribeDocs {
            domain: key.domain.clone(),
            docs: vec![key.name.clone()],
            client_id: self.client_id.clone(),
            auth: auth.cloned(),
        })?;
        Ok(())
    }

    fn unsubscribe(&mut self, key: &SubscriptionKey) -> SyncResult<()> {
        if !self.announced.remove(key) {
            error!("Unsubscribe for '{}' which was never announced", key);
            return Err(SyncError::Protocol {
                message: format!("Unsubscribe for unannounced '{}'", key),
            });
        }

        self.link.send_message(&ClientMessage::UnsubscribeDocs {
            domain: key.domain.clone(),
            docs: vec![key.name.clone()],
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionKey, Entry>,
    upstream: Option<Upstream>,
    next_handle: HandleId,
    closed: bool,
}

/// Owns every live document entry of a client
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a consumer to a document, creating its entry if needed
    ///
    /// A key that is already live is shared when `auth` matches the token it was first
    /// attached with and rejected with [`SyncError::AuthMismatch`] otherwise.
    pub fn attach(
        self: &Arc<Self>,
        key: SubscriptionKey,
        auth: Option<String>,
    ) -> SyncResult<DocStream> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            return Err(SyncError::Shutdown);
        }

        let handle = state.next_handle;
        let (tx, rx) = mpsc::unbounded_channel();

        match state.entries.get_mut(&key) {
            Some(entry) => {
                if entry.auth != auth {
                    return Err(SyncError::AuthMismatch {
                        domain: key.domain,
                        name: key.name,
                    });
                }
                if let Some(latest) = &entry.latest {
                    let _ = tx.send(latest.clone());
                }
                entry.consumers.push((handle, tx));
                debug!(
                    "Attached consumer {} to '{}' ({} consumers)",
                    handle,
                    key,
                    entry.consumers.len()
                );
            }
            None => {
                if let Some(upstream) = state.upstream.as_mut() {
                    upstream.subscribe(&key, auth.as_ref())?;
                }
                info!("Subscribing to '{}'", key);
                state.entries.insert(
                    key.clone(),
                    Entry {
                        auth,
                        latest: None,
                        consumers: vec![(handle, tx)],
                    },
                );
            }
        }

        state.next_handle += 1;
        Ok(DocStream::new(key, handle, self.clone(), rx))
    }

    /// Detach one consumer, removing the entry when it was the last
    pub(crate) fn detach(&self, key: &SubscriptionKey, handle: HandleId) -> SyncResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            return Ok(());
        }

        let unknown = || {
            error!("Detach of unknown consumer {} for '{}'", handle, key);
            SyncError::UnknownSubscription {
                domain: key.domain.clone(),
                name: key.name.clone(),
            }
        };

        let entry = state.entries.get_mut(key).ok_or_else(unknown)?;
        let position = entry
            .consumers
            .iter()
            .position(|(id, _)| *id == handle)
            .ok_or_else(unknown)?;
        entry.consumers.remove(position);

        if !entry.consumers.is_empty() {
            debug!(
                "Detached consumer {} from '{}' ({} consumers left)",
                handle,
                key,
                entry.consumers.len()
            );
            return Ok(());
        }

        state.entries.remove(key);
        info!("Unsubscribing from '{}'", key);
        match state.upstream.as_mut() {
            Some(upstream) => upstream.unsubscribe(key),
            None => Ok(()),
        }
    }

    /// Enter the ready state on a freshly identified connection
    ///
    /// Announces every tracked key, one `SubscribeDocs` per (domain, auth) group, before
    /// anything else can be sent on `link`. Returns the number of keys announced.
    pub fn go_ready(&self, client_id: String, link: Link) -> SyncResult<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            return Err(SyncError::Shutdown);
        }

        let mut groups: BTreeMap<(String, Option<String>), Vec<String>> = BTreeMap::new();
        for (key, entry) in &state.entries {
            groups
                .entry((key.domain.clone(), entry.auth.clone()))
                .or_default()
                .push(key.name.clone());
        }

        let upstream = Upstream {
            client_id,
            link,
            announced: state.entries.keys().cloned().collect(),
        };
        let announced = upstream.announced.len();

        for ((domain, auth), mut docs) in groups {
            docs.sort();
            debug!("Replaying {} subscription(s) for domain '{}'", docs.len(), domain);
            upstream.link.send_message(&ClientMessage::SubscribeDocs {
                domain,
                docs,
                client_id: upstream.client_id.clone(),
                auth,
            })?;
        }

        info!(
            "Session ready as '{}', replayed {} subscription(s)",
            upstream.client_id, announced
        );
        state.upstream = Some(upstream);
        Ok(announced)
    }

    /// Adopt a new client id on the connection that is already ready
    ///
    /// Announced keys stay announced; only later subscribes carry the new id. Returns
    /// `false` when not ready.
    pub fn reidentify(&self, client_id: String) -> bool {
        match self.lock().upstream.as_mut() {
            Some(upstream) => {
                upstream.client_id = client_id;
                true
            }
            None => false,
        }
    }

    /// Leave the ready state; the server forgets every subscription with the connection
    pub fn go_offline(&self) {
        if self.lock().upstream.take().is_some() {
            debug!("Registry offline");
        }
    }

    /// Deliver a pushed value to every consumer of its document
    ///
    /// Returns whether a live entry took the value.
    pub fn publish(&self, update: DocUpdate) -> bool {
        let mut state = self.lock();

        if state.upstream.is_none() {
            debug!(
                "Ignoring update for '{}/{}' while not ready",
                update.domain, update.name
            );
            return false;
        }

        let key = update.key();
        let Some(entry) = state.entries.get_mut(&key) else {
            debug!("No subscription for update of '{}'", key);
            return false;
        };

        let value: DocValue = Arc::new(update);
        entry.latest = Some(value.clone());
        for (handle, consumer) in &entry.consumers {
            if consumer.send(value.clone()).is_err() {
                debug!("Consumer {} of '{}' is gone", handle, key);
            }
        }
        true
    }

    /// Drop every entry and refuse further attaches
    ///
    /// Consumers see their streams end.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.upstream = None;
        let count = state.entries.len();
        state.entries.clear();
        info!("Registry closed with {} live subscription(s)", count);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_ready(&self) -> bool {
        self.lock().upstream.is_some()
    }

    /// Every tracked key; the replay set of the next handshake
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.lock()
            .entries
            .get(key)
            .map(|entry| entry.consumers.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
