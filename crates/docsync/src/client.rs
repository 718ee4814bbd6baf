use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ClientOptions;
use crate::connection::{ConnectionStatus, Connector, Session, SessionHandle};
use crate::dispatch::Dispatcher;
use crate::protocol::SubscriptionKey;
use crate::registry::{DocStream, Registry};
use crate::{SyncError, SyncResult};

/// One client instance: a duplex connection with its subscriptions, and a dispatcher
///
/// Everything the client does goes through an explicit instance; several clients can
/// live side by side without sharing state.
///
/// ```no_run
/// # async fn run() -> docsync::SyncResult<()> {
/// use docsync::{ClientOptions, SyncClient};
///
/// let client = SyncClient::new(ClientOptions::new("cloud.example.com"))?;
/// client.connect()?;
///
/// let mut todos = client.observe_doc("todo.app", "list", None)?;
/// while let Some(value) = todos.next_value().await {
///     println!("{:?}", value.fields);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SyncClient {
    options: ClientOptions,
    registry: Arc<Registry>,
    connector: Connector,
    dispatcher: Dispatcher,
    session: SessionHandle,
    pending_session: Mutex<Option<Session>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(options: ClientOptions) -> SyncResult<Self> {
        options.validate()?;

        let registry = Arc::new(Registry::new());
        let session = Session::new(registry.clone(), options.side_channel_capacity);
        let connector = Connector::new(options.ws_url(), options.backoff.clone())?;
        let dispatcher = Dispatcher::new(options.dispatch_url());

        Ok(Self {
            session: session.handle(),
            pending_session: Mutex::new(Some(session)),
            driver: Mutex::new(None),
            options,
            registry,
            connector,
            dispatcher,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Start the duplex connection
    ///
    /// Must be called from within a tokio runtime. A client connects once; calling this
    /// again fails with [`SyncError::AlreadyConnected`], and after [`SyncClient::shutdown`]
    /// with [`SyncError::Shutdown`].
    pub fn connect(&self) -> SyncResult<()> {
        if self.registry.is_closed() {
            return Err(SyncError::Shutdown);
        }

        let mut pending = self
            .pending_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(session) = pending.take() else {
            tracing::error!("Client for {} is already connected", self.options.authority);
            return Err(SyncError::AlreadyConnected);
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.connector.connect(events_tx) {
            *pending = Some(session);
            return Err(e);
        }

        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(tokio::spawn(session.run(events_rx)));

        info!("Client connecting to {}", self.connector.url());
        Ok(())
    }

    /// Send an action over the unary channel
    pub async fn dispatch<A>(&self, action: &A) -> SyncResult<JsonValue>
    where
        A: Serialize + ?Sized,
    {
        self.dispatcher.dispatch(action).await
    }

    /// Send an action over the unary channel and decode the reply into `T`
    pub async fn dispatch_as<T, A>(&self, action: &A) -> SyncResult<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.dispatcher.dispatch_as(action).await
    }

    /// Observe a live document
    ///
    /// Subscribes upstream if this is the document's first consumer and the session is
    /// ready; otherwise the subscription goes out with the next handshake.
    pub fn observe_doc(
        &self,
        domain: impl Into<String>,
        name: impl Into<String>,
        auth: Option<String>,
    ) -> SyncResult<DocStream> {
        self.registry
            .attach(SubscriptionKey::new(domain, name), auth)
            .inspect_err(|e| tracing::warn!("Failed to observe document: {}", e))
    }

    /// Stop observing a document
    ///
    /// Fails with [`SyncError::UnknownSubscription`] for a stream that belongs to another
    /// client.
    pub fn detach(&self, stream: DocStream) -> SyncResult<()> {
        if !stream.belongs_to(&self.registry) {
            tracing::error!(
                "Stream for '{}' does not belong to this client",
                stream.key()
            );
            return Err(SyncError::UnknownSubscription {
                domain: stream.key().domain.clone(),
                name: stream.key().name.clone(),
            });
        }
        stream.detach()
    }

    /// `true` while identified and ready; never repeats a value
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.session.connectivity()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.session.status()
    }

    pub fn is_connected(&self) -> bool {
        *self.session.connectivity().borrow()
    }

    /// Identity assigned by the server on the current connection
    pub fn client_id(&self) -> Option<String> {
        self.session.client_id()
    }

    /// Server messages not handled by the session
    pub fn side_channel(&self) -> broadcast::Receiver<JsonValue> {
        self.session.side_channel()
    }

    /// Keys currently tracked, which is what the next handshake announces
    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.registry.keys()
    }

    /// Close the connection and end every document stream
    pub async fn shutdown(&self) {
        info!("Shutting down client for {}", self.options.authority);
        self.connector.disconnect().await;

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::error!("Session driver error: {}", e);
            }
        }

        self.pending_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.registry.close();
    }
}
