//! The duplex channel: one reconnecting WebSocket per client.
//!
//! [`Connector`] owns the socket and the reconnect loop and reports what happens on it
//! as [`ConnectorEvent`]s. Every successful open hands out a fresh [`Link`], the write
//! half of that one connection. A `Link` outlives its connection harmlessly: once the
//! connection is gone, sends through it are dropped, so nothing written for an old
//! connection can leak into the next one.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::config::BackoffOptions;
use crate::protocol::encode_message;
use crate::{SyncError, SyncResult};

pub mod backoff;
pub mod session;

pub use backoff::Backoff;
pub use session::{ConnectionStatus, Session, SessionHandle};

/// Raw lifecycle of the duplex channel, in the order it happened
#[derive(Debug)]
pub enum ConnectorEvent {
    /// A connection attempt is starting
    Connecting,
    /// A connection opened; the link writes to it
    Open(Link),
    /// A text frame arrived
    Message(String),
    /// The connection closed, errored or never opened
    Close,
}

/// Write half of one open connection
#[derive(Debug, Clone)]
pub struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl Link {
    pub(crate) fn pair(id: u64) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Sequence number of the connection this link writes to
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Send a frame if the connection is still open, otherwise drop it
    ///
    /// Returns whether the frame was handed to the connection.
    pub fn send(&self, payload: String) -> bool {
        if self.tx.send(payload).is_err() {
            debug!("Dropping frame for closed connection #{}", self.id);
            return false;
        }
        true
    }

    pub fn send_message<T: Serialize>(&self, message: &T) -> SyncResult<bool> {
        Ok(self.send(encode_message(message)?))
    }
}

/// Owns the reconnecting WebSocket to one endpoint
pub struct Connector {
    url: String,
    options: BackoffOptions,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Fails with [`SyncError::InvalidConfig`] when `options` do not validate
    pub fn new(url: impl Into<String>, options: BackoffOptions) -> SyncResult<Self> {
        options.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            url: url.into(),
            options,
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start the reconnect loop, reporting to `events`
    ///
    /// Only one loop may run at a time; a second call while it runs fails with
    /// [`SyncError::AlreadyConnected`].
    pub fn connect(&self, events: mpsc::UnboundedSender<ConnectorEvent>) -> SyncResult<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::error!("Connector for {} is already running", self.url);
            return Err(SyncError::AlreadyConnected);
        }

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(run_connector(
            self.url.clone(),
            self.options.clone(),
            events,
            shutdown_rx,
        )));

        Ok(())
    }

    /// Ask the loop to stop without waiting for it
    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Stop the loop, closing the open connection if there is one
    pub async fn disconnect(&self) {
        self.signal_shutdown();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("Connector task error: {}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

async fn run_connector(
    url: String,
    options: BackoffOptions,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(options.clone());
    let mut next_link_id: u64 = 0;

    info!("Starting connector for {}", url);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = backoff.next_delay();
        if !delay.is_zero() {
            info!(
                "Reconnecting to {} in {:?} (consecutive failures: {})",
                url,
                delay,
                backoff.failures()
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }

        let _ = events.send(ConnectorEvent::Connecting);

        let attempt = tokio::select! {
            result = timeout(options.connection_timeout(), connect_async(url.as_str())) => result,
            _ = shutdown.changed() => break,
        };

        let ws_stream = match attempt {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", url, e);
                backoff.record_failure();
                let _ = events.send(ConnectorEvent::Close);
                continue;
            }
            Err(_) => {
                warn!(
                    "Connection to {} timed out after {:?}",
                    url,
                    options.connection_timeout()
                );
                backoff.record_failure();
                let _ = events.send(ConnectorEvent::Close);
                continue;
            }
        };

        next_link_id += 1;
        let (link, mut outbound) = Link::pair(next_link_id);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let opened_at = Instant::now();

        info!("Connection #{} to {} is open", next_link_id, url);
        if events.send(ConnectorEvent::Open(link)).is_err() {
            debug!("Session gone, closing connection #{}", next_link_id);
            let _ = ws_sender.send(Message::Close(None)).await;
            break;
        }

        let stop_requested = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break true;
                }

                Some(payload) = outbound.recv() => {
                    debug!("Sending on connection #{}: {}", next_link_id, payload);
                    if let Err(e) = ws_sender.send(Message::Text(payload)).await {
                        warn!("Failed to send on connection #{}: {}", next_link_id, e);
                        break false;
                    }
                }

                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(ConnectorEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            let _ = events.send(ConnectorEvent::Message(text));
                        }
                        Err(_) => warn!("Discarding non UTF-8 binary frame on connection #{}", next_link_id),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Server closed connection #{}: {:?}", next_link_id, frame);
                        break false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error on connection #{}: {}", next_link_id, e);
                        break false;
                    }
                    None => {
                        info!("Connection #{} ended", next_link_id);
                        break false;
                    }
                },
            }
        };

        let _ = events.send(ConnectorEvent::Close);
        if stop_requested {
            break;
        }
        backoff.record_close(opened_at.elapsed());
    }

    info!("Connector for {} stopped", url);
}
