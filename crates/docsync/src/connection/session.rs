use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{ConnectorEvent, Link};
use crate::protocol::{decode_message, ServerMessage};
use crate::registry::Registry;

/// Lifecycle of the client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Open, waiting for the server to assign a client id
    AwaitingIdentity,
    /// Identified; subscriptions flow
    Ready,
}

/// Receiving ends of the session's observable state
#[derive(Clone)]
pub struct SessionHandle {
    status_rx: watch::Receiver<ConnectionStatus>,
    connected_rx: watch::Receiver<bool>,
    identity_rx: watch::Receiver<Option<String>>,
    side_tx: broadcast::Sender<JsonValue>,
}

impl SessionHandle {
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// `true` exactly while the session is ready
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity_rx.borrow().clone()
    }

    /// Server messages that are neither identity assignments nor document updates
    pub fn side_channel(&self) -> broadcast::Receiver<JsonValue> {
        self.side_tx.subscribe()
    }
}

/// Handshake state machine on top of the connector's raw events
///
/// The only writer of connection state. Every connector event passes through
/// [`Session::handle_event`] in order, which is what makes the handshake, replay and
/// routing one timeline.
pub struct Session {
    registry: Arc<Registry>,
    link: Option<Link>,
    status_tx: watch::Sender<ConnectionStatus>,
    connected_tx: watch::Sender<bool>,
    identity_tx: watch::Sender<Option<String>>,
    side_tx: broadcast::Sender<JsonValue>,
}

impl Session {
    pub fn new(registry: Arc<Registry>, side_channel_capacity: usize) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (connected_tx, _) = watch::channel(false);
        let (identity_tx, _) = watch::channel(None);
        let (side_tx, _) = broadcast::channel(side_channel_capacity);

        Self {
            registry,
            link: None,
            status_tx,
            connected_tx,
            identity_tx,
            side_tx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            status_rx: self.status_tx.subscribe(),
            connected_rx: self.connected_tx.subscribe(),
            identity_rx: self.identity_tx.subscribe(),
            side_tx: self.side_tx.clone(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Consume connector events until the connector goes away
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ConnectorEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }

        self.go_offline();
        debug!("Session driver stopped");
    }

    pub fn handle_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Connecting => {
                if self.link.is_none() {
                    self.set_status(ConnectionStatus::Connecting);
                }
            }
            ConnectorEvent::Open(link) => {
                debug!("Connection #{} open, awaiting client id", link.id());
                self.link = Some(link);
                self.identity_tx.send_replace(None);
                self.set_status(ConnectionStatus::AwaitingIdentity);
            }
            ConnectorEvent::Message(text) => self.handle_message(&text),
            ConnectorEvent::Close => self.go_offline(),
        }
    }

    fn handle_message(&mut self, text: &str) {
        let message = match decode_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding undecodable frame ({}): {}", e, text);
                return;
            }
        };

        match message {
            ServerMessage::ClientId { client_id } => self.identify(client_id),
            ServerMessage::DocUpdate(update) => {
                if self.status() != ConnectionStatus::Ready {
                    debug!(
                        "Ignoring update for '{}/{}' before identification",
                        update.domain, update.name
                    );
                    return;
                }
                self.registry.publish(update);
            }
            ServerMessage::Other(value) => {
                warn!("Unrecognized server message: {}", value);
                if self.side_tx.send(value).is_err() {
                    debug!("No side channel listeners");
                }
            }
        }
    }

    fn identify(&mut self, client_id: String) {
        let Some(link) = self.link.clone() else {
            warn!("Client id '{}' arrived without an open connection", client_id);
            return;
        };

        if self.status() == ConnectionStatus::Ready {
            // Same connection, so the server already holds every announced key
            if self.registry.reidentify(client_id.clone()) {
                info!(
                    "Connection #{} re-identified as '{}'",
                    link.id(),
                    client_id
                );
                self.identity_tx.send_replace(Some(client_id));
            }
            return;
        }

        match self.registry.go_ready(client_id.clone(), link) {
            Ok(replayed) => {
                info!(
                    "Socket connected with client id '{}' ({} subscription(s) announced)",
                    client_id, replayed
                );
                self.identity_tx.send_replace(Some(client_id));
                self.set_status(ConnectionStatus::Ready);
            }
            Err(e) => error!("Failed to enter ready state as '{}': {}", client_id, e),
        }
    }

    fn go_offline(&mut self) {
        self.registry.go_offline();
        if let Some(link) = self.link.take() {
            info!("Connection #{} closed", link.id());
        }
        self.identity_tx.send_replace(None);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        let ready = status == ConnectionStatus::Ready;
        self.connected_tx.send_if_modified(|current| {
            if *current == ready {
                return false;
            }
            *current = ready;
            true
        });
    }
}
