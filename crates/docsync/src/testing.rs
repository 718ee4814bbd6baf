//! In-process sync server for tests.
//!
//! Speaks the server side of the duplex protocol over an axum WebSocket route: greets
//! each connection with a fresh `ClientId` (unless started silent), records every
//! client message, and lets a test push frames to or drop the current connection.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) enum ServerCommand {
    /// Send a JSON frame on the current connection
    Send(JsonValue),
    /// Close the current connection
    Drop,
}

#[derive(Clone)]
struct MockState {
    greet: bool,
    connections: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>>,
    client_ids: Arc<Mutex<Vec<String>>>,
    received_tx: mpsc::UnboundedSender<JsonValue>,
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    state: MockState,
    received_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JsonValue>>,
}

impl MockServer {
    /// Server that assigns a client id as soon as a connection opens
    pub(crate) async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Server that stays quiet until told what to send
    pub(crate) async fn start_silent() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(greet: bool) -> Self {
        init_tracing();

        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let state = MockState {
            greet,
            connections: Arc::new(AtomicUsize::new(0)),
            current: Arc::new(Mutex::new(None)),
            client_ids: Arc::new(Mutex::new(Vec::new())),
            received_tx,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/", get(websocket_handler))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            received_rx: tokio::sync::Mutex::new(received_rx),
        }
    }

    pub(crate) fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Client ids handed out so far, oldest first
    pub(crate) fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().unwrap().clone()
    }

    /// Wait until a connection is being served
    pub(crate) async fn wait_for_connection(&self) {
        for _ in 0..500 {
            let open = self
                .state
                .current
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|sender| !sender.is_closed());
            if open {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("No connection was opened");
    }

    pub(crate) fn command(&self, command: ServerCommand) {
        let current = self.state.current.lock().unwrap();
        let sender = current.as_ref().expect("No open connection");
        sender.send(command).ok().expect("Connection task ended");
    }

    pub(crate) fn send(&self, message: JsonValue) {
        self.command(ServerCommand::Send(message));
    }

    pub(crate) fn doc_update(&self, domain: &str, name: &str, value: JsonValue) {
        self.send(json!({ "type": "DocUpdate", "domain": domain, "name": name, "value": value }));
    }

    /// Wait for the next message a client sent
    pub(crate) async fn next_client_message(&self) -> JsonValue {
        let mut received = self.received_rx.lock().await;
        timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("Should receive client message")
            .expect("Server should still be running")
    }

    /// Next client message if one arrives within a short grace period
    pub(crate) async fn try_client_message(&self) -> Option<JsonValue> {
        let mut received = self.received_rx.lock().await;
        timeout(Duration::from_millis(150), received.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(socket: WebSocket, state: MockState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    *state.current.lock().unwrap() = Some(command_tx);

    if state.greet {
        let client_id = Uuid::new_v4().to_string();
        state.client_ids.lock().unwrap().push(client_id.clone());
        let greeting = json!({ "type": "ClientId", "clientId": client_id });
        if ws_sender
            .send(Message::Text(greeting.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(ServerCommand::Send(message)) => {
                    if ws_sender.send(Message::Text(message.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Drop) | None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(message) = serde_json::from_str::<JsonValue>(text.as_str()) {
                        let _ = state.received_tx.send(message);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
