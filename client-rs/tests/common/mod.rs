//! In-process ksbus server for integration tests
//!
//! Speaks the bus protocol over a real WebSocket: answers `ping` with a pong,
//! tracks subscriptions per connection, fans out `pub` by topic and delivers
//! `pub_id` by identity. Published data is flattened into the delivered frame.

#![allow(dead_code)]

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct Peer {
    id: Option<String>,
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<Message>,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct BusState {
    peers: Mutex<HashMap<u64, Peer>>,
    next_conn: AtomicU64,
    accepted: AtomicUsize,
    frames: Mutex<Vec<Value>>,
}

#[derive(Clone)]
pub struct MockBus {
    pub addr: SocketAddr,
    state: Arc<BusState>,
}

impl MockBus {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock bus");
        Self::serve(listener).await
    }

    /// Serve on an already-bound listener, e.g. to come back on the same port
    pub async fn serve(listener: tokio::net::TcpListener) -> Self {
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(BusState::default());

        let app = Router::new()
            .route("/ws/bus", get(ws_handler))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Every frame received from any client, in arrival order
    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().clone()
    }

    /// Drop every live connection without a close handshake
    pub fn drop_connections(&self) {
        let mut peers = self.state.peers.lock();
        for peer in peers.values_mut() {
            if let Some(kill) = peer.kill.take() {
                let _ = kill.send(());
            }
        }
        peers.clear();
    }

    /// Whether a connection with `id` has subscribed to `topic`
    pub fn has_subscriber(&self, id: &str, topic: &str) -> bool {
        self.state
            .peers
            .lock()
            .values()
            .any(|p| p.id.as_deref() == Some(id) && p.topics.contains(topic))
    }

    /// Poll until `check` holds, panicking after a few seconds
    pub async fn wait_until<F: Fn(&MockBus) -> bool>(&self, check: F) {
        for _ in 0..200 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("mock bus condition not met in time");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<BusState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<BusState>) {
    let (mut sender, mut receiver) = socket.split();
    let conn = state.next_conn.fetch_add(1, Ordering::SeqCst);
    state.accepted.fetch_add(1, Ordering::SeqCst);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (kill_tx, mut kill_rx) = oneshot::channel();
    state.peers.lock().insert(
        conn,
        Peer {
            id: None,
            topics: HashSet::new(),
            tx,
            kill: Some(kill_tx),
        },
    );

    loop {
        tokio::select! {
            _ = &mut kill_rx => return,
            out = rx.recv() => match out {
                Some(msg) => {
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                        handle_frame(&state, conn, frame);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.peers.lock().remove(&conn);
}

fn handle_frame(state: &BusState, conn: u64, frame: Value) {
    state.frames.lock().push(frame.clone());

    let action = frame["action"].as_str().unwrap_or_default();
    let from = frame["from"].as_str().map(str::to_string);
    let topic = frame["topic"].as_str().map(str::to_string);
    let mut peers = state.peers.lock();

    match action {
        "ping" => {
            if let Some(peer) = peers.get_mut(&conn) {
                peer.id = from;
                send_json(peer, json!({"data": "pong"}));
            }
        }
        "sub" => {
            if let (Some(peer), Some(topic)) = (peers.get_mut(&conn), topic) {
                peer.topics.insert(topic);
            }
        }
        "unsub" => {
            if let (Some(peer), Some(topic)) = (peers.get_mut(&conn), topic) {
                peer.topics.remove(&topic);
            }
        }
        "remove" => {
            if let Some(topic) = topic {
                for peer in peers.values_mut() {
                    peer.topics.remove(&topic);
                }
            }
        }
        "pub" => {
            let Some(topic) = topic else { return };
            let out = flatten(frame["data"].clone(), "topic", &topic);
            for peer in peers.values().filter(|p| p.topics.contains(&topic)) {
                send_json(peer, out.clone());
            }
        }
        "pub_id" => {
            let Some(id) = frame["id"].as_str() else { return };
            let out = flatten(frame["data"].clone(), "to_id", id);
            for peer in peers.values().filter(|p| p.id.as_deref() == Some(id)) {
                send_json(peer, out.clone());
            }
        }
        _ => {}
    }
}

fn flatten(data: Value, key: &str, value: &str) -> Value {
    let mut obj = match data {
        Value::Object(obj) => obj,
        other => {
            let mut obj = Map::new();
            obj.insert("data".to_string(), other);
            obj
        }
    };
    obj.insert(key.to_string(), Value::String(value.to_string()));
    Value::Object(obj)
}

fn send_json(peer: &Peer, value: Value) {
    let _ = peer.tx.send(Message::Text(value.to_string().into()));
}
