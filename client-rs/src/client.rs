//! ksbus client implementation

use crate::config::BusConfig;
use crate::correlator::{stamp, PendingReply};
use crate::dispatch::{ack_target, isolate, route, Delivery, HandlerTable, Route, TopicHandler};
use crate::error::{BusError, Result};
use crate::identity;
use crate::messages::{decode, encode, BusMessage, ClientMessage, RawEvent};
use crate::transport::{FrameReader, FrameWriter, Transport, WebSocketTransport};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected, or the last connect attempt failed
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open and handshake sent
    Connected,
    /// Waiting to retry after the connection dropped
    Reconnecting,
    /// Connection ended and will not be retried
    Closed,
}

/// A subscription that can be cancelled without knowing its handler
///
/// Holds a weak back-reference to the client; it never keeps a session alive.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    client: Weak<ClientInner>,
}

impl Subscription {
    /// Get the subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The owning client, if it is still alive
    pub fn client(&self) -> Option<BusClient> {
        self.client.upgrade().map(|inner| BusClient { inner })
    }

    /// Unsubscribe from the topic. Calling this again is a no-op.
    pub fn unsubscribe(&self) -> Result<()> {
        match self.client.upgrade() {
            Some(inner) => inner.unsubscribe(&self.topic),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

/// Internal client state
struct ClientInner {
    config: BusConfig,
    id: String,
    transport: Arc<dyn Transport>,
    state: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,

    // Outbound queue of the live connection, `None` while there is none
    tx: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,

    routes: HandlerTable,

    // Session task: receive loop plus reconnect supervision
    session: Mutex<Option<JoinHandle<()>>>,

    shutdown: CancellationToken,
}

/// One open connection, owned by the session task
struct Link {
    writer: Box<dyn FrameWriter>,
    reader: Box<dyn FrameReader>,
    rx: mpsc::UnboundedReceiver<ClientMessage>,
}

/// Why a receive loop ended
enum LinkEnd {
    /// `close()` was called
    Closed,
    /// The transport failed or the server hung up
    Dropped(BusError),
}

/// Where a wait-for-reply publish is addressed
enum ReplyTarget<'a> {
    Topic(&'a str),
    Id(&'a str),
}

/// ksbus client
///
/// Provides pub/sub messaging, identity-addressed sends and wait-for-reply
/// publishes over one session with optional automatic reconnection.
/// This struct is cheaply cloneable as it uses an internal Arc.
///
/// Sending methods are fire-and-forget and may be called from inside
/// handlers. Methods that arm a deadline must run inside a Tokio runtime.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for BusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusClient")
            .field("id", &self.inner.id)
            .field("url", &self.inner.config.url())
            .field("state", &*self.inner.state_rx.borrow())
            .finish()
    }
}

impl BusClient {
    /// Create a new client that connects over WebSocket
    pub fn new(config: BusConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    /// Create a new client on a custom transport
    pub fn with_transport(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let id = config.id.clone().unwrap_or_else(identity::client_identity);

        let inner = Arc::new(ClientInner {
            config,
            id,
            transport,
            state: state_tx,
            state_rx,
            tx: Mutex::new(None),
            routes: HandlerTable::new(),
            session: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        Self { inner }
    }

    /// This client's identity on the bus
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for session state changes
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Whether a handler or pending reply is registered under `topic`
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.routes.contains(topic)
    }

    /// Connect to the bus server
    ///
    /// Opens the transport, sends the handshake ping and starts the receive
    /// loop. The `on_open` callback fires once the server answers the ping.
    /// A failed first connect is returned to the caller and not retried.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Shutdown);
        }

        let current_state = self.state();
        if current_state != SessionState::Disconnected && current_state != SessionState::Closed {
            return Err(BusError::Connection(format!(
                "Cannot connect in state: {:?}",
                current_state
            )));
        }

        let link = match self.inner.open().await {
            Ok(link) => link,
            Err(e) => {
                // close() during the connect already left the session Closed
                if !self.inner.shutdown.is_cancelled() {
                    self.inner.set_state(SessionState::Disconnected);
                }
                return Err(e);
            }
        };
        info!(id = %self.inner.id, url = %self.inner.config.url(), "Connected");

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_session(inner, link));
        *self.inner.session.lock() = Some(handle);

        Ok(())
    }

    /// Close the session
    ///
    /// Frames already queued are written out before the transport is released.
    /// In-flight wait-for-reply publishes expire. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.detach();

        let session = self.inner.session.lock().take();
        if let Some(handle) = session {
            let _ = handle.await;
        }

        for pending in self.inner.routes.drain_replies() {
            pending.expire();
        }

        self.inner.set_state(SessionState::Closed);
        Ok(())
    }

    /// Subscribe to a topic
    ///
    /// The handler is called for each message on the topic with a handle that
    /// can unsubscribe it. Registering again on the same topic replaces the
    /// handler.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&BusMessage, &Subscription) + Send + Sync + 'static,
    {
        validate_topic(topic)?;

        let handler: TopicHandler = Arc::new(handler);
        self.inner.routes.insert(topic, Route::Topic(handler));

        // A failed announce is logged by send(); the next connect announces it again
        if self.inner.is_linked() {
            let _ = self.inner.send(ClientMessage::Sub {
                topic: topic.to_string(),
                from: self.inner.id.clone(),
            });
        }

        Ok(Subscription {
            topic: topic.to_string(),
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Unsubscribe from a topic. Unknown topics are a no-op.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.unsubscribe(topic)
    }

    /// Remove a topic from the server entirely, and drop its local handler
    pub fn remove_topic(&self, topic: &str) -> Result<()> {
        validate_topic(topic)?;

        self.inner.routes.remove(topic);
        self.inner.send(ClientMessage::Remove {
            topic: topic.to_string(),
            from: self.inner.id.clone(),
        })
    }

    /// Publish data to a topic
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> Result<()> {
        validate_topic(topic)?;

        let data = serde_json::to_value(data)?;
        self.inner.send(ClientMessage::Pub {
            topic: topic.to_string(),
            data,
            from: self.inner.id.clone(),
        })
    }

    /// Publish data to one peer identity
    pub fn publish_to_id<T: Serialize + ?Sized>(&self, id: &str, data: &T) -> Result<()> {
        validate_identity(id)?;

        let data = serde_json::to_value(data)?;
        self.inner.send(ClientMessage::PubId {
            id: id.to_string(),
            data,
            from: self.inner.id.clone(),
        })
    }

    /// Ask the connected server to forward data to another bus server
    pub fn publish_to_server<T: Serialize + ?Sized>(
        &self,
        addr: &str,
        data: &T,
        secure: bool,
    ) -> Result<()> {
        if addr.is_empty() {
            return Err(BusError::InvalidTopic("server address cannot be empty".into()));
        }

        let data = serde_json::to_value(data)?;
        self.inner.send(ClientMessage::PubServer {
            addr: addr.to_string(),
            data,
            secure,
            from: self.inner.id.clone(),
        })
    }

    /// Publish to a topic and wait for one reply
    ///
    /// Exactly one of `on_reply` or `on_expire` is called: `on_reply` with the
    /// first message on the correlation topic, or `on_expire` with the
    /// correlation id once `reply_timeout` elapses. Returns the correlation id.
    pub fn publish_wait_recv<T, R, E>(
        &self,
        topic: &str,
        data: &T,
        on_reply: R,
        on_expire: E,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        R: FnOnce(BusMessage) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        validate_topic(topic)?;
        self.inner
            .publish_wait_recv(ReplyTarget::Topic(topic), data, on_reply, on_expire)
    }

    /// Publish to a peer identity and wait for one reply
    ///
    /// Same correlation mechanics as [`BusClient::publish_wait_recv`].
    pub fn publish_to_id_wait_recv<T, R, E>(
        &self,
        id: &str,
        data: &T,
        on_reply: R,
        on_expire: E,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        R: FnOnce(BusMessage) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        validate_identity(id)?;
        self.inner
            .publish_wait_recv(ReplyTarget::Id(id), data, on_reply, on_expire)
    }

    /// Publish to a topic and await the reply
    ///
    /// Returns `BusError::Timeout` if no reply arrives within `reply_timeout`.
    pub async fn request<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> Result<BusMessage> {
        let (on_reply, on_expire, rx) = reply_channel();
        self.publish_wait_recv(topic, data, on_reply, on_expire)?;
        rx.await.map_err(|_| BusError::Shutdown)?
    }

    /// Publish to a peer identity and await the reply
    pub async fn request_id<T: Serialize + ?Sized>(&self, id: &str, data: &T) -> Result<BusMessage> {
        let (on_reply, on_expire, rx) = reply_channel();
        self.publish_to_id_wait_recv(id, data, on_reply, on_expire)?;
        rx.await.map_err(|_| BusError::Shutdown)?
    }
}

type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Result<BusMessage>>>>>;

/// Callback pair that resolves a oneshot with the reply or a timeout
fn reply_channel() -> (
    impl FnOnce(BusMessage) + Send + 'static,
    impl FnOnce(String) + Send + 'static,
    oneshot::Receiver<Result<BusMessage>>,
) {
    let (tx, rx) = oneshot::channel();
    let slot: ReplySlot = Arc::new(Mutex::new(Some(tx)));
    let expire_slot = slot.clone();

    let on_reply = move |msg: BusMessage| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(Ok(msg));
        }
    };
    let on_expire = move |_id: String| {
        if let Some(tx) = expire_slot.lock().take() {
            let _ = tx.send(Err(BusError::Timeout));
        }
    };
    (on_reply, on_expire, rx)
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BusError::InvalidTopic("topic cannot be empty".into()));
    }
    Ok(())
}

fn validate_identity(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BusError::InvalidTopic("target id cannot be empty".into()));
    }
    Ok(())
}

impl ClientInner {
    fn set_state(&self, state: SessionState) {
        let _ = self.state.send(state);
    }

    fn is_linked(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Drop the outbound queue of the current connection
    fn detach(&self) {
        *self.tx.lock() = None;
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        let tx = self.tx.lock().clone();
        let result = match tx {
            Some(tx) => tx.send(msg).map_err(|_| BusError::NotConnected),
            None => Err(BusError::NotConnected),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Dropping outgoing frame");
        }
        result
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self.routes.remove(topic).is_none() {
            debug!(topic = %topic, "Unsubscribe for unknown topic");
        }

        if self.is_linked() {
            self.send(ClientMessage::Unsub {
                topic: topic.to_string(),
                from: self.id.clone(),
            })?;
        }
        Ok(())
    }

    fn publish_wait_recv<T, R, E>(
        self: &Arc<Self>,
        target: ReplyTarget<'_>,
        data: &T,
        on_reply: R,
        on_expire: E,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        R: FnOnce(BusMessage) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        let data = serde_json::to_value(data)?;
        let event_id = identity::correlation_id();

        // Registered before anything is sent so a fast reply finds its slot
        let pending = Arc::new(PendingReply::new(event_id.clone(), on_reply, on_expire));
        self.routes.insert(&event_id, Route::Reply(pending.clone()));

        if self.is_linked() {
            let _ = self.send(ClientMessage::Sub {
                topic: event_id.clone(),
                from: self.id.clone(),
            });
        }

        let msg = match target {
            ReplyTarget::Topic(topic) => ClientMessage::Pub {
                topic: topic.to_string(),
                data: stamp(
                    data,
                    &[
                        ("from", self.id.as_str()),
                        ("topic", topic),
                        ("event_id", event_id.as_str()),
                    ],
                ),
                from: self.id.clone(),
            },
            ReplyTarget::Id(id) => ClientMessage::PubId {
                id: id.to_string(),
                data: stamp(
                    data,
                    &[
                        ("from", self.id.as_str()),
                        ("id", id),
                        ("event_id", event_id.as_str()),
                    ],
                ),
                from: self.id.clone(),
            },
        };
        // A send failure is left to the deadline, which reports expiry
        let _ = self.send(msg);

        let inner = self.clone();
        let timeout = self.config.reply_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = inner.shutdown.cancelled() => {}
            }
            inner.retire_reply(&pending);
        });

        Ok(event_id)
    }

    /// Retract an unanswered reply slot and report its expiry
    fn retire_reply(&self, pending: &Arc<PendingReply>) {
        let id = pending.correlation_id();
        if self.routes.remove_reply(id, pending) && self.is_linked() {
            let _ = self.send(ClientMessage::Unsub {
                topic: id.to_string(),
                from: self.id.clone(),
            });
        }
        if pending.expire() {
            debug!(event_id = %id, "Reply expired");
        }
    }

    /// Open the transport and send the handshake ping
    async fn open(&self) -> Result<Link> {
        self.set_state(SessionState::Connecting);

        let url = self.config.url();
        let (mut writer, reader) = tokio::select! {
            result = self.transport.connect(&url) => result?,
            _ = self.shutdown.cancelled() => return Err(BusError::Shutdown),
        };

        let ping = encode(&ClientMessage::Ping {
            from: self.id.clone(),
        })?;
        writer.send(ping).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        self.set_state(SessionState::Connected);

        self.announce_routes();

        Ok(Link { writer, reader, rx })
    }

    /// Tell a freshly connected server about every registered topic
    fn announce_routes(&self) {
        let topics = self.routes.topics();
        if !topics.is_empty() {
            debug!(count = topics.len(), "Announcing subscriptions");
        }
        for topic in topics {
            if let Err(e) = self.send(ClientMessage::Sub {
                topic: topic.clone(),
                from: self.id.clone(),
            }) {
                warn!(topic = %topic, error = %e, "Failed to resubscribe");
            }
        }
    }

    /// Receive loop for one connection
    async fn drive(self: &Arc<Self>, link: &mut Link) -> LinkEnd {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    flush(link).await;
                    return LinkEnd::Closed;
                }

                msg = link.rx.recv() => match msg {
                    Some(msg) => {
                        let frame = match encode(&msg) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode frame");
                                continue;
                            }
                        };
                        if let Err(e) = link.writer.send(frame).await {
                            return LinkEnd::Dropped(e);
                        }
                    }
                    None => return LinkEnd::Closed,
                },

                frame = link.reader.recv() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => return LinkEnd::Dropped(e),
                    None => {
                        return LinkEnd::Dropped(BusError::Connection(
                            "Connection closed by server".into(),
                        ));
                    }
                },
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: &str) {
        match decode(frame) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => {
                warn!(error = %e, "Failed to parse message");
                self.observe(RawEvent::Malformed {
                    frame: frame.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn dispatch(self: &Arc<Self>, msg: BusMessage) {
        if let Some(event_id) = ack_target(&msg) {
            let _ = self.send(ClientMessage::Pub {
                topic: event_id.to_string(),
                data: json!({"ok": "done", "from": self.id}),
                from: self.id.clone(),
            });
        }

        match route(&self.routes, &msg) {
            Delivery::Targeted => match &self.config.on_id {
                Some(on_id) => isolate("on_id", || on_id(&msg)),
                None => self.observe(RawEvent::Unrouted(msg)),
            },
            Delivery::Route {
                topic,
                route: Route::Topic(handler),
            } => {
                let sub = Subscription {
                    topic,
                    client: Arc::downgrade(self),
                };
                isolate("topic handler", || handler(&msg, &sub));
            }
            Delivery::Route {
                topic,
                route: Route::Reply(pending),
            } => {
                if self.routes.remove_reply(&topic, &pending) {
                    let _ = self.send(ClientMessage::Unsub {
                        topic,
                        from: self.id.clone(),
                    });
                }
                pending.complete(msg);
            }
            Delivery::Handshake => {
                debug!("Handshake complete");
                if let Some(on_open) = &self.config.on_open {
                    let client = BusClient {
                        inner: self.clone(),
                    };
                    isolate("on_open", || on_open(&client));
                }
            }
            Delivery::Unrouted => {
                debug!(topic = ?msg.topic(), "No handler for message");
                self.observe(RawEvent::Unrouted(msg));
            }
        }
    }

    fn observe(&self, event: RawEvent) {
        if let Some(on_data) = &self.config.on_data {
            isolate("on_data", || on_data(event));
        }
    }

    /// Retry the connection at a fixed interval until it opens, the attempt
    /// cap is hit, or the client is closed
    async fn reconnect(&self) -> Option<Link> {
        let interval = self.config.restart_every;
        let mut attempt = 0u32;

        loop {
            if let Some(max) = self.config.max_restart_attempts {
                if attempt >= max {
                    warn!(attempts = attempt, "Giving up reconnecting");
                    return None;
                }
            }

            self.set_state(SessionState::Reconnecting);
            info!("Reconnecting in {:?}...", interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.cancelled() => return None,
            }

            attempt += 1;
            match self.open().await {
                Ok(link) => {
                    info!(attempt, "Reconnected");
                    return Some(link);
                }
                Err(BusError::Shutdown) => return None,
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

/// Write out frames queued before `close()`
async fn flush(link: &mut Link) {
    while let Ok(msg) = link.rx.try_recv() {
        let Ok(frame) = encode(&msg) else { continue };
        if link.writer.send(frame).await.is_err() {
            return;
        }
    }
}

/// Empty the outbound queue of a dead connection, returning how many frames it held
fn discard_queued(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> usize {
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// Session task: drive the receive loop, and reconnect when it drops
async fn run_session(inner: Arc<ClientInner>, mut link: Link) {
    loop {
        let end = inner.drive(&mut link).await;
        inner.detach();

        if let Some(on_close) = &inner.config.on_close {
            isolate("on_close", || on_close());
        }

        match end {
            LinkEnd::Closed => {
                if let Err(e) = link.writer.close().await {
                    debug!(error = %e, "Close frame not delivered");
                }
                inner.set_state(SessionState::Closed);
                return;
            }
            LinkEnd::Dropped(e) => {
                warn!(error = %e, "Connection lost");
                let dropped = discard_queued(&mut link.rx);
                if dropped > 0 {
                    warn!(dropped, "Dropping frames queued on the lost connection");
                }
                drop(link);

                if !inner.config.auto_restart || inner.shutdown.is_cancelled() {
                    inner.set_state(SessionState::Closed);
                    return;
                }

                match inner.reconnect().await {
                    Some(next) => link = next,
                    None => {
                        inner.set_state(SessionState::Closed);
                        return;
                    }
                }
            }
        }
    }
}
