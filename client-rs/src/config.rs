//! Configuration for the ksbus client

use crate::client::BusClient;
use crate::messages::{BusMessage, RawEvent};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default server path of the bus endpoint
pub const DEFAULT_PATH: &str = "/ws/bus";

/// Called with the client once the server answers the handshake ping
pub type OnOpen = Arc<dyn Fn(&BusClient) + Send + Sync>;

/// Called each time a live connection ends
pub type OnClose = Arc<dyn Fn() + Send + Sync>;

/// Receives frames that no handler claimed, and frames that failed to decode
pub type OnData = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Receives messages addressed to this client's identity
pub type OnId = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Configuration for connecting to a ksbus server
#[derive(Clone)]
pub struct BusConfig {
    /// Client identity; generated at client construction when `None`
    pub id: Option<String>,

    /// Server address (e.g., "localhost:9313")
    pub address: String,

    /// Server path of the bus endpoint
    pub path: String,

    /// Use `wss` instead of `ws`
    pub secure: bool,

    /// Whether to reconnect after the connection drops
    pub auto_restart: bool,

    /// Fixed delay between reconnection attempts
    pub restart_every: Duration,

    /// Give up after this many consecutive failed attempts (`None` retries forever)
    pub max_restart_attempts: Option<u32>,

    /// How long a wait-for-reply publish waits before expiring
    pub reply_timeout: Duration,

    pub(crate) on_open: Option<OnOpen>,
    pub(crate) on_close: Option<OnClose>,
    pub(crate) on_data: Option<OnData>,
    pub(crate) on_id: Option<OnId>,
}

impl BusConfig {
    /// Create a new configuration for the given server address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: None,
            address: address.into(),
            path: DEFAULT_PATH.to_string(),
            secure: false,
            auto_restart: false,
            restart_every: Duration::from_secs(5),
            max_restart_attempts: None,
            reply_timeout: Duration::from_millis(500),
            on_open: None,
            on_close: None,
            on_data: None,
            on_id: None,
        }
    }

    /// Use a fixed client identity
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the server path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Connect over TLS (`wss`)
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Reconnect every `interval` after the connection drops
    pub fn auto_restart(mut self, interval: Duration) -> Self {
        self.auto_restart = true;
        self.restart_every = interval;
        self
    }

    /// Cap the number of consecutive reconnection attempts
    pub fn max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = Some(attempts);
        self
    }

    /// Set the wait-for-reply deadline
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Called once the handshake completes
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&BusClient) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Called when a live connection ends
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Observe unrouted and malformed frames
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(RawEvent) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Observe messages addressed directly to this client
    pub fn on_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.on_id = Some(Arc::new(f));
        self
    }

    /// Endpoint URL, `ws(s)://<address><path>`
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}{}", scheme, self.address, path)
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("auto_restart", &self.auto_restart)
            .field("restart_every", &self.restart_every)
            .field("max_restart_attempts", &self.max_restart_attempts)
            .field("reply_timeout", &self.reply_timeout)
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_id", &self.on_id.is_some())
            .finish()
    }
}
