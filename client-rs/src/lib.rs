//! ksbus Rust Client
//!
//! A WebSocket client for the ksbus message bus, providing topic pub/sub,
//! identity-addressed messages and wait-for-reply publishes with optional
//! automatic reconnection.
//!
//! # Example
//!
//! ```no_run
//! use ksbus_client::{BusClient, BusConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BusConfig::new("localhost:9313")
//!         .id("py")
//!         .auto_restart(Duration::from_secs(5))
//!         .on_open(|client| {
//!             let _ = client.publish("greet", &serde_json::json!({"hello": "world"}));
//!         });
//!     let client = BusClient::new(config);
//!
//!     client.connect().await?;
//!
//!     // Handle one message, then stop listening
//!     client.subscribe("greet", |msg, sub| {
//!         println!("Received: {:?}", msg.data());
//!         let _ = sub.unsubscribe();
//!     })?;
//!
//!     // Publish and wait for the receiver's acknowledgment
//!     let reply = client.request("jobs", &serde_json::json!({"task": 7})).await?;
//!     println!("Acknowledged by {:?}", reply.from());
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod correlator;
mod dispatch;
mod error;
mod identity;
mod messages;
pub mod transport;

pub use client::{BusClient, SessionState, Subscription};
pub use config::{BusConfig, OnClose, OnData, OnId, OnOpen, DEFAULT_PATH};
pub use correlator::{OnExpire, OnReply};
pub use dispatch::TopicHandler;
pub use error::{BusError, Result};
pub use identity::{client_identity, correlation_id, random_id};
pub use messages::{BusMessage, ClientMessage, RawEvent, PONG};
pub use transport::{FrameReader, FrameWriter, Transport, WebSocketTransport};
