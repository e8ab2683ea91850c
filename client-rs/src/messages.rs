//! Message types for the ksbus wire protocol
//!
//! Frames are JSON objects. Outgoing frames carry an `action` tag; inbound
//! frames are free-form objects carrying some subset of `topic`, `to_id`,
//! `data` and `event_id`.

use crate::error::{BusError, Result};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload the server sends back for a handshake ping
pub const PONG: &str = "pong";

/// Frames sent from client to server
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake
    Ping { from: String },

    /// Subscribe to a topic
    Sub { topic: String, from: String },

    /// Unsubscribe from a topic
    Unsub { topic: String, from: String },

    /// Publish to a topic
    Pub {
        topic: String,
        data: Value,
        from: String,
    },

    /// Publish to a peer identity
    PubId { id: String, data: Value, from: String },

    /// Remove a topic from the server entirely
    Remove { topic: String, from: String },

    /// Ask the server to forward data to another bus server
    PubServer {
        addr: String,
        data: Value,
        secure: bool,
        from: String,
    },
}

/// A decoded inbound message
///
/// The server flattens published data into the frame, so every field of the
/// original object is kept and reachable through [`BusMessage::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusMessage {
    fields: Map<String, Value>,
}

impl BusMessage {
    /// Build a message from an object's fields
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Topic the message was published on
    pub fn topic(&self) -> Option<&str> {
        self.str_field("topic")
    }

    /// Identity the server addressed this message to
    pub fn to_id(&self) -> Option<&str> {
        self.str_field("to_id")
    }

    /// Correlation id of a wait-for-reply publish
    pub fn event_id(&self) -> Option<&str> {
        self.str_field("event_id")
    }

    /// Sender identity, when the publisher stamped one
    pub fn from(&self) -> Option<&str> {
        self.str_field("from")
    }

    /// The `data` field
    pub fn data(&self) -> Option<&Value> {
        self.fields.get("data")
    }

    /// Any field by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True for the server's handshake acknowledgment
    pub fn is_pong(&self) -> bool {
        self.data().and_then(Value::as_str) == Some(PONG)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Inbound traffic that did not reach a handler
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Decoded, but no handler or observer claimed it
    Unrouted(BusMessage),
    /// The frame was not a JSON object
    Malformed { frame: String, error: String },
}

/// Encode an outgoing frame
pub fn encode(msg: &ClientMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode an inbound frame
pub fn decode(frame: &str) -> Result<BusMessage> {
    serde_json::from_str(frame).map_err(|e| BusError::Protocol(e.to_string()))
}
