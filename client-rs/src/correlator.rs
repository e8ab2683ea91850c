//! Wait-for-reply correlation
//!
//! A wait-for-reply publish stamps its payload with a fresh `event_id`,
//! registers a [`PendingReply`] under that id as a one-shot route, and arms a
//! deadline. Whichever of reply or deadline reaches the slot first takes the
//! callbacks; the other finds it empty. Exactly one callback fires.

use crate::dispatch::isolate;
use crate::messages::BusMessage;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;

/// Called with the first reply to a wait-for-reply publish
pub type OnReply = Box<dyn FnOnce(BusMessage) + Send>;

/// Called with the correlation id when no reply arrived in time
pub type OnExpire = Box<dyn FnOnce(String) + Send>;

struct Callbacks {
    on_reply: OnReply,
    on_expire: OnExpire,
}

/// An in-flight wait-for-reply publish
pub(crate) struct PendingReply {
    correlation_id: String,
    callbacks: Mutex<Option<Callbacks>>,
}

impl PendingReply {
    pub(crate) fn new<R, E>(correlation_id: String, on_reply: R, on_expire: E) -> Self
    where
        R: FnOnce(BusMessage) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        Self {
            correlation_id,
            callbacks: Mutex::new(Some(Callbacks {
                on_reply: Box::new(on_reply),
                on_expire: Box::new(on_expire),
            })),
        }
    }

    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Deliver the reply. Returns false if the slot already fired.
    pub(crate) fn complete(&self, reply: BusMessage) -> bool {
        let Some(callbacks) = self.callbacks.lock().take() else {
            return false;
        };
        isolate("on_reply", move || (callbacks.on_reply)(reply));
        true
    }

    /// Report expiry. Returns false if the slot already fired.
    pub(crate) fn expire(&self) -> bool {
        let Some(callbacks) = self.callbacks.lock().take() else {
            return false;
        };
        let id = self.correlation_id.clone();
        isolate("on_expire", move || (callbacks.on_expire)(id));
        true
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.callbacks.lock().is_none()
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Stamp `fields` onto a payload. Non-object payloads are wrapped as `{"data": ...}`.
pub(crate) fn stamp(payload: Value, fields: &[(&str, &str)]) -> Value {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        other => {
            let mut obj = Map::new();
            obj.insert("data".to_string(), other);
            obj
        }
    };
    for (key, value) in fields {
        obj.insert((*key).to_string(), Value::String((*value).to_string()));
    }
    Value::Object(obj)
}
