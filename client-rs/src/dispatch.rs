//! Topic routing
//!
//! The [`HandlerTable`] maps a topic to exactly one [`Route`]: a regular
//! subscription handler, or the one-shot reply slot of a wait-for-reply
//! publish registered under its correlation id. [`route`] decides where an
//! inbound message goes; the session performs the delivery.

use crate::client::Subscription;
use crate::correlator::PendingReply;
use crate::messages::BusMessage;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Handler for messages on a subscribed topic
pub type TopicHandler = Arc<dyn Fn(&BusMessage, &Subscription) + Send + Sync>;

/// What a topic in the table resolves to
#[derive(Clone)]
pub(crate) enum Route {
    /// Long-lived subscription
    Topic(TopicHandler),
    /// Single-fire reply slot keyed by correlation id
    Reply(Arc<PendingReply>),
}

/// Where an inbound message should be delivered
pub(crate) enum Delivery {
    /// Addressed to this client's identity; bypasses the table
    Targeted,
    /// A registered route for the message's topic
    Route { topic: String, route: Route },
    /// Handshake acknowledgment
    Handshake,
    /// Nothing claims it
    Unrouted,
}

/// Topic → route mapping owned by one session
#[derive(Default)]
pub(crate) struct HandlerTable {
    routes: Mutex<HashMap<String, Route>>,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for `topic`
    pub(crate) fn insert(&self, topic: &str, route: Route) {
        self.routes.lock().insert(topic.to_string(), route);
    }

    pub(crate) fn get(&self, topic: &str) -> Option<Route> {
        self.routes.lock().get(topic).cloned()
    }

    pub(crate) fn contains(&self, topic: &str) -> bool {
        self.routes.lock().contains_key(topic)
    }

    /// Remove whatever is registered under `topic`. Absent topics are a no-op.
    pub(crate) fn remove(&self, topic: &str) -> Option<Route> {
        self.routes.lock().remove(topic)
    }

    /// Remove the reply slot under `topic` only if it is still `pending`
    pub(crate) fn remove_reply(&self, topic: &str, pending: &Arc<PendingReply>) -> bool {
        let mut routes = self.routes.lock();
        let same = matches!(routes.get(topic), Some(Route::Reply(p)) if Arc::ptr_eq(p, pending));
        if same {
            routes.remove(topic);
        }
        same
    }

    /// Take every reply slot out of the table
    pub(crate) fn drain_replies(&self) -> Vec<Arc<PendingReply>> {
        let mut routes = self.routes.lock();
        let ids: Vec<String> = routes
            .iter()
            .filter(|(_, route)| matches!(route, Route::Reply(_)))
            .map(|(topic, _)| topic.clone())
            .collect();

        ids.iter()
            .filter_map(|id| match routes.remove(id) {
                Some(Route::Reply(pending)) => Some(pending),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.routes.lock().keys().cloned().collect()
    }
}

/// Decide where `msg` goes.
///
/// Identity-addressed messages win over topic routing: the server may tag a
/// point-to-point message with a topic for context only.
pub(crate) fn route(table: &HandlerTable, msg: &BusMessage) -> Delivery {
    if msg.to_id().is_some() {
        return Delivery::Targeted;
    }

    if let Some(topic) = msg.topic() {
        return match table.get(topic) {
            Some(route) => Delivery::Route {
                topic: topic.to_string(),
                route,
            },
            None => Delivery::Unrouted,
        };
    }

    if msg.is_pong() {
        return Delivery::Handshake;
    }

    Delivery::Unrouted
}

/// Correlation id to acknowledge, for messages carrying both `topic` and `event_id`
pub(crate) fn ack_target(msg: &BusMessage) -> Option<&str> {
    msg.topic()?;
    msg.event_id()
}

/// Run a user callback, logging instead of unwinding into the receive loop
pub(crate) fn isolate<F: FnOnce()>(callback: &'static str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let msg = panic
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| panic.downcast_ref::<&str>().copied())
            .unwrap_or("unknown panic");
        error!(callback, "Callback panicked: {}", msg);
    }
}
