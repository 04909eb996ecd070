//! Subscription registry and inbound dispatch
//!
//! Holds the filter-to-handler table in registration order, validates
//! topic filters before anything touches the wire, matches inbound topics
//! with MQTT wildcard semantics, and runs handlers with panic isolation
//! so one bad handler cannot take down the read loop or its neighbours.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{error, trace};

use crate::codec::QoS;
use crate::error::{MqttError, MqttResult};

/// Callback invoked for every inbound message matching a subscription
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// An inbound application message as delivered to handlers
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

struct Subscription {
    filter: String,
    granted_qos: QoS,
    handler: MessageHandler,
}

/// Filter-to-handler table; stable registration order
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for `filter`, replacing any handler already
    /// registered for the identical filter string.
    pub fn insert(&self, filter: String, granted_qos: QoS, handler: MessageHandler) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(existing) = subscriptions.iter_mut().find(|s| s.filter == filter) {
            existing.granted_qos = granted_qos;
            existing.handler = handler;
        } else {
            subscriptions.push(Subscription {
                filter,
                granted_qos,
                handler,
            });
        }
    }

    /// Remove the mapping for `filter`. Returns whether it existed.
    pub fn remove(&self, filter: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.filter != filter);
        subscriptions.len() < before
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.filter == filter)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().unwrap().is_empty()
    }

    /// Run every matching handler for `message`, in registration order.
    ///
    /// A panicking handler is caught and logged; the remaining handlers
    /// still run. Returns how many handlers ran.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        // Clone the matching handlers out so user code never runs under
        // the registry lock.
        let matching: Vec<(String, MessageHandler)> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
                .map(|s| (s.filter.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        trace!(
            topic = %message.topic,
            handlers = matching.len(),
            "dispatching inbound message"
        );
        for (filter, handler) in &matching {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(
                    filter = %filter,
                    topic = %message.topic,
                    "message handler panicked"
                );
            }
        }
        matching.len()
    }
}

/// Validate an MQTT topic filter: `#` only as the final level, `+` only as
/// a whole level, no empty filter.
pub fn validate_filter(filter: &str) -> MqttResult<()> {
    if filter.is_empty() {
        return Err(MqttError::InvalidFilter("filter is empty".to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if *level == "#" {
            if index != levels.len() - 1 {
                return Err(MqttError::InvalidFilter(format!(
                    "'#' must be the final level in {filter:?}"
                )));
            }
        } else if level.contains('#') {
            return Err(MqttError::InvalidFilter(format!(
                "'#' must occupy a whole level in {filter:?}"
            )));
        } else if level.contains('+') && *level != "+" {
            return Err(MqttError::InvalidFilter(format!(
                "'+' must occupy a whole level in {filter:?}"
            )));
        }
    }
    Ok(())
}

/// MQTT topic-filter matching: `+` matches exactly one level, `#` matches
/// all remaining levels including the parent, and wildcards never match
/// topics starting with `$` unless the filter itself starts with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && !filter.starts_with('$') {
        return filter == topic;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "a/#" also matches the parent "a".
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (Some(_), Some(_)) => return false,
            (Some(_), None) | (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}
