//! Topic bus with MQTT-style filters.
//!
//! `topic_matches` is the single filter matcher used by the cloud connector to
//! route inbound publishes, and `LocalBus` is an in-process broker stand-in that
//! honours the same wildcard rules (`+` for one level, `#` for the remainder).

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    /// Subscribe to every topic matching `filter`.
    fn subscribe(&self, filter: &str) -> BusResult<broadcast::Receiver<BusMessage>>;
    /// Publish to all matching subscriptions; returns how many received it.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
}

/// Reject filters a broker would refuse: empty filters, `#` anywhere but the
/// last level, and wildcards sharing a level with other characters.
pub fn validate_filter(filter: &str) -> BusResult<()> {
    if filter.is_empty() {
        return Err(BusError::InvalidFilter(filter.to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let multi = level.contains('#');
        let single = level.contains('+');
        if multi && (*level != "#" || index != levels.len() - 1) {
            return Err(BusError::InvalidFilter(filter.to_string()));
        }
        if single && *level != "+" {
            return Err(BusError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> BusResult<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// MQTT filter matching. `a/#` also matches `a` itself, as the protocol
/// requires.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-memory broker for tests and non-network contexts.
#[derive(Debug, Default)]
pub struct LocalBus {
    filters: parking_lot::RwLock<Vec<(String, broadcast::Sender<BusMessage>)>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, filter: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.filters.write();
        if let Some((_, sender)) = guard.iter().find(|(existing, _)| existing == filter) {
            return sender.clone();
        }
        let sender = broadcast::channel(CHANNEL_CAPACITY).0;
        guard.push((filter.to_string(), sender.clone()));
        sender
    }

    /// Number of filters that still have live receivers.
    pub fn subscription_count(&self) -> usize {
        self.filters
            .read()
            .iter()
            .filter(|(_, sender)| sender.receiver_count() > 0)
            .count()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, filter: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        validate_filter(filter)?;
        Ok(self.sender_for(filter).subscribe())
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        validate_topic(topic)?;
        let mut guard = self.filters.write();
        guard.retain(|(_, sender)| sender.receiver_count() > 0);
        let mut delivered = 0;
        for (filter, sender) in guard.iter() {
            if !topic_matches(filter, topic) {
                continue;
            }
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sender.send(message).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn wildcard_matching_follows_mqtt_rules() {
        assert!(topic_matches("dev/user-1/#", "dev/user-1/session/7"));
        assert!(topic_matches("dev/user-1/#", "dev/user-1"));
        assert!(topic_matches("dev/+/pair", "dev/abc/pair"));
        assert!(!topic_matches("dev/+/pair", "dev/abc/def/pair"));
        assert!(!topic_matches("dev/user-1/#", "dev/user-2/session"));
        assert!(topic_matches("create/device/x", "create/device/x"));
        assert!(!topic_matches("create/device/x", "create/device"));
    }

    #[test_timeout::timeout]
    fn malformed_filters_are_rejected() {
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a/b+").is_err());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/+/#").is_ok());
        assert!(validate_topic("a/+").is_err());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn local_bus_routes_through_wildcards() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("hub/+/signal/#").expect("subscribe ok");
        let delivered = bus
            .publish("hub/user-1/signal/abc", Bytes::from_static(b"offer"))
            .expect("publish ok");
        assert_eq!(delivered, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "hub/user-1/signal/abc");
        assert_eq!(msg.payload, Bytes::from_static(b"offer"));
    }

    #[test_timeout::timeout]
    fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        {
            let _sub = bus.subscribe("a/b").expect("subscribe ok");
        }
        let delivered = bus
            .publish("a/b", Bytes::from_static(b"x"))
            .expect("publish ok");
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscription_count(), 0);
    }
}
