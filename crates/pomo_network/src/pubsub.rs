//! Topic-scoped publish/subscribe on top of the [`Host`].
//!
//! A [`Topic`] is the handle an application holds while it participates in a
//! named channel; [`Subscription`]s attached to it receive every publication
//! on the topic, including the node's own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::NetworkError;
use crate::host::Host;
use crate::identity::PeerId;

/// Capacity of each subscription's delivery queue.
const SUBSCRIPTION_QUEUE: usize = 256;

/// A publication delivered to a local subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub data: Vec<u8>,
    /// The peer that published the message.
    pub origin: PeerId,
    /// The neighbour that handed us the message (ourselves for local publishes).
    pub received_from: PeerId,
}

/// Bounded memory of recently seen publication ids.
#[derive(Debug)]
pub(crate) struct SeenCache {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `id`. Returns `false` if it was already known.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Local subscribers grouped by topic.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, mpsc::Sender<InboundMessage>)>>,
}

impl SubscriptionTable {
    /// Register a subscriber. The flag is `true` for the topic's first one.
    pub(crate) fn add(&mut self, topic: &str) -> (u64, mpsc::Receiver<InboundMessage>, bool) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.next_id += 1;
        let id = self.next_id;
        let slots = self.topics.entry(topic.to_string()).or_default();
        let first = slots.is_empty();
        slots.push((id, tx));
        (id, rx, first)
    }

    /// Remove a subscriber. Returns `true` if the topic has none left.
    pub(crate) fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(slots) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        if slots.is_empty() {
            self.topics.remove(topic);
            return before > 0;
        }
        false
    }

    /// Hand `message` to every subscriber of its topic.
    pub(crate) fn deliver(&self, message: &InboundMessage) -> usize {
        let Some(slots) = self.topics.get(&message.topic) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, tx) in slots {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {id} on {} is lagging, dropping message",
                        message.topic
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub(crate) fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Topics with at least one subscriber.
    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }
}

/// An open handle on a named topic.
pub struct Topic {
    name: String,
    host: Arc<Host>,
    closed: AtomicBool,
}

impl Topic {
    pub(crate) fn new(name: String, host: Arc<Host>) -> Self {
        Self {
            name,
            host,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start receiving publications on this topic.
    pub fn subscribe(&self) -> Result<Subscription, NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::TopicClosed(self.name.clone()));
        }
        Ok(self.host.add_subscription(&self.name))
    }

    /// Publish `data` to every subscriber of the topic, local ones included.
    /// Returns the number of peers the message was sent to.
    pub fn publish(&self, data: Vec<u8>) -> Result<usize, NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::TopicClosed(self.name.clone()));
        }
        self.host.publish(&self.name, data)
    }

    /// Release the handle. Further calls are no-ops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.host.release_topic(&self.name);
        }
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// A live subscription. Dropping it cancels the subscription.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<InboundMessage>,
    host: Arc<Host>,
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        id: u64,
        rx: mpsc::Receiver<InboundMessage>,
        host: Arc<Host>,
    ) -> Self {
        Self {
            topic,
            id,
            rx,
            host,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next publication. `None` once the host has shut down.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        tokio::select! {
            message = self.rx.recv() => message,
            _ = self.host.shutdown_signal().cancelled() => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.host.remove_subscription(&self.topic, self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(topic: &str, data: &[u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            data: data.to_vec(),
            origin: PeerId::from_string("origin"),
            received_from: PeerId::from_string("origin"),
        }
    }

    #[test]
    fn test_seen_cache_dedup_and_eviction() {
        let mut seen = SeenCache::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        // "a" was evicted to make room for "c".
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }

    #[tokio::test]
    async fn test_table_delivers_to_topic_subscribers_only() {
        let mut table = SubscriptionTable::default();
        let (_, mut rx_a, first) = table.add("a");
        assert!(first);
        let (_, mut rx_b, _) = table.add("b");

        assert_eq!(table.deliver(&inbound("a", b"hi")), 1);
        assert_eq!(rx_a.recv().await.unwrap().data, b"hi".to_vec());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_table_reports_first_and_last() {
        let mut table = SubscriptionTable::default();
        let (one, _rx1, first) = table.add("t");
        let (two, _rx2, second_first) = table.add("t");
        assert!(first);
        assert!(!second_first);

        assert!(!table.remove("t", one));
        assert!(table.is_subscribed("t"));
        assert!(table.remove("t", two));
        assert!(!table.is_subscribed("t"));
        assert!(!table.remove("t", two));
        assert!(table.topics().is_empty());
    }
}
