use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{BusError, BusEvent, BusEventKind, BusResult, BusSubscription, MessageBus, PubSub};

/// In-memory bus for tests and single-process deployments.
///
/// Each subscriber owns an unbounded queue so bursts are never dropped.
#[derive(Debug, Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

#[derive(Debug)]
struct LocalBusInner {
    topics: parking_lot::RwLock<HashMap<String, Vec<LocalSubscriber>>>,
    next_id: AtomicU64,
    pubsub_enabled: bool,
}

#[derive(Debug)]
struct LocalSubscriber {
    id: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_pubsub(true)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that can publish but offers no subscribe capability.
    pub fn publish_only() -> Self {
        Self::with_pubsub(false)
    }

    fn with_pubsub(pubsub_enabled: bool) -> Self {
        Self {
            inner: Arc::new(LocalBusInner {
                topics: parking_lot::RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                pubsub_enabled,
            }),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop every subscriber of `topic`, as if the broker connection went away.
    pub fn disconnect(&self, topic: &str) {
        self.inner.topics.write().remove(topic);
    }

    fn remove_subscriber(&self, topic: &str, id: u64) {
        let mut topics = self.inner.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let mut topics = self.inner.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return Ok(0);
        };
        let event = BusEvent::message(topic, payload);
        subs.retain(|s| s.tx.send(event.clone()).is_ok());
        Ok(subs.len())
    }

    fn pubsub(&self) -> Option<Arc<dyn PubSub>> {
        if self.inner.pubsub_enabled {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }
}

#[async_trait]
impl PubSub for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Box<dyn BusSubscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(BusEvent::control(BusEventKind::Subscribe, topic))
            .map_err(|_| BusError::Closed)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(LocalSubscriber { id, tx });
        Ok(Box::new(LocalSubscription {
            bus: self.clone(),
            topic: topic.to_string(),
            id,
            rx,
        }))
    }
}

struct LocalSubscription {
    bus: LocalBus,
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<BusEvent>,
}

#[async_trait]
impl BusSubscription for LocalSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next_event(&mut self) -> BusResult<BusEvent> {
        self.rx.recv().await.ok_or(BusError::Closed)
    }

    async fn unsubscribe(&mut self) -> BusResult<()> {
        self.bus.remove_subscriber(&self.topic, self.id);
        self.rx.close();
        Ok(())
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.bus.remove_subscriber(&self.topic, self.id);
    }
}
