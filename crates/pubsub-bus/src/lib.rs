//! Publish/subscribe bus used to move gateway traffic between instances.
//!
//! Publishing is always available through [`MessageBus`]. Subscribing is a
//! separate capability ([`PubSub`]) that a bus may not offer; consumers ask
//! for it once via [`MessageBus::pubsub`] and degrade to publish-only when it
//! is absent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod local;
mod redis_bus;

pub use local::LocalBus;
pub use redis_bus::RedisBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEventKind {
    Subscribe,
    Unsubscribe,
    Message,
}

/// One item yielded by a [`BusSubscription`].
///
/// Control events (`Subscribe`/`Unsubscribe`) carry an empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub kind: BusEventKind,
    pub topic: String,
    pub data: Bytes,
}

impl BusEvent {
    pub fn message(topic: impl Into<String>, data: Bytes) -> Self {
        Self {
            kind: BusEventKind::Message,
            topic: topic.into(),
            data,
        }
    }

    pub fn control(kind: BusEventKind, topic: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            data: Bytes::new(),
        }
    }

    pub fn is_message(&self) -> bool {
        self.kind == BusEventKind::Message
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`, returning how many bus-level subscribers
    /// received it. The count says nothing about application-level delivery.
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;

    /// Subscribe capability, or `None` for publish-only buses.
    fn pubsub(&self) -> Option<Arc<dyn PubSub>>;
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<Box<dyn BusSubscription>>;
}

/// A live subscription to one topic, exclusively owned by its consumer.
#[async_trait]
pub trait BusSubscription: Send {
    fn topic(&self) -> &str;

    /// Wait for the next event. An error means the subscription is dead and
    /// will not yield anything else.
    async fn next_event(&mut self) -> BusResult<BusEvent>;

    async fn unsubscribe(&mut self) -> BusResult<()>;
}
