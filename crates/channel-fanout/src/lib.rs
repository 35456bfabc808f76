//! Cross-instance channel fan-out for WebSocket gateways.
//!
//! A producer publishes to a channel through [`FanOutManager::publish_to_channel`];
//! the message travels over the shared bus to every gateway instance that
//! subscribed to the channel. Each instance's listener resolves the channel's
//! members from the [`ConnectionRegistry`] and delivers only to the members
//! whose sockets live in its own [`LocalConnections`] table.

pub mod connection;
pub mod envelope;
pub mod listener;
pub mod manager;
pub mod registry;
pub mod registry_redis;

pub use connection::{ChannelSink, ConnectionSink, LocalConnections, SendError};
pub use envelope::{topic_for, PublishOutcome, WireEnvelope, TOPIC_PREFIX};
pub use listener::{DeliveryReport, ListenerError};
pub use manager::{FanOutConfig, FanOutManager, SubscriptionEvent, SubscriptionKey};
pub use registry::{
    ConnectionCounts, ConnectionRecord, ConnectionRegistry, InMemoryConnectionRegistry,
    RegistryError,
};
pub use registry_redis::RedisConnectionRegistry;
