use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Msg};
use tracing::debug;

use crate::{BusError, BusEvent, BusEventKind, BusResult, BusSubscription, MessageBus, PubSub};

/// Redis-backed bus shared by every gateway instance.
///
/// Publishing goes through a shared [`ConnectionManager`]; every subscription
/// opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
    pubsub_enabled: bool,
}

impl RedisBus {
    pub async fn connect(redis_url: &str, pubsub_enabled: bool) -> BusResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            pubsub_enabled,
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, payload.to_vec()).await?;
        Ok(receivers)
    }

    fn pubsub(&self) -> Option<Arc<dyn PubSub>> {
        if self.pubsub_enabled {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }
}

#[async_trait]
impl PubSub for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Box<dyn BusSubscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        debug!(topic, "redis subscription opened");
        Ok(Box::new(RedisSubscription {
            topic: topic.to_string(),
            confirmed: false,
            messages: Some(Box::pin(pubsub.into_on_message())),
        }))
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

struct RedisSubscription {
    topic: String,
    confirmed: bool,
    // Dropping the stream closes the dedicated connection, which is how Redis
    // releases the subscription.
    messages: Option<MessageStream>,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next_event(&mut self) -> BusResult<BusEvent> {
        // The SUBSCRIBE reply is consumed by the client, so surface the
        // control event ourselves to keep parity with other buses.
        if !self.confirmed {
            self.confirmed = true;
            return Ok(BusEvent::control(BusEventKind::Subscribe, self.topic.clone()));
        }
        let stream = self.messages.as_mut().ok_or(BusError::Closed)?;
        match stream.next().await {
            Some(msg) => Ok(BusEvent::message(
                msg.get_channel_name(),
                Bytes::copy_from_slice(msg.get_payload_bytes()),
            )),
            None => {
                self.messages = None;
                Err(BusError::Closed)
            }
        }
    }

    async fn unsubscribe(&mut self) -> BusResult<()> {
        if self.messages.take().is_some() {
            debug!(topic = %self.topic, "redis subscription closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into())
    }

    #[test_timeout::tokio_timeout_test(20)]
    #[ignore = "requires a reachable REDIS_URL"]
    async fn redis_publish_reaches_subscriber() {
        let bus = RedisBus::connect(&redis_url(), true).await.expect("redis");
        let pubsub = bus.pubsub().expect("pubsub capability");
        let mut sub = pubsub
            .subscribe("websocket:redis-bus-test")
            .await
            .expect("subscribe");
        let control = sub.next_event().await.expect("control");
        assert_eq!(control.kind, BusEventKind::Subscribe);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let receivers = bus
            .publish("websocket:redis-bus-test", Bytes::from_static(b"{\"n\":1}"))
            .await
            .expect("publish");
        assert!(receivers >= 1);

        let event = sub.next_event().await.expect("message");
        assert!(event.is_message());
        assert_eq!(event.data, Bytes::from_static(b"{\"n\":1}"));

        sub.unsubscribe().await.expect("unsubscribe");
        assert!(matches!(sub.next_event().await, Err(BusError::Closed)));
    }

    #[test_timeout::tokio_timeout_test(20)]
    #[ignore = "requires a reachable REDIS_URL"]
    async fn redis_bus_without_pubsub_still_publishes() {
        let bus = RedisBus::connect(&redis_url(), false).await.expect("redis");
        assert!(bus.pubsub().is_none());
        bus.publish("websocket:redis-bus-idle", Bytes::from_static(b"{}"))
            .await
            .expect("publish");
    }
}
