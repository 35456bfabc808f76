use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use pubsub_bus::{MessageBus, PubSub};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::LocalConnections;
use crate::envelope::{topic_for, PublishOutcome, WireEnvelope};
use crate::listener::Listener;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Upper bound on a single connection send during fan-out.
    pub send_timeout: Duration,
    /// Upper bound on waiting for one listener to wind down.
    pub stop_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub instance_id: String,
    pub channel: String,
}

impl SubscriptionKey {
    pub fn new(instance_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            channel: channel.into(),
        }
    }
}

/// Lifecycle notifications for supervisors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Started { key: SubscriptionKey },
    Stopped { key: SubscriptionKey },
    /// The listener hit a fatal error and removed itself. Nothing restarts
    /// it; call `start_channel_subscription` again to resume.
    Terminated { key: SubscriptionKey, reason: String },
}

struct ActiveSubscription {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct ManagerInner {
    bus: Arc<dyn MessageBus>,
    pubsub: Option<Arc<dyn PubSub>>,
    registry: Arc<dyn ConnectionRegistry>,
    config: FanOutConfig,
    // One entry per (instance, channel): the bus handle lives inside the task,
    // so the handle and the task can never be tracked separately.
    subscriptions: Mutex<HashMap<SubscriptionKey, ActiveSubscription>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<SubscriptionEvent>,
}

impl ManagerInner {
    /// Called by a listener after a fatal error. The generation check keeps a
    /// dying listener from removing a newer subscription for the same key.
    pub(crate) fn remove_terminated(&self, key: &SubscriptionKey, generation: u64, reason: String) {
        let removed = {
            let mut subs = self.subscriptions.lock();
            match subs.get(key) {
                Some(active) if active.generation == generation => subs.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            let _ = self.events.send(SubscriptionEvent::Terminated {
                key: key.clone(),
                reason,
            });
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for active in self.subscriptions.get_mut().values() {
            active.cancel.cancel();
        }
    }
}

/// Per-instance channel fan-out over a shared pub/sub bus.
///
/// Every public method completes without returning an error: failures are
/// logged, and publish failures come back as [`PublishOutcome::Failed`].
#[derive(Clone)]
pub struct FanOutManager {
    inner: Arc<ManagerInner>,
}

impl FanOutManager {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn ConnectionRegistry>,
        config: FanOutConfig,
    ) -> Self {
        let pubsub = bus.pubsub();
        if pubsub.is_none() {
            warn!("message bus has no pub/sub capability; fan-out runs publish-only");
        }
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                pubsub,
                registry,
                config,
                subscriptions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn supports_fanout(&self) -> bool {
        self.inner.pubsub.is_some()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.inner.events.subscribe()
    }

    /// Start delivering `channel` traffic to the members resident in
    /// `local_connections`. Idempotent per `(instance_id, channel)`.
    pub async fn start_channel_subscription(
        &self,
        channel: &str,
        instance_id: &str,
        local_connections: LocalConnections,
    ) {
        if channel.trim().is_empty() {
            warn!(instance_id, "refusing to subscribe to an empty channel name");
            return;
        }
        let Some(pubsub) = self.inner.pubsub.clone() else {
            warn!(channel, "pub/sub unavailable; channel will not fan out");
            return;
        };
        let key = SubscriptionKey::new(instance_id, channel);
        if self.inner.subscriptions.lock().contains_key(&key) {
            debug!(channel, instance_id, "channel already subscribed");
            return;
        }

        let topic = topic_for(channel);
        let subscription = match pubsub.subscribe(&topic).await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(channel, instance_id, %topic, error = %err, "failed to open bus subscription");
                return;
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let listener = Listener {
            key: key.clone(),
            generation,
            registry: self.inner.registry.clone(),
            local: local_connections,
            send_timeout: self.inner.config.send_timeout,
            manager: Arc::downgrade(&self.inner),
        };

        // A concurrent start may have won while we were subscribing.
        let mut pending = Some(subscription);
        let started = {
            let mut subs = self.inner.subscriptions.lock();
            if subs.contains_key(&key) {
                false
            } else if let Some(subscription) = pending.take() {
                let task = tokio::spawn(listener.run(subscription, cancel.clone()));
                subs.insert(
                    key.clone(),
                    ActiveSubscription {
                        generation,
                        cancel,
                        task,
                    },
                );
                // Sent under the lock: a listener that dies at once cannot
                // report Terminated ahead of Started.
                let _ = self
                    .inner
                    .events
                    .send(SubscriptionEvent::Started { key: key.clone() });
                true
            } else {
                false
            }
        };

        if let Some(mut loser) = pending {
            debug!(channel, instance_id, "lost subscribe race; releasing duplicate handle");
            let _ = loser.unsubscribe().await;
        }
        if started {
            info!(channel, instance_id, %topic, "channel subscription started");
        }
    }

    /// Wrap `message` in the wire envelope and publish it on the channel topic.
    /// Identical calls fan out twice.
    pub async fn publish_to_channel(
        &self,
        channel: &str,
        message: serde_json::Value,
        source_connection_id: Option<String>,
    ) -> PublishOutcome {
        let envelope = WireEnvelope::new(channel, message, source_connection_id);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                error!(channel, error = %err, "failed to encode wire envelope");
                return PublishOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        match self
            .inner
            .bus
            .publish(&topic_for(channel), Bytes::from(payload))
            .await
        {
            Ok(subscribers) => {
                debug!(channel, subscribers, "published to channel");
                PublishOutcome::Published {
                    channel: channel.to_string(),
                    subscribers: Some(subscribers),
                }
            }
            Err(err) => {
                error!(channel, error = %err, "failed to publish to channel");
                PublishOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Stop every subscription this manager holds for `channel`.
    pub async fn stop_channel_subscription(&self, channel: &str) {
        let stopping: Vec<(SubscriptionKey, ActiveSubscription)> = {
            let mut subs = self.inner.subscriptions.lock();
            let keys: Vec<SubscriptionKey> =
                subs.keys().filter(|k| k.channel == channel).cloned().collect();
            keys.into_iter()
                .filter_map(|key| subs.remove(&key).map(|active| (key, active)))
                .collect()
        };
        if stopping.is_empty() {
            debug!(channel, "stop requested for channel that is not subscribed");
            return;
        }
        for (key, active) in stopping {
            self.finish(key, active).await;
        }
    }

    /// Stop every subscription. Each stop is bounded by `stop_timeout` and a
    /// stuck listener is aborted, so this always completes.
    pub async fn shutdown(&self) {
        let draining: Vec<(SubscriptionKey, ActiveSubscription)> =
            self.inner.subscriptions.lock().drain().collect();
        let count = draining.len();
        for (key, active) in draining {
            self.finish(key, active).await;
        }
        info!(subscriptions = count, "fan-out manager shut down");
    }

    async fn finish(&self, key: SubscriptionKey, mut active: ActiveSubscription) {
        active.cancel.cancel();
        match tokio::time::timeout(self.inner.config.stop_timeout, &mut active.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(channel = %key.channel, instance_id = %key.instance_id, error = %err, "listener ended abnormally");
            }
            Err(_) => {
                warn!(
                    channel = %key.channel,
                    instance_id = %key.instance_id,
                    "listener did not stop in time; aborting"
                );
                active.task.abort();
            }
        }
        info!(channel = %key.channel, instance_id = %key.instance_id, "channel subscription stopped");
        let _ = self.inner.events.send(SubscriptionEvent::Stopped { key });
    }

    pub fn is_subscribed(&self, instance_id: &str, channel: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .contains_key(&SubscriptionKey::new(instance_id, channel))
    }

    pub fn active_channels(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> =
            self.inner.subscriptions.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionSink, SendError};
    use crate::registry::InMemoryConnectionRegistry;
    use async_trait::async_trait;
    use pubsub_bus::{BusError, BusEvent, BusResult, BusSubscription, LocalBus};
    use serde_json::json;

    struct FailingBus;

    #[async_trait]
    impl MessageBus for FailingBus {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> BusResult<usize> {
            Err(BusError::Transport("broker unreachable".into()))
        }

        fn pubsub(&self) -> Option<Arc<dyn PubSub>> {
            None
        }
    }

    struct StalledSink;

    #[async_trait]
    impl ConnectionSink for StalledSink {
        async fn send(&self, _payload: &str) -> Result<(), SendError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Bus whose subscriptions fail on the first read.
    struct DeadOnArrivalBus;

    struct DeadSubscription;

    #[async_trait]
    impl BusSubscription for DeadSubscription {
        fn topic(&self) -> &str {
            "websocket:guide"
        }

        async fn next_event(&mut self) -> BusResult<BusEvent> {
            Err(BusError::Closed)
        }

        async fn unsubscribe(&mut self) -> BusResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl MessageBus for DeadOnArrivalBus {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> BusResult<usize> {
            Ok(0)
        }

        fn pubsub(&self) -> Option<Arc<dyn PubSub>> {
            Some(Arc::new(DeadOnArrivalBus))
        }
    }

    #[async_trait]
    impl PubSub for DeadOnArrivalBus {
        async fn subscribe(&self, _topic: &str) -> BusResult<Box<dyn BusSubscription>> {
            Ok(Box::new(DeadSubscription))
        }
    }

    fn manager_on(bus: LocalBus, config: FanOutConfig) -> FanOutManager {
        FanOutManager::new(
            Arc::new(bus),
            Arc::new(InMemoryConnectionRegistry::new()),
            config,
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_is_idempotent() {
        let bus = LocalBus::new();
        let manager = manager_on(bus.clone(), FanOutConfig::default());
        let local = LocalConnections::new();

        manager
            .start_channel_subscription("guide", "gw-a", local.clone())
            .await;
        manager
            .start_channel_subscription("guide", "gw-a", local.clone())
            .await;

        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(bus.subscriber_count("websocket:guide"), 1);
        assert!(manager.is_subscribed("gw-a", "guide"));
        manager.shutdown().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn empty_channel_is_ignored() {
        let manager = manager_on(LocalBus::new(), FanOutConfig::default());
        manager
            .start_channel_subscription("  ", "gw-a", LocalConnections::new())
            .await;
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn degraded_mode_without_pubsub() {
        let manager = manager_on(LocalBus::publish_only(), FanOutConfig::default());
        assert!(!manager.supports_fanout());

        manager
            .start_channel_subscription("guide", "gw-a", LocalConnections::new())
            .await;
        assert_eq!(manager.subscription_count(), 0);

        let outcome = manager
            .publish_to_channel("guide", json!({"text": "hello"}), None)
            .await;
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                channel: "guide".into(),
                subscribers: Some(0),
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_failure_is_returned_not_raised() {
        let manager = FanOutManager::new(
            Arc::new(FailingBus),
            Arc::new(InMemoryConnectionRegistry::new()),
            FanOutConfig::default(),
        );
        let outcome = manager
            .publish_to_channel("guide", json!({"text": "hello"}), Some("conn1".into()))
            .await;
        match outcome {
            PublishOutcome::Failed { error } => assert!(error.contains("broker unreachable")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_removes_subscription_and_releases_topic() {
        let bus = LocalBus::new();
        let manager = manager_on(bus.clone(), FanOutConfig::default());
        let mut events = manager.subscribe_events();

        manager
            .start_channel_subscription("guide", "gw-a", LocalConnections::new())
            .await;
        manager.stop_channel_subscription("guide").await;

        assert!(!manager.is_subscribed("gw-a", "guide"));
        assert_eq!(bus.subscriber_count("websocket:guide"), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            SubscriptionEvent::Started { .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            SubscriptionEvent::Stopped {
                key: SubscriptionKey::new("gw-a", "guide")
            }
        );

        // Stopping again is a no-op.
        manager.stop_channel_subscription("guide").await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_aborts_stuck_listener() {
        let bus = LocalBus::new();
        let registry = Arc::new(InMemoryConnectionRegistry::new());
        registry.subscribe_to_channel("slow", "guide").await.unwrap();
        let manager = FanOutManager::new(
            Arc::new(bus.clone()),
            registry,
            FanOutConfig {
                send_timeout: Duration::from_secs(3600),
                stop_timeout: Duration::from_millis(100),
                ..FanOutConfig::default()
            },
        );
        let local = LocalConnections::new();
        local.insert("slow", Arc::new(StalledSink));

        manager
            .start_channel_subscription("guide", "gw-a", local.clone())
            .await;
        manager
            .start_channel_subscription("other", "gw-a", LocalConnections::new())
            .await;
        manager
            .publish_to_channel("guide", json!({"n": 1}), None)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_interrupts_stalled_delivery() {
        let bus = LocalBus::new();
        let registry = Arc::new(InMemoryConnectionRegistry::new());
        registry.subscribe_to_channel("stuck", "guide").await.unwrap();
        let manager = FanOutManager::new(
            Arc::new(bus.clone()),
            registry,
            FanOutConfig {
                send_timeout: Duration::from_secs(60),
                stop_timeout: Duration::from_secs(10),
                ..FanOutConfig::default()
            },
        );
        let local = LocalConnections::new();
        local.insert("stuck", Arc::new(StalledSink));
        manager
            .start_channel_subscription("guide", "gw-a", local.clone())
            .await;
        manager
            .publish_to_channel("guide", json!({"n": 1}), None)
            .await;
        // Let the listener enter the stalled send.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        manager.stop_channel_subscription("guide").await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "stop waited {:?}",
            started.elapsed()
        );
        assert!(!manager.is_subscribed("gw-a", "guide"));
        assert_eq!(bus.subscriber_count("websocket:guide"), 0);
    }

    #[test_timeout::tokio_timeout_test(30, multi_thread)]
    async fn started_precedes_termination() {
        for _ in 0..20 {
            let manager = FanOutManager::new(
                Arc::new(DeadOnArrivalBus),
                Arc::new(InMemoryConnectionRegistry::new()),
                FanOutConfig::default(),
            );
            let mut events = manager.subscribe_events();
            manager
                .start_channel_subscription("guide", "gw-a", LocalConnections::new())
                .await;

            assert!(matches!(
                events.recv().await.unwrap(),
                SubscriptionEvent::Started { .. }
            ));
            assert!(matches!(
                events.recv().await.unwrap(),
                SubscriptionEvent::Terminated { .. }
            ));
            assert!(!manager.is_subscribed("gw-a", "guide"));
        }
    }
}
