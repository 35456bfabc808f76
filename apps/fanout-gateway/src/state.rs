use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use channel_fanout::{
    ConnectionRegistry, FanOutConfig, FanOutManager, InMemoryConnectionRegistry, LocalConnections,
    RedisConnectionRegistry, RegistryError,
};
use dashmap::DashMap;
use pubsub_bus::{LocalBus, MessageBus, RedisBus};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    started: Instant,
    instance_id: String,
    manager: FanOutManager,
    registry: Arc<dyn ConnectionRegistry>,
    local: LocalConnections,
    /// connection id -> channels it joined through this instance
    joined: Arc<DashMap<String, BTreeSet<String>>>,
    // Serializes channel start/release so a join racing the last leave
    // never ends up without a listener.
    channel_gate: Arc<Mutex<()>>,
}

impl GatewayState {
    pub fn new(
        instance_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn ConnectionRegistry>,
        fanout: FanOutConfig,
    ) -> Self {
        Self {
            started: Instant::now(),
            instance_id: instance_id.into(),
            manager: FanOutManager::new(bus, registry.clone(), fanout),
            registry,
            local: LocalConnections::new(),
            joined: Arc::new(DashMap::new()),
            channel_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Redis-backed when `REDIS_URL` is set, otherwise fully in-process.
    pub async fn from_config(cfg: &GatewayConfig) -> Result<Self> {
        let (bus, registry): (Arc<dyn MessageBus>, Arc<dyn ConnectionRegistry>) =
            match cfg.redis_url.as_deref() {
                Some(url) => {
                    let bus = RedisBus::connect(url, cfg.pubsub_enabled)
                        .await
                        .context("failed to connect redis bus")?;
                    let registry = RedisConnectionRegistry::connect(url, cfg.connection_ttl_seconds)
                        .await
                        .context("failed to connect redis registry")?;
                    info!(redis = %url, "using redis bus and registry");
                    (Arc::new(bus), Arc::new(registry))
                }
                None => {
                    info!("REDIS_URL unset; using in-process bus and registry");
                    let bus = if cfg.pubsub_enabled {
                        LocalBus::new()
                    } else {
                        LocalBus::publish_only()
                    };
                    (Arc::new(bus), Arc::new(InMemoryConnectionRegistry::new()))
                }
            };
        Ok(Self::new(
            cfg.instance_id.clone(),
            bus,
            registry,
            cfg.fanout_config(),
        ))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn manager(&self) -> &FanOutManager {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn local(&self) -> &LocalConnections {
        &self.local
    }

    /// Make sure this instance listens on `channel`. Idempotent.
    pub async fn ensure_channel(&self, channel: &str) {
        let _gate = self.channel_gate.lock().await;
        self.manager
            .start_channel_subscription(channel, &self.instance_id, self.local.clone())
            .await;
    }

    /// Add a local connection to `channel` and make sure the channel is
    /// being listened to.
    pub async fn join_channel(&self, connection_id: &str, channel: &str) -> Result<(), RegistryError> {
        let _gate = self.channel_gate.lock().await;
        self.registry
            .subscribe_to_channel(connection_id, channel)
            .await?;
        self.joined
            .entry(connection_id.to_string())
            .or_default()
            .insert(channel.to_string());
        self.manager
            .start_channel_subscription(channel, &self.instance_id, self.local.clone())
            .await;
        Ok(())
    }

    pub async fn leave_channel(&self, connection_id: &str, channel: &str) -> Result<(), RegistryError> {
        let _gate = self.channel_gate.lock().await;
        if let Some(mut channels) = self.joined.get_mut(connection_id) {
            channels.remove(channel);
        }
        self.registry
            .unsubscribe_from_channel(connection_id, channel)
            .await?;
        self.release_if_unused(channel).await;
        Ok(())
    }

    /// Drop a closed connection everywhere and release the channels only it
    /// was holding open.
    pub async fn forget_connection(&self, connection_id: &str) {
        self.local.remove(connection_id);
        if let Err(err) = self.registry.unregister_connection(connection_id).await {
            warn!(%connection_id, error = %err, "failed to unregister connection");
        }
        let channels = self
            .joined
            .remove(connection_id)
            .map(|(_, channels)| channels)
            .unwrap_or_default();
        if channels.is_empty() {
            return;
        }
        let _gate = self.channel_gate.lock().await;
        for channel in channels {
            self.release_if_unused(&channel).await;
        }
    }

    pub fn joined_channels(&self, connection_id: &str) -> Vec<String> {
        self.joined
            .get(connection_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    // Caller holds `channel_gate`.
    async fn release_if_unused(&self, channel: &str) {
        let members = match self.registry.get_connections_by_channel(channel).await {
            Ok(members) => members,
            Err(err) => {
                warn!(%channel, error = %err, "membership lookup failed; keeping channel");
                return;
            }
        };
        if members.iter().any(|id| self.local.contains(id)) {
            return;
        }
        debug!(%channel, "no local members left; releasing channel");
        self.manager.stop_channel_subscription(channel).await;
    }
}
