use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::registry::{ConnectionCounts, ConnectionRecord, ConnectionRegistry, RegistryError};

const CONNECTIONS_KEY: &str = "ws:connections";
const CHANNELS_KEY: &str = "ws:channels";

const PRUNE_CHANNEL_SCRIPT: &str = r#"
if redis.call('SCARD', KEYS[1]) == 0 then
  redis.call('SREM', KEYS[2], ARGV[1])
end
return 0
"#;

/// Redis-backed registry shared by every gateway instance.
#[derive(Clone)]
pub struct RedisConnectionRegistry {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisConnectionRegistry {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, RegistryError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }

    /// Drop `channel` from the channel index once its member set is empty.
    /// Check and removal run as one script so a concurrent join is never lost.
    async fn prune_channel(&self, channel: &str) -> Result<(), RegistryError> {
        let mut conn = self.redis.clone();
        redis::Script::new(PRUNE_CHANNEL_SCRIPT)
            .key(channel_key(channel))
            .key(CHANNELS_KEY)
            .arg(channel)
            .invoke_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn store(&self, record: &ConnectionRecord) -> Result<(), RegistryError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(record)?;
        redis::pipe()
            .cmd("SETEX")
            .arg(connection_key(&record.connection_id))
            .arg(self.ttl_seconds)
            .arg(&serialized)
            .ignore()
            .cmd("SADD")
            .arg(CONNECTIONS_KEY)
            .arg(&record.connection_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionRegistry for RedisConnectionRegistry {
    async fn register_connection(&self, record: ConnectionRecord) -> Result<(), RegistryError> {
        self.store(&record).await?;
        tracing::debug!(
            connection_id = %record.connection_id,
            instance_id = %record.instance_id,
            "registered connection"
        );
        Ok(())
    }

    async fn unregister_connection(&self, connection_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.redis.clone();
        let channels_key = memberships_key(connection_id);
        let channels: Vec<String> = conn.smembers(&channels_key).await?;

        let mut pipe = redis::pipe();
        for channel in &channels {
            pipe.cmd("SREM")
                .arg(channel_key(channel))
                .arg(connection_id)
                .ignore();
        }
        pipe.cmd("DEL")
            .arg(connection_key(connection_id))
            .arg(&channels_key)
            .ignore()
            .cmd("SREM")
            .arg(CONNECTIONS_KEY)
            .arg(connection_id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        for channel in &channels {
            self.prune_channel(channel).await?;
        }
        Ok(())
    }

    async fn subscribe_to_channel(
        &self,
        connection_id: &str,
        channel: &str,
    ) -> Result<(), RegistryError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(channel_key(channel))
            .arg(connection_id)
            .ignore()
            .cmd("SADD")
            .arg(memberships_key(connection_id))
            .arg(channel)
            .ignore()
            .cmd("SADD")
            .arg(CHANNELS_KEY)
            .arg(channel)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn unsubscribe_from_channel(
        &self,
        connection_id: &str,
        channel: &str,
    ) -> Result<(), RegistryError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("SREM")
            .arg(channel_key(channel))
            .arg(connection_id)
            .ignore()
            .cmd("SREM")
            .arg(memberships_key(connection_id))
            .arg(channel)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        self.prune_channel(channel).await
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, RegistryError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(connection_key(connection_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_connections_by_channel(&self, channel: &str) -> Result<Vec<String>, RegistryError> {
        let mut conn = self.redis.clone();
        let mut members: Vec<String> = conn.smembers(channel_key(channel)).await?;
        members.sort();
        Ok(members)
    }

    async fn touch_connection(&self, connection_id: &str) -> Result<bool, RegistryError> {
        let Some(mut record) = self.get_connection(connection_id).await? else {
            return Ok(false);
        };
        record.last_heartbeat = Utc::now();
        self.store(&record).await?;
        Ok(true)
    }

    async fn connection_counts(&self) -> Result<ConnectionCounts, RegistryError> {
        let mut conn = self.redis.clone();
        let global: usize = conn.scard(CONNECTIONS_KEY).await?;
        let channels: Vec<String> = conn.smembers(CHANNELS_KEY).await?;
        let mut pipe = redis::pipe();
        for channel in &channels {
            pipe.cmd("SCARD").arg(channel_key(channel));
        }
        let sizes: Vec<usize> = if channels.is_empty() {
            Vec::new()
        } else {
            pipe.query_async(&mut conn).await?
        };
        Ok(ConnectionCounts {
            global,
            by_channel: channels
                .into_iter()
                .zip(sizes)
                .filter(|(_, members)| *members > 0)
                .collect(),
        })
    }
}

fn connection_key(connection_id: &str) -> String {
    format!("ws:connection:{}", connection_id)
}

fn memberships_key(connection_id: &str) -> String {
    format!("ws:connection:{}:channels", connection_id)
}

fn channel_key(channel: &str) -> String {
    format!("ws:channel:{}", channel)
}
