use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry store error: {0}")]
    Store(String),
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for RegistryError {
    fn from(err: redis::RedisError) -> Self {
        RegistryError::Store(err.to_string())
    }
}

/// Platform-wide view of one client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Gateway instance currently holding the socket.
    pub instance_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ConnectionRecord {
    pub fn new(connection_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.into(),
            session_id: None,
            instance_id: instance_id.into(),
            connected_at: now,
            last_heartbeat: now,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub global: usize,
    pub by_channel: BTreeMap<String, usize>,
}

/// Shared source of truth for channel membership across gateway instances.
///
/// Implementations are eventually consistent; callers must tolerate ids that
/// no longer correspond to a live socket.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn register_connection(&self, record: ConnectionRecord) -> Result<(), RegistryError>;

    /// Remove the connection and every channel membership it holds.
    async fn unregister_connection(&self, connection_id: &str) -> Result<(), RegistryError>;

    async fn subscribe_to_channel(
        &self,
        connection_id: &str,
        channel: &str,
    ) -> Result<(), RegistryError>;

    async fn unsubscribe_from_channel(
        &self,
        connection_id: &str,
        channel: &str,
    ) -> Result<(), RegistryError>;

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, RegistryError>;

    async fn get_connections_by_channel(&self, channel: &str) -> Result<Vec<String>, RegistryError>;

    /// Refresh the heartbeat. Returns `false` when the connection is unknown.
    async fn touch_connection(&self, connection_id: &str) -> Result<bool, RegistryError>;

    async fn connection_counts(&self) -> Result<ConnectionCounts, RegistryError>;
}

#[derive(Default)]
struct RegistryTables {
    connections: HashMap<String, ConnectionRecord>,
    channels: HashMap<String, BTreeSet<String>>,
    memberships: HashMap<String, BTreeSet<String>>,
}

/// Process-local registry for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryConnectionRegistry {
    tables: parking_lot::RwLock<RegistryTables>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn register_connection(&self, record: ConnectionRecord) -> Result<(), RegistryError> {
        self.tables
            .write()
            .connections
            .insert(record.connection_id.clone(), record);
        Ok(())
    }

    async fn unregister_connection(&self, connection_id: &str) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        tables.connections.remove(connection_id);
        if let Some(channels) = tables.memberships.remove(connection_id) {
            for channel in channels {
                let now_empty = match tables.channels.get_mut(&channel) {
                    Some(members) => {
                        members.remove(connection_id);
                        members.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    tables.channels.remove(&channel);
                }
            }
        }
        Ok(())
    }

    async fn subscribe_to_channel(
        &self,
        connection_id: &str,
        channel: &str,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        tables
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());
        tables
            .memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe_from_channel(
        &self,
        connection_id: &str,
        channel: &str,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        let now_empty = match tables.channels.get_mut(channel) {
            Some(members) => {
                members.remove(connection_id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            tables.channels.remove(channel);
        }
        if let Some(channels) = tables.memberships.get_mut(connection_id) {
            channels.remove(channel);
        }
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, RegistryError> {
        Ok(self.tables.read().connections.get(connection_id).cloned())
    }

    async fn get_connections_by_channel(&self, channel: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .tables
            .read()
            .channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn touch_connection(&self, connection_id: &str) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write();
        match tables.connections.get_mut(connection_id) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn connection_counts(&self) -> Result<ConnectionCounts, RegistryError> {
        let tables = self.tables.read();
        Ok(ConnectionCounts {
            global: tables.connections.len(),
            by_channel: tables
                .channels
                .iter()
                .map(|(channel, members)| (channel.clone(), members.len()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn membership_is_independent_of_registration() {
        let registry = InMemoryConnectionRegistry::new();
        registry
            .register_connection(ConnectionRecord::new("conn1", "gw-a"))
            .await
            .unwrap();
        registry.subscribe_to_channel("conn1", "guide").await.unwrap();
        // conn3 lives on another instance; membership is still platform-wide.
        registry.subscribe_to_channel("conn3", "guide").await.unwrap();

        let members = registry.get_connections_by_channel("guide").await.unwrap();
        assert_eq!(members, vec!["conn1".to_string(), "conn3".to_string()]);
        assert!(registry
            .get_connections_by_channel("pillar:content")
            .await
            .unwrap()
            .is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unregister_drops_memberships() {
        let registry = InMemoryConnectionRegistry::new();
        registry
            .register_connection(ConnectionRecord::new("conn1", "gw-a").with_session("s1"))
            .await
            .unwrap();
        registry.subscribe_to_channel("conn1", "guide").await.unwrap();
        registry
            .subscribe_to_channel("conn1", "pillar:content")
            .await
            .unwrap();

        registry.unregister_connection("conn1").await.unwrap();

        assert!(registry.get_connection("conn1").await.unwrap().is_none());
        assert!(registry
            .get_connections_by_channel("guide")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            registry.connection_counts().await.unwrap(),
            ConnectionCounts::default()
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn counts_and_heartbeat() {
        let registry = InMemoryConnectionRegistry::new();
        let record = ConnectionRecord::new("conn1", "gw-a");
        let first_beat = record.last_heartbeat;
        registry.register_connection(record).await.unwrap();
        registry
            .register_connection(ConnectionRecord::new("conn2", "gw-b"))
            .await
            .unwrap();
        registry.subscribe_to_channel("conn1", "guide").await.unwrap();
        registry.subscribe_to_channel("conn2", "guide").await.unwrap();
        registry.unsubscribe_from_channel("conn2", "guide").await.unwrap();

        let counts = registry.connection_counts().await.unwrap();
        assert_eq!(counts.global, 2);
        assert_eq!(counts.by_channel.get("guide"), Some(&1));

        assert!(registry.touch_connection("conn1").await.unwrap());
        assert!(!registry.touch_connection("missing").await.unwrap());
        let touched = registry.get_connection("conn1").await.unwrap().unwrap();
        assert!(touched.last_heartbeat >= first_beat);
    }
}
