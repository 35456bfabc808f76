use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Transport handle for one client connection held by this process.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, payload: &str) -> Result<(), SendError>;
}

/// Sink that hands frames to a per-socket writer task.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send(&self, payload: &str) -> Result<(), SendError> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| SendError::Closed)
    }
}

/// Connections resident in this process, keyed by connection id.
///
/// Clones share one live table: the owner inserts and removes entries while
/// the fan-out listeners read whatever is present at delivery time.
#[derive(Clone, Default)]
pub struct LocalConnections {
    inner: Arc<DashMap<String, Arc<dyn ConnectionSink>>>,
}

impl LocalConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection_id: impl Into<String>, sink: Arc<dyn ConnectionSink>) {
        self.inner.insert(connection_id.into(), sink);
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<dyn ConnectionSink>> {
        self.inner.remove(connection_id).map(|(_, sink)| sink)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<dyn ConnectionSink>> {
        // Clone the handle out so no map guard outlives this call.
        self.inner.get(connection_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.inner.contains_key(connection_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn clones_share_the_live_table() {
        let table = LocalConnections::new();
        let view = table.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        table.insert("conn1", Arc::new(ChannelSink::new(tx)));
        assert!(view.contains("conn1"));
        assert_eq!(view.len(), 1);

        let sink = view.get("conn1").expect("sink");
        sink.send("hello").await.expect("send");
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        table.remove("conn1");
        assert!(view.get("conn1").is_none());
        assert!(view.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn channel_sink_reports_closed_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        assert!(matches!(sink.send("x").await, Err(SendError::Closed)));
    }
}
