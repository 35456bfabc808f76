use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use pubsub_bus::{BusError, BusSubscription};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnectionSink, LocalConnections};
use crate::manager::{ManagerInner, SubscriptionKey};
use crate::registry::{ConnectionRegistry, RegistryError};

/// Why handling one bus event did not produce a delivery.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("membership lookup failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("bus subscription failed: {0}")]
    Bus(#[from] BusError),
}

impl ListenerError {
    /// Fatal errors end the subscription; anything else only drops one message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ListenerError::Bus(_))
    }
}

/// Per-message delivery tally across the locally resident members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub targeted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: usize,
}

pub(crate) struct Listener {
    pub(crate) key: SubscriptionKey,
    pub(crate) generation: u64,
    pub(crate) registry: Arc<dyn ConnectionRegistry>,
    pub(crate) local: LocalConnections,
    pub(crate) send_timeout: Duration,
    pub(crate) manager: Weak<ManagerInner>,
}

impl Listener {
    pub(crate) async fn run(
        self,
        mut subscription: Box<dyn BusSubscription>,
        cancel: CancellationToken,
    ) {
        debug!(
            channel = %self.key.channel,
            instance_id = %self.key.instance_id,
            topic = subscription.topic(),
            "fan-out listener started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = subscription.next_event() => Some(event),
            };
            let Some(next) = next else {
                if let Err(err) = subscription.unsubscribe().await {
                    debug!(channel = %self.key.channel, error = %err, "unsubscribe on stop failed");
                }
                debug!(channel = %self.key.channel, "fan-out listener stopped");
                return;
            };

            let result = match next {
                Ok(event) if !event.is_message() => {
                    trace!(channel = %self.key.channel, kind = ?event.kind, "ignoring control event");
                    continue;
                }
                // A stop must not wait out a stalled send.
                Ok(event) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        if let Err(err) = subscription.unsubscribe().await {
                            debug!(channel = %self.key.channel, error = %err, "unsubscribe on stop failed");
                        }
                        debug!(channel = %self.key.channel, "fan-out listener stopped mid-delivery");
                        return;
                    }
                    result = self.deliver(&event.data) => result,
                },
                Err(err) => Err(ListenerError::Bus(err)),
            };

            match result {
                Ok(report) => {
                    debug!(
                        channel = %self.key.channel,
                        targeted = report.targeted,
                        delivered = report.delivered,
                        failed = report.failed,
                        timed_out = report.timed_out,
                        "fan-out delivered"
                    );
                }
                Err(err) if err.is_fatal() => {
                    error!(
                        channel = %self.key.channel,
                        instance_id = %self.key.instance_id,
                        error = %err,
                        "fan-out listener failed; removing subscription"
                    );
                    let _ = subscription.unsubscribe().await;
                    self.remove_self(err.to_string());
                    return;
                }
                Err(err) => {
                    warn!(channel = %self.key.channel, error = %err, "dropping fan-out message");
                }
            }
        }
    }

    /// Deliver one bus payload to every member of the channel that lives in
    /// this process. Membership is read fresh for every message.
    pub(crate) async fn deliver(&self, payload: &Bytes) -> Result<DeliveryReport, ListenerError> {
        serde_json::from_slice::<serde_json::Value>(payload)?;
        let text = String::from_utf8_lossy(payload);
        let text: &str = &text;

        let members = self
            .registry
            .get_connections_by_channel(&self.key.channel)
            .await?;

        let mut seen = HashSet::new();
        let targets: Vec<(String, Arc<dyn ConnectionSink>)> = members
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .filter_map(|id| self.local.get(&id).map(|sink| (id, sink)))
            .collect();

        let send_timeout = self.send_timeout;
        let sends = targets.iter().map(|(id, sink)| async move {
            (id, tokio::time::timeout(send_timeout, sink.send(text)).await)
        });

        let mut report = DeliveryReport {
            targeted: targets.len(),
            ..DeliveryReport::default()
        };
        for (connection_id, outcome) in join_all(sends).await {
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        channel = %self.key.channel,
                        %connection_id,
                        error = %err,
                        "fan-out send failed"
                    );
                }
                Err(_) => {
                    report.timed_out += 1;
                    warn!(
                        channel = %self.key.channel,
                        %connection_id,
                        timeout_ms = send_timeout.as_millis() as u64,
                        "fan-out send timed out"
                    );
                }
            }
        }
        Ok(report)
    }

    fn remove_self(&self, reason: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_terminated(&self.key, self.generation, reason);
        }
    }
}
