use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TOPIC_PREFIX: &str = "websocket:";

/// Bus topic carrying traffic for a logical channel.
pub fn topic_for(channel: &str) -> String {
    format!("{TOPIC_PREFIX}{channel}")
}

/// The JSON document published on a channel's bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub channel: String,
    pub message: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source_connection_id: Option<String>,
}

impl WireEnvelope {
    pub fn new(
        channel: impl Into<String>,
        message: serde_json::Value,
        source_connection_id: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            message,
            timestamp: Utc::now(),
            source_connection_id,
        }
    }
}

/// Result of [`crate::FanOutManager::publish_to_channel`].
///
/// `subscribers` is the bus-level listener count, not a delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published {
        channel: String,
        subscribers: Option<usize>,
    },
    Failed {
        error: String,
    },
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

#[derive(Serialize)]
struct PublishOutcomeWire<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscribers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl Serialize for PublishOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            PublishOutcome::Published {
                channel,
                subscribers,
            } => PublishOutcomeWire {
                success: true,
                channel: Some(channel.as_str()),
                subscribers: *subscribers,
                error: None,
            },
            PublishOutcome::Failed { error } => PublishOutcomeWire {
                success: false,
                channel: None,
                subscribers: None,
                error: Some(error.as_str()),
            },
        };
        wire.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn topic_is_namespaced() {
        assert_eq!(topic_for("guide"), "websocket:guide");
        assert_eq!(topic_for("pillar:content"), "websocket:pillar:content");
    }

    #[test_timeout::timeout]
    fn envelope_serializes_null_source() {
        let env = WireEnvelope::new("guide", json!({"text": "hello"}), None);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["channel"], "guide");
        assert_eq!(value["message"], json!({"text": "hello"}));
        assert!(value["source_connection_id"].is_null());

        let ts = value["timestamp"].as_str().expect("timestamp string");
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test_timeout::timeout]
    fn envelope_accepts_missing_source() {
        let raw = r#"{"channel":"guide","message":1,"timestamp":"2026-01-01T00:00:00Z"}"#;
        let env: WireEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.source_connection_id, None);
        assert_eq!(env.message, json!(1));
    }

    #[test_timeout::timeout]
    fn publish_outcome_wire_shape() {
        let ok = PublishOutcome::Published {
            channel: "guide".into(),
            subscribers: Some(2),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": true, "channel": "guide", "subscribers": 2})
        );

        let failed = PublishOutcome::Failed {
            error: "bus channel closed".into(),
        };
        assert!(!failed.is_success());
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"success": false, "error": "bus channel closed"})
        );
    }
}
