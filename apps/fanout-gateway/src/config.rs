use std::time::Duration;

use channel_fanout::FanOutConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub instance_id: String,
    /// Unset means in-process bus and registry.
    pub redis_url: Option<String>,
    pub pubsub_enabled: bool,
    pub send_timeout: Duration,
    pub stop_timeout: Duration,
    pub connection_ttl_seconds: u64,
    pub log_filter: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let port = lookup("FANOUT_GATEWAY_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let instance_id = lookup("FANOUT_INSTANCE_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(defaults.instance_id);
        let redis_url = lookup("REDIS_URL").filter(|url| !url.trim().is_empty());
        let pubsub_enabled = lookup("FANOUT_PUBSUB_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(defaults.pubsub_enabled);
        let send_timeout = lookup("FANOUT_SEND_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_timeout);
        let stop_timeout = lookup("FANOUT_STOP_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.stop_timeout);
        let connection_ttl_seconds = lookup("FANOUT_CONNECTION_TTL")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.connection_ttl_seconds);
        let log_filter = lookup("RUST_LOG").unwrap_or(defaults.log_filter);

        Self {
            port,
            instance_id,
            redis_url,
            pubsub_enabled,
            send_timeout,
            stop_timeout,
            connection_ttl_seconds,
            log_filter,
        }
    }

    pub fn fanout_config(&self) -> FanOutConfig {
        FanOutConfig {
            send_timeout: self.send_timeout,
            stop_timeout: self.stop_timeout,
            ..FanOutConfig::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            instance_id: format!("gateway-{}", uuid::Uuid::new_v4()),
            redis_url: None,
            pubsub_enabled: true,
            send_timeout: Duration::from_millis(5_000),
            stop_timeout: Duration::from_millis(5_000),
            connection_ttl_seconds: 3_600,
            log_filter: "info,fanout_gateway=debug,channel_fanout=debug".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_timeout::timeout]
    fn defaults_without_environment() {
        let cfg = GatewayConfig::from_lookup(|_| None);
        assert_eq!(cfg.port, 8080);
        assert!(cfg.instance_id.starts_with("gateway-"));
        assert!(cfg.redis_url.is_none());
        assert!(cfg.pubsub_enabled);
        assert_eq!(cfg.send_timeout, Duration::from_secs(5));
        assert_eq!(cfg.connection_ttl_seconds, 3_600);
    }

    #[test_timeout::timeout]
    fn reads_overrides() {
        let cfg = GatewayConfig::from_lookup(lookup_from(&[
            ("FANOUT_GATEWAY_PORT", "9001"),
            ("FANOUT_INSTANCE_ID", "gw-a"),
            ("REDIS_URL", "redis://cache:6379"),
            ("FANOUT_PUBSUB_ENABLED", "false"),
            ("FANOUT_SEND_TIMEOUT_MS", "250"),
            ("FANOUT_STOP_TIMEOUT_MS", "not-a-number"),
        ]));
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.instance_id, "gw-a");
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert!(!cfg.pubsub_enabled);
        assert_eq!(cfg.fanout_config().send_timeout, Duration::from_millis(250));
        assert_eq!(cfg.fanout_config().stop_timeout, Duration::from_secs(5));
    }
}
