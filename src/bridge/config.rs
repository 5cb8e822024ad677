//! Bridge configuration

use std::time::Duration;

use serde_json::Value;

/// Interval between bootstrap announcements
pub const DEFAULT_BOOTSTRAP_INTERVAL: Duration = Duration::from_millis(50);

/// Bridge endpoint configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How often the host re-announces readiness while bootstrapping
    pub bootstrap_interval: Duration,
    /// Reject outstanding requests after this long; `None` waits forever
    pub request_timeout: Option<Duration>,
    /// Host-supplied payload carried by every bootstrap message
    pub bootstrap_payload: Value,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bootstrap_interval: DEFAULT_BOOTSTRAP_INTERVAL,
            request_timeout: None,
            bootstrap_payload: Value::Null,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `GUESTLINK_BOOTSTRAP_INTERVAL_MS` and
    /// `GUESTLINK_REQUEST_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
        };

        let mut config = Self::default();
        if let Some(interval) = millis("GUESTLINK_BOOTSTRAP_INTERVAL_MS") {
            config.bootstrap_interval = interval;
        }
        config.request_timeout = millis("GUESTLINK_REQUEST_TIMEOUT_MS");
        config
    }

    pub fn with_bootstrap_interval(mut self, interval: Duration) -> Self {
        self.bootstrap_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_bootstrap_payload(mut self, payload: Value) -> Self {
        self.bootstrap_payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.bootstrap_interval, Duration::from_millis(50));
        assert!(config.request_timeout.is_none());
        assert_eq!(config.bootstrap_payload, Value::Null);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = BridgeConfig::from_lookup(|key| match key {
            "GUESTLINK_BOOTSTRAP_INTERVAL_MS" => Some("20".to_string()),
            "GUESTLINK_REQUEST_TIMEOUT_MS" => Some("1500".to_string()),
            _ => None,
        });
        assert_eq!(config.bootstrap_interval, Duration::from_millis(20));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_lookup_ignores_garbage_and_zero() {
        let config = BridgeConfig::from_lookup(|key| match key {
            "GUESTLINK_BOOTSTRAP_INTERVAL_MS" => Some("soon".to_string()),
            "GUESTLINK_REQUEST_TIMEOUT_MS" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.bootstrap_interval, DEFAULT_BOOTSTRAP_INTERVAL);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn test_builders() {
        let config = BridgeConfig::default()
            .with_bootstrap_interval(Duration::from_millis(10))
            .with_request_timeout(Duration::from_secs(1))
            .with_bootstrap_payload(json!({"apiSource": "client.js"}));
        assert_eq!(config.bootstrap_interval, Duration::from_millis(10));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.bootstrap_payload["apiSource"], "client.js");
    }
}
