//! Channel configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`TransportChannel`](crate::TransportChannel).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// How often to retry while disconnected (in milliseconds).
    pub reconnect_interval_ms: u64,
    /// Consecutive failed attempts on the primary connector before switching
    /// to the fallback for good.
    pub fallback_after_failures: u32,
    /// Credential re-sent as a `TransportAuthenticationRequest` on every
    /// connect.
    pub session_token: Option<String>,
    /// Buffer size of the connection event broadcast.
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 1000,
            fallback_after_failures: 3,
            session_token: None,
            event_capacity: 64,
        }
    }
}

/// Builder for channel configuration.
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
}

impl ChannelConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ChannelConfig::default(),
        }
    }

    pub fn reconnect_interval(mut self, ms: u64) -> Self {
        self.config.reconnect_interval_ms = ms;
        self
    }

    pub fn fallback_after_failures(mut self, attempts: u32) -> Self {
        self.config.fallback_after_failures = attempts;
        self
    }

    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.config.session_token = Some(token.into());
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> ChannelConfig {
        self.config
    }
}

impl Default for ChannelConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfigBuilder::new()
            .reconnect_interval(250)
            .fallback_after_failures(5)
            .session_token("secret")
            .event_capacity(8)
            .build();

        assert_eq!(config.reconnect_interval_ms, 250);
        assert_eq!(config.fallback_after_failures, 5);
        assert_eq!(config.session_token.as_deref(), Some("secret"));
        assert_eq!(config.event_capacity, 8);
    }

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.reconnect_interval_ms, 1000);
        assert_eq!(config.fallback_after_failures, 3);
        assert!(config.session_token.is_none());
    }
}
