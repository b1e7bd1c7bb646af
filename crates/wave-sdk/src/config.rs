//! Client configuration.

use serde::{Deserialize, Serialize};
use wave_channel::ChannelConfig;
use wave_core::ParticipantId;
use wave_fragments::FragmentConfig;

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Author of every delta this client submits.
    pub participant: ParticipantId,
    pub channel: ChannelConfig,
    pub fragments: FragmentConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            participant: ParticipantId::new("anonymous@localhost"),
            channel: ChannelConfig::default(),
            fragments: FragmentConfig::default(),
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn participant(mut self, address: impl Into<String>) -> Self {
        self.config.participant = ParticipantId::new(address);
        self
    }

    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.config.channel = config;
        self
    }

    pub fn fragments(mut self, config: FragmentConfig) -> Self {
        self.config.fragments = config;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
