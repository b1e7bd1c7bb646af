//! Fragment scheduler configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`FragmentScheduler`](crate::FragmentScheduler).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentConfig {
    /// Queued segments, across all wavelets, at which the scheduler reports
    /// itself full.
    pub max_queued_segments: usize,
    /// Fetches allowed in flight at once.
    pub max_in_flight: usize,
    /// Reply size the server should try to reach (in bytes).
    pub min_reply_size: usize,
    /// Reply size the server must not exceed (in bytes).
    pub max_reply_size: usize,
    /// Blips per fetch request.
    pub max_blips: usize,
    /// Delay before a scheduled pass runs (in milliseconds). Zero yields
    /// once so calls made in the same turn land in the same batch.
    pub schedule_delay_ms: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            max_queued_segments: 50,
            max_in_flight: 2,
            min_reply_size: 8 * 1024,
            max_reply_size: 64 * 1024,
            max_blips: 25,
            schedule_delay_ms: 0,
        }
    }
}

/// Builder for fragment scheduler configuration.
pub struct FragmentConfigBuilder {
    config: FragmentConfig,
}

impl FragmentConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FragmentConfig::default(),
        }
    }

    pub fn max_queued_segments(mut self, count: usize) -> Self {
        self.config.max_queued_segments = count;
        self
    }

    pub fn max_in_flight(mut self, count: usize) -> Self {
        self.config.max_in_flight = count;
        self
    }

    pub fn reply_size(mut self, min: usize, max: usize) -> Self {
        self.config.min_reply_size = min;
        self.config.max_reply_size = max;
        self
    }

    pub fn max_blips(mut self, count: usize) -> Self {
        self.config.max_blips = count;
        self
    }

    pub fn schedule_delay(mut self, ms: u64) -> Self {
        self.config.schedule_delay_ms = ms;
        self
    }

    pub fn build(self) -> FragmentConfig {
        self.config
    }
}

impl Default for FragmentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_config_builder() {
        let config = FragmentConfigBuilder::new()
            .max_queued_segments(10)
            .max_in_flight(4)
            .reply_size(100, 1000)
            .max_blips(3)
            .schedule_delay(20)
            .build();

        assert_eq!(config.max_queued_segments, 10);
        assert_eq!(config.max_in_flight, 4);
        assert_eq!((config.min_reply_size, config.max_reply_size), (100, 1000));
        assert_eq!(config.max_blips, 3);
        assert_eq!(config.schedule_delay_ms, 20);
    }

    #[test]
    fn test_defaults() {
        let config = FragmentConfig::default();
        assert_eq!(config.max_queued_segments, 50);
        assert_eq!(config.max_in_flight, 2);
    }
}
