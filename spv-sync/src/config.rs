//! Tunables for the header and filter-header sync engines.

use std::time::Duration;

use crate::chain::DEFAULT_HEADER_CHAIN_CAPACITY;
use crate::network::FILTER_TYPE_BASIC;

/// Configuration for the sync engines.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of recent headers kept in each in-memory header chain.
    pub header_chain_capacity: usize,

    /// Spacing of filter-header checkpoints, in blocks.
    pub filter_checkpoint_interval: u32,

    /// Most filter hashes a peer returns in one cfheaders message.
    pub max_cfheaders_per_msg: u32,

    /// How long a fan-out query waits for all peers to answer.
    pub query_timeout: Duration,

    /// Pause between failed checkpoint negotiation rounds.
    pub negotiation_retry_delay: Duration,

    /// Negotiation rounds attempted before the engine goes back to waiting for
    /// header progress.
    pub max_negotiation_attempts: u32,

    /// How long the sync peer may stay silent before another peer is selected.
    pub sync_peer_stall_tolerance: Duration,

    /// Oldest best-header timestamp, relative to adjusted time, that still counts as synced.
    pub synced_tip_max_age: Duration,

    /// Capacity of the header engine's inbound event queue.
    pub inbound_queue_capacity: usize,

    /// Interval between header progress summaries.
    pub progress_log_interval: Duration,

    /// Compact filter type requested from peers.
    pub filter_type: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            header_chain_capacity: DEFAULT_HEADER_CHAIN_CAPACITY,
            filter_checkpoint_interval: 1000,
            max_cfheaders_per_msg: 2000,
            query_timeout: Duration::from_secs(5),
            negotiation_retry_delay: Duration::from_secs(5),
            max_negotiation_attempts: 5,
            sync_peer_stall_tolerance: Duration::from_secs(60),
            synced_tip_max_age: Duration::from_secs(24 * 60 * 60),
            inbound_queue_capacity: 128,
            progress_log_interval: Duration::from_secs(10),
            filter_type: FILTER_TYPE_BASIC,
        }
    }
}

impl SyncConfig {
    pub fn with_header_chain_capacity(mut self, capacity: usize) -> Self {
        self.header_chain_capacity = capacity;
        self
    }

    /// Set the filter checkpoint spacing.
    pub fn with_filter_checkpoint_interval(mut self, interval: u32) -> Self {
        self.filter_checkpoint_interval = interval;
        self
    }

    pub fn with_max_cfheaders_per_msg(mut self, max: u32) -> Self {
        self.max_cfheaders_per_msg = max;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the bounded retry policy for checkpoint negotiation.
    pub fn with_negotiation_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_negotiation_attempts = attempts;
        self.negotiation_retry_delay = delay;
        self
    }

    pub fn with_sync_peer_stall_tolerance(mut self, tolerance: Duration) -> Self {
        self.sync_peer_stall_tolerance = tolerance;
        self
    }

    pub fn with_synced_tip_max_age(mut self, age: Duration) -> Self {
        self.synced_tip_max_age = age;
        self
    }

    pub fn with_inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity;
        self
    }

    pub fn with_progress_log_interval(mut self, interval: Duration) -> Self {
        self.progress_log_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.header_chain_capacity == 0 {
            return Err("header_chain_capacity must be > 0".to_string());
        }

        if self.filter_checkpoint_interval == 0 {
            return Err("filter_checkpoint_interval must be > 0".to_string());
        }

        if self.max_cfheaders_per_msg < self.filter_checkpoint_interval {
            return Err(format!(
                "max_cfheaders_per_msg ({}) must be >= filter_checkpoint_interval ({})",
                self.max_cfheaders_per_msg, self.filter_checkpoint_interval
            ));
        }

        if self.query_timeout.is_zero() {
            return Err("query_timeout must be > 0".to_string());
        }

        if self.max_negotiation_attempts == 0 {
            return Err("max_negotiation_attempts must be > 0".to_string());
        }

        if self.inbound_queue_capacity == 0 {
            return Err("inbound_queue_capacity must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.header_chain_capacity, 10_000);
        assert_eq!(config.filter_checkpoint_interval, 1000);
        assert_eq!(config.query_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SyncConfig::default().with_header_chain_capacity(0).validate().is_err());
        assert!(SyncConfig::default().with_filter_checkpoint_interval(0).validate().is_err());
        assert!(SyncConfig::default()
            .with_filter_checkpoint_interval(100)
            .with_max_cfheaders_per_msg(50)
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_negotiation_retry(0, Duration::ZERO)
            .validate()
            .is_err());
    }
}
