//! Processor Configuration

use crate::consumer::StartPosition;
use std::collections::HashMap;
use std::time::Duration;

/// Default polling cadence for the balancing loop.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Default batch ceiling per receive call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 300;

/// Configuration for an [`EventProcessor`](crate::EventProcessor).
///
/// `ownership_timeout` defaults to twice the polling interval: a processor
/// that misses one renewal round is still covered, while one that misses
/// two is presumed dead and its partitions become claimable.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Seconds between balancing rounds (default: 10s)
    pub polling_interval: Duration,

    /// Age at which an unrenewed ownership record becomes claimable
    /// (default: 2 × polling_interval)
    pub ownership_timeout: Duration,

    /// Starting position when a partition has neither a checkpoint nor a
    /// per-partition override (default: Latest)
    pub initial_position: StartPosition,

    /// Per-partition starting-position overrides
    pub initial_positions: HashMap<String, StartPosition>,

    /// Exclusive-reader priority passed through to the stream consumer
    pub owner_level: Option<i64>,

    /// Pin the processor to one partition, disabling balancing
    pub partition_id: Option<String>,

    /// Maximum events per receive call (default: 300)
    pub max_batch_size: usize,

    /// Track "last enqueued" diagnostics on each partition context
    pub track_last_enqueued: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            ownership_timeout: DEFAULT_POLLING_INTERVAL * 2,
            initial_position: StartPosition::Latest,
            initial_positions: HashMap::new(),
            owner_level: None,
            partition_id: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            track_last_enqueued: false,
        }
    }
}

impl ProcessorConfig {
    /// Starting position for a partition with no checkpoint.
    pub fn initial_position_for(&self, partition_id: &str) -> StartPosition {
        self.initial_positions
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| self.initial_position.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.polling_interval, Duration::from_secs(10));
        assert_eq!(config.ownership_timeout, Duration::from_secs(20));
        assert_eq!(config.initial_position, StartPosition::Latest);
        assert!(config.partition_id.is_none());
    }

    #[test]
    fn test_per_partition_position_override() {
        let mut config = ProcessorConfig::default();
        config
            .initial_positions
            .insert("1".to_string(), StartPosition::Earliest);

        assert_eq!(config.initial_position_for("1"), StartPosition::Earliest);
        assert_eq!(config.initial_position_for("0"), StartPosition::Latest);
    }
}
