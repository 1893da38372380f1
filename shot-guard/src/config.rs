use serde::Deserialize;
use serde::Serialize;

use crate::error::GuardError;
use crate::error::Result;

/// Geometry of per-resource statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatConfig {
    /// Buckets in each resource's underlying array.
    pub sample_count_total: u32,
    /// Span of each resource's underlying array.
    pub interval_ms_total: u32,
    /// Buckets in the realtime window (the one behind `pass_qps()` and friends).
    pub metric_sample_count: u32,
    pub metric_interval_ms: u32,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            sample_count_total: 20,
            interval_ms_total: 10_000,
            metric_sample_count: 2,
            metric_interval_ms: 1_000,
        }
    }
}

/// Token server tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Bound of the key-expiry queue.
    pub expire_queue_capacity: usize,
    /// Pause before retrying a failed expiry.
    pub expire_retry_backoff_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            expire_queue_capacity: 1_024,
            expire_retry_backoff_ms: 50,
        }
    }
}

/// Everything the guard needs at construction time.
///
/// Loading this from files or the environment is left to the embedding
/// application; the type only derives `serde` so any loader can produce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub stat: StatConfig,
    /// Cap on distinct resources with statistics; calls beyond it pass unrecorded.
    pub max_resource_amount: usize,
    pub cluster: ClusterConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            stat: StatConfig::default(),
            max_resource_amount: 10_000,
            cluster: ClusterConfig::default(),
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> Result<()> {
        let stat = &self.stat;
        if stat.sample_count_total == 0 || stat.metric_sample_count == 0 {
            return Err(GuardError::InvalidConfig(
                "sample counts must be positive".into(),
            ));
        }
        if stat.interval_ms_total == 0 || stat.interval_ms_total % stat.sample_count_total != 0 {
            return Err(GuardError::InvalidConfig(format!(
                "interval_ms_total {} must be a positive multiple of sample_count_total {}",
                stat.interval_ms_total, stat.sample_count_total
            )));
        }
        if stat.metric_interval_ms == 0
            || stat.metric_interval_ms > stat.interval_ms_total
            || stat.interval_ms_total % stat.metric_interval_ms != 0
        {
            return Err(GuardError::InvalidConfig(format!(
                "metric_interval_ms {} must divide interval_ms_total {}",
                stat.metric_interval_ms, stat.interval_ms_total
            )));
        }
        let bucket = stat.interval_ms_total / stat.sample_count_total;
        if stat.metric_interval_ms % stat.metric_sample_count != 0
            || (stat.metric_interval_ms / stat.metric_sample_count) % bucket != 0
        {
            return Err(GuardError::InvalidConfig(format!(
                "metric buckets must be a multiple of the {bucket}ms total bucket"
            )));
        }
        if self.max_resource_amount == 0 {
            return Err(GuardError::InvalidConfig(
                "max_resource_amount must be positive".into(),
            ));
        }
        if self.cluster.expire_queue_capacity == 0 {
            return Err(GuardError::InvalidConfig(
                "expire_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        GuardConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: GuardConfig =
            serde_json::from_str(r#"{ "stat": { "metric_interval_ms": 2000, "metric_sample_count": 4 } }"#)
                .unwrap();

        assert_eq!(config.stat.metric_interval_ms, 2_000);
        assert_eq!(config.stat.sample_count_total, 20);
        assert_eq!(config.max_resource_amount, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn misaligned_metric_window_is_rejected() {
        let config = GuardConfig {
            stat: StatConfig {
                metric_interval_ms: 1_000,
                metric_sample_count: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GuardError::InvalidConfig(_))
        ));
    }
}
