//! Distributor configuration.

use crate::error::{DistributorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the stream rate store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateStoreConfig {
    /// Maximum concurrent rate requests to nodes.
    pub max_request_parallelism: usize,
    /// How often rates are pulled from nodes (ms).
    pub stream_rate_update_interval_ms: u64,
    /// Timeout for a single node's rate request (ms).
    pub ingester_request_timeout_ms: u64,
    /// Rates not refreshed for this long are dropped (secs).
    pub rate_keep_alive_secs: u64,
    /// Log every refresh.
    pub debug: bool,
}

impl Default for RateStoreConfig {
    fn default() -> Self {
        Self {
            max_request_parallelism: 200,
            stream_rate_update_interval_ms: 1000,
            ingester_request_timeout_ms: 500,
            rate_keep_alive_secs: 600,
            debug: false,
        }
    }
}

impl RateStoreConfig {
    /// Refresh interval as a duration.
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.stream_rate_update_interval_ms.max(1))
    }

    /// Per-node request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ingester_request_timeout_ms)
    }

    /// Keep-alive window as a duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.rate_keep_alive_secs)
    }
}

/// Settings for write-failure logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteFailuresConfig {
    /// Bytes of failure messages logged per second per tenant (0 = disabled).
    pub log_rate_bytes: u64,
    /// Tag failure logs with `insight=true`.
    pub add_insights_label: bool,
}

impl Default for WriteFailuresConfig {
    fn default() -> Self {
        Self {
            log_rate_bytes: 1024,
            add_insights_label: false,
        }
    }
}

/// Configuration for a distributor instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Number of workers pushing batches to nodes.
    pub push_worker_count: usize,
    /// Timeout for a single node push (ms).
    pub remote_timeout_ms: u64,
    /// Write accepted streams to replica nodes.
    pub ingester_writes_enabled: bool,
    /// Write accepted streams to the append log.
    pub kafka_writes_enabled: bool,
    /// Consult the external limits service.
    pub ingest_limits_enabled: bool,
    /// Consult the external limits service without enforcing its answer.
    pub ingest_limits_dry_run_enabled: bool,
    /// Upper bound for one append-log record (bytes).
    pub max_record_size_bytes: usize,
    /// Maximum chunk age on the nodes (secs); time shards span half of it.
    pub max_chunk_age_secs: u64,
    /// How often per-tenant rate limits are re-read (secs).
    pub rate_limiter_recheck_secs: u64,
    /// Rate store settings.
    pub rate_store: RateStoreConfig,
    /// Write-failure logging settings.
    pub write_failures: WriteFailuresConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            push_worker_count: 256,
            remote_timeout_ms: 5000,
            ingester_writes_enabled: true,
            kafka_writes_enabled: false,
            ingest_limits_enabled: false,
            ingest_limits_dry_run_enabled: false,
            max_record_size_bytes: 15 << 20,
            max_chunk_age_secs: 2 * 60 * 60,
            rate_limiter_recheck_secs: 10,
            rate_store: RateStoreConfig::default(),
            write_failures: WriteFailuresConfig::default(),
        }
    }
}

impl DistributorConfig {
    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        if !self.ingester_writes_enabled && !self.kafka_writes_enabled {
            return Err(DistributorError::Config {
                msg: "at least one of kafka and ingester writes must be enabled".to_string(),
            });
        }
        if self.push_worker_count == 0 {
            return Err(DistributorError::Config {
                msg: "push_worker_count must be greater than zero".to_string(),
            });
        }
        if self.kafka_writes_enabled && self.max_record_size_bytes == 0 {
            return Err(DistributorError::Config {
                msg: "max_record_size_bytes must be greater than zero".to_string(),
            });
        }
        if self.max_chunk_age_secs < 2 {
            return Err(DistributorError::Config {
                msg: "max_chunk_age_secs must be at least 2".to_string(),
            });
        }
        Ok(())
    }

    /// Node push timeout.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Length of one time shard: half the maximum chunk age.
    pub fn time_shard_len(&self) -> Duration {
        Duration::from_secs(self.max_chunk_age_secs / 2)
    }

    /// Rate limiter recheck period.
    pub fn rate_limiter_recheck(&self) -> Duration {
        Duration::from_secs(self.rate_limiter_recheck_secs)
    }

    /// Number of write paths enabled.
    pub fn enabled_sinks(&self) -> usize {
        usize::from(self.ingester_writes_enabled) + usize::from(self.kafka_writes_enabled)
    }
}
