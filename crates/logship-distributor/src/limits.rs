//! Per-tenant limits.
//!
//! [`TenantLimits`] is the full set of knobs the push path reads for one
//! tenant. [`Overrides`] serves defaults plus per-tenant replacements behind
//! the [`Limits`] trait, which is all the distributor depends on.

use crate::labels::Labels;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Ingestion rate limiting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestionRateStrategy {
    /// Every distributor enforces the full limit.
    #[default]
    Local,
    /// The limit is shared across all healthy distributors.
    Global,
}

/// Stream sharding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardStreamsConfig {
    /// Enable rate-based sharding.
    pub enabled: bool,
    /// Log sharding decisions.
    pub logging_enabled: bool,
    /// Target byte rate per shard.
    pub desired_rate_bytes: i64,
    /// Enable time-based sharding of old entries.
    pub time_sharding_enabled: bool,
    /// Entries newer than this are never time-sharded (secs).
    pub time_sharding_ignore_recent_secs: u64,
}

impl Default for ShardStreamsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            logging_enabled: false,
            desired_rate_bytes: 1536 * 1024,
            time_sharding_enabled: false,
            time_sharding_ignore_recent_secs: 40 * 60,
        }
    }
}

impl ShardStreamsConfig {
    /// Ignore-recent window as a duration.
    pub fn time_sharding_ignore_recent(&self) -> Duration {
        Duration::from_secs(self.time_sharding_ignore_recent_secs)
    }
}

/// Exact-match label selector used to map streams onto policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatcher {
    /// Label name.
    pub name: String,
    /// Required value.
    pub value: String,
}

/// Limits applied to one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimits {
    /// Maximum line size in bytes (0 = unlimited).
    pub max_line_size: usize,
    /// Truncate long lines instead of rejecting them.
    pub max_line_size_truncate: bool,
    /// Suffix appended to truncated lines.
    pub max_line_size_truncate_identifier: String,
    /// Maximum number of labels per stream.
    pub max_label_names_per_series: usize,
    /// Maximum label name length.
    pub max_label_name_length: usize,
    /// Maximum label value length.
    pub max_label_value_length: usize,
    /// Reject entries older than `reject_old_samples_max_age_secs`.
    pub reject_old_samples: bool,
    /// Age limit for old entries (secs).
    pub reject_old_samples_max_age_secs: u64,
    /// How far into the future entries may be (secs).
    pub creation_grace_period_secs: u64,
    /// Accept structured metadata.
    pub allow_structured_metadata: bool,
    /// Maximum structured metadata bytes per entry (0 = unlimited).
    pub max_structured_metadata_size: usize,
    /// Maximum structured metadata pairs per entry (0 = unlimited).
    pub max_structured_metadata_entries_count: usize,
    /// Labels every stream must carry.
    pub enforced_labels: Vec<String>,
    /// Labels required per policy.
    pub policy_enforced_labels: HashMap<String, Vec<String>>,
    /// Policy name to the matchers selecting its streams.
    pub policy_stream_mapping: BTreeMap<String, Vec<LabelMatcher>>,
    /// Stream sharding settings.
    pub shard_streams: ShardStreamsConfig,
    /// Rate limiting strategy.
    pub ingestion_rate_strategy: IngestionRateStrategy,
    /// Ingestion rate in MB/s.
    pub ingestion_rate_mb: f64,
    /// Ingestion burst in MB.
    pub ingestion_burst_size_mb: f64,
    /// Minimum push latency (ms).
    pub simulated_push_latency_ms: u64,
    /// Bump duplicate timestamps of differing lines by one nanosecond.
    pub increment_duplicate_timestamp: bool,
    /// Add a `detected_level` structured metadata field.
    pub discover_log_levels: bool,
    /// Target field name to hint keys for generic field discovery.
    pub discover_generic_fields: BTreeMap<String, Vec<String>>,
    /// Unix seconds until which the tenant's ingestion is blocked.
    pub blocked_ingestion_until: Option<i64>,
    /// Status code returned for blocked ingestion.
    pub blocked_ingestion_status_code: u16,
    /// Unix seconds until which a policy's ingestion is blocked.
    pub block_policy_ingestion_until: HashMap<String, i64>,
    /// Number of append-log partitions a tenant writes to (0 = all).
    pub ingestion_partitions_tenant_shard_size: usize,
    /// Log push errors for this tenant.
    pub limited_log_push_errors: bool,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_line_size: 256 * 1024,
            max_line_size_truncate: false,
            max_line_size_truncate_identifier: String::new(),
            max_label_names_per_series: 15,
            max_label_name_length: 1024,
            max_label_value_length: 2048,
            reject_old_samples: true,
            reject_old_samples_max_age_secs: 7 * 24 * 60 * 60,
            creation_grace_period_secs: 10 * 60,
            allow_structured_metadata: true,
            max_structured_metadata_size: 64 * 1024,
            max_structured_metadata_entries_count: 128,
            enforced_labels: Vec::new(),
            policy_enforced_labels: HashMap::new(),
            policy_stream_mapping: BTreeMap::new(),
            shard_streams: ShardStreamsConfig::default(),
            ingestion_rate_strategy: IngestionRateStrategy::Local,
            ingestion_rate_mb: 4.0,
            ingestion_burst_size_mb: 6.0,
            simulated_push_latency_ms: 0,
            increment_duplicate_timestamp: false,
            discover_log_levels: false,
            discover_generic_fields: BTreeMap::new(),
            blocked_ingestion_until: None,
            blocked_ingestion_status_code: 260,
            block_policy_ingestion_until: HashMap::new(),
            ingestion_partitions_tenant_shard_size: 0,
            limited_log_push_errors: true,
        }
    }
}

impl TenantLimits {
    /// Ingestion rate in bytes per second.
    pub fn ingestion_rate_bytes(&self) -> f64 {
        self.ingestion_rate_mb * (1 << 20) as f64
    }

    /// Ingestion burst in bytes.
    pub fn ingestion_burst_size_bytes(&self) -> usize {
        (self.ingestion_burst_size_mb * (1 << 20) as f64) as usize
    }

    /// Simulated latency as a duration.
    pub fn simulated_push_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_push_latency_ms)
    }

    /// Labels required for streams under `policy`.
    pub fn policy_enforced_labels(&self, policy: &str) -> &[String] {
        self.policy_enforced_labels
            .get(policy)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The policy a stream belongs to, or an empty string.
    ///
    /// Policies are evaluated in name order and the first full match wins.
    pub fn policy_for(&self, tenant_id: &str, labels: &Labels) -> String {
        let mut matched = self
            .policy_stream_mapping
            .iter()
            .filter(|(_, matchers)| {
                !matchers.is_empty()
                    && matchers
                        .iter()
                        .all(|m| labels.get(&m.name) == Some(m.value.as_str()))
            })
            .map(|(name, _)| name.as_str());

        let Some(policy) = matched.next() else {
            return String::new();
        };
        let others: Vec<&str> = matched.collect();
        if !others.is_empty() {
            warn!(
                tenant = tenant_id,
                stream = %labels,
                policy,
                ignored = ?others,
                "multiple policies matched for the same stream"
            );
        }
        policy.to_string()
    }
}

/// Source of per-tenant limits.
pub trait Limits: Send + Sync {
    /// Effective limits for a tenant.
    fn tenant_limits(&self, tenant_id: &str) -> Arc<TenantLimits>;
}

/// Defaults plus per-tenant overrides, replaceable at runtime.
pub struct Overrides {
    defaults: Arc<TenantLimits>,
    tenants: RwLock<HashMap<String, Arc<TenantLimits>>>,
}

impl Overrides {
    /// Create overrides with the given defaults and no tenant entries.
    pub fn new(defaults: TenantLimits) -> Self {
        Self {
            defaults: Arc::new(defaults),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Set a tenant's limits.
    pub fn set_tenant(&self, tenant_id: &str, limits: TenantLimits) {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        tenants.insert(tenant_id.to_string(), Arc::new(limits));
    }

    /// Remove a tenant's limits, falling back to defaults.
    pub fn remove_tenant(&self, tenant_id: &str) -> bool {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        tenants.remove(tenant_id).is_some()
    }

    /// Replace all tenant entries from a JSON object of tenant id to limits.
    ///
    /// Missing fields in each tenant entry take their default values.
    pub fn load_json(&self, json: &str) -> Result<usize, serde_json::Error> {
        let parsed: HashMap<String, TenantLimits> = serde_json::from_str(json)?;
        let count = parsed.len();
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        *tenants = parsed
            .into_iter()
            .map(|(tenant, limits)| (tenant, Arc::new(limits)))
            .collect();
        Ok(count)
    }
}

impl Default for Overrides {
    fn default() -> Self {
        Self::new(TenantLimits::default())
    }
}

impl Limits for Overrides {
    fn tenant_limits(&self, tenant_id: &str) -> Arc<TenantLimits> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}
