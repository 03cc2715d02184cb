//! Usage accounting for discarded data.

use crate::labels::Labels;
use dashmap::DashMap;

/// Receives discarded byte counts for billing or reporting.
pub trait UsageTracker: Send + Sync {
    /// Record `bytes` discarded for a stream.
    fn discarded_bytes_add(
        &self,
        tenant_id: &str,
        reason: &str,
        labels: &Labels,
        bytes: f64,
        format: &str,
    );
}

/// In-process totals per tenant and reason.
#[derive(Debug, Default)]
pub struct DiscardedBytesTotals {
    totals: DashMap<(String, String), f64>,
}

impl DiscardedBytesTotals {
    /// Create empty totals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded for a tenant and reason.
    pub fn get(&self, tenant_id: &str, reason: &str) -> f64 {
        self.totals
            .get(&(tenant_id.to_string(), reason.to_string()))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// Bytes discarded for a tenant across all reasons.
    pub fn tenant_total(&self, tenant_id: &str) -> f64 {
        self.totals
            .iter()
            .filter(|e| e.key().0 == tenant_id)
            .map(|e| *e.value())
            .sum()
    }
}

impl UsageTracker for DiscardedBytesTotals {
    fn discarded_bytes_add(
        &self,
        tenant_id: &str,
        reason: &str,
        _labels: &Labels,
        bytes: f64,
        _format: &str,
    ) {
        *self
            .totals
            .entry((tenant_id.to_string(), reason.to_string()))
            .or_insert(0.0) += bytes;
    }
}
