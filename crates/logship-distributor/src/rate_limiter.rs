//! Per-tenant ingestion rate limiting.
//!
//! Each tenant gets a token bucket sized by its burst and refilled at its
//! rate. The rate and burst come from a [`RateLimiterStrategy`] and are
//! re-read every `recheck_period`, so limit changes take effect without
//! rebuilding buckets.

use crate::limits::{IngestionRateStrategy, Limits};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Yields the rate and burst a tenant's bucket should use.
pub trait RateLimiterStrategy: Send + Sync {
    /// Sustained rate in bytes per second.
    fn limit(&self, tenant_id: &str) -> f64;
    /// Maximum burst in bytes.
    fn burst(&self, tenant_id: &str) -> usize;
}

/// Number of healthy distributors sharing a global limit.
pub trait HealthyInstancesCount: Send + Sync {
    /// Current healthy distributor count.
    fn healthy_instances_count(&self) -> usize;
}

/// Settable healthy instance count.
#[derive(Debug)]
pub struct InstanceCounter(AtomicUsize);

impl InstanceCounter {
    /// Counter starting at `count`.
    pub fn new(count: usize) -> Self {
        Self(AtomicUsize::new(count))
    }

    /// Update the count.
    pub fn set(&self, count: usize) {
        self.0.store(count, Ordering::Relaxed);
    }
}

impl Default for InstanceCounter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HealthyInstancesCount for InstanceCounter {
    fn healthy_instances_count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Every distributor enforces the tenant's full limit.
pub struct LocalStrategy {
    limits: Arc<dyn Limits>,
}

impl LocalStrategy {
    /// Strategy reading the given limits.
    pub fn new(limits: Arc<dyn Limits>) -> Self {
        Self { limits }
    }
}

impl RateLimiterStrategy for LocalStrategy {
    fn limit(&self, tenant_id: &str) -> f64 {
        self.limits.tenant_limits(tenant_id).ingestion_rate_bytes()
    }

    fn burst(&self, tenant_id: &str) -> usize {
        self.limits.tenant_limits(tenant_id).ingestion_burst_size_bytes()
    }
}

/// The tenant's limit is split evenly across healthy distributors. The burst
/// is not split.
pub struct GlobalStrategy {
    limits: Arc<dyn Limits>,
    instances: Arc<dyn HealthyInstancesCount>,
}

impl GlobalStrategy {
    /// Strategy dividing the limit by the healthy instance count.
    pub fn new(limits: Arc<dyn Limits>, instances: Arc<dyn HealthyInstancesCount>) -> Self {
        Self { limits, instances }
    }
}

impl RateLimiterStrategy for GlobalStrategy {
    fn limit(&self, tenant_id: &str) -> f64 {
        let count = self.instances.healthy_instances_count().max(1);
        self.limits.tenant_limits(tenant_id).ingestion_rate_bytes() / count as f64
    }

    fn burst(&self, tenant_id: &str) -> usize {
        self.limits.tenant_limits(tenant_id).ingestion_burst_size_bytes()
    }
}

/// Picks local or global behaviour from each tenant's configured strategy.
pub struct TenantRateStrategy {
    limits: Arc<dyn Limits>,
    local: LocalStrategy,
    global: GlobalStrategy,
}

impl TenantRateStrategy {
    /// Strategy dispatching on `ingestion_rate_strategy`.
    pub fn new(limits: Arc<dyn Limits>, instances: Arc<dyn HealthyInstancesCount>) -> Self {
        Self {
            local: LocalStrategy::new(limits.clone()),
            global: GlobalStrategy::new(limits.clone(), instances),
            limits,
        }
    }

    fn strategy_for(&self, tenant_id: &str) -> &dyn RateLimiterStrategy {
        match self.limits.tenant_limits(tenant_id).ingestion_rate_strategy {
            IngestionRateStrategy::Local => &self.local,
            IngestionRateStrategy::Global => &self.global,
        }
    }
}

impl RateLimiterStrategy for TenantRateStrategy {
    fn limit(&self, tenant_id: &str) -> f64 {
        self.strategy_for(tenant_id).limit(tenant_id)
    }

    fn burst(&self, tenant_id: &str) -> usize {
        self.strategy_for(tenant_id).burst(tenant_id)
    }
}

struct TenantBucket {
    limit: f64,
    burst: usize,
    tokens: f64,
    last: Instant,
    recheck_at: Instant,
}

impl TenantBucket {
    fn new(limit: f64, burst: usize, now: Instant, recheck_period: Duration) -> Self {
        Self {
            limit,
            burst,
            tokens: burst as f64,
            last: now,
            recheck_at: now + recheck_period,
        }
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit).min(self.burst as f64);
        if now > self.last {
            self.last = now;
        }
    }
}

/// Per-tenant token buckets.
pub struct RateLimiter {
    strategy: Arc<dyn RateLimiterStrategy>,
    recheck_period: Duration,
    tenants: Mutex<HashMap<String, TenantBucket>>,
}

impl RateLimiter {
    /// Create a limiter.
    pub fn new(strategy: Arc<dyn RateLimiterStrategy>, recheck_period: Duration) -> Self {
        Self {
            strategy,
            recheck_period,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take `n` bytes from the tenant's bucket at `now`.
    ///
    /// A cost larger than the burst can never be satisfied and is rejected.
    pub fn allow_n(&self, now: Instant, tenant_id: &str, n: usize) -> bool {
        let mut tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = self.bucket_for(&mut tenants, now, tenant_id);
        if n > bucket.burst {
            return false;
        }
        bucket.advance(now);
        let cost = n as f64;
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// The tenant's current rate in bytes per second.
    pub fn limit(&self, now: Instant, tenant_id: &str) -> f64 {
        let mut tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        self.bucket_for(&mut tenants, now, tenant_id).limit
    }

    fn bucket_for<'a>(
        &self,
        tenants: &'a mut HashMap<String, TenantBucket>,
        now: Instant,
        tenant_id: &str,
    ) -> &'a mut TenantBucket {
        let bucket = tenants.entry(tenant_id.to_string()).or_insert_with(|| {
            TenantBucket::new(
                self.strategy.limit(tenant_id),
                self.strategy.burst(tenant_id),
                now,
                self.recheck_period,
            )
        });

        if now >= bucket.recheck_at {
            bucket.advance(now);
            bucket.limit = self.strategy.limit(tenant_id);
            bucket.burst = self.strategy.burst(tenant_id);
            bucket.tokens = bucket.tokens.min(bucket.burst as f64);
            bucket.recheck_at = now + self.recheck_period;
        }
        bucket
    }
}
