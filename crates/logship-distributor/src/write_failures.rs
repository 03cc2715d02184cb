//! Rate-limited logging of rejected writes.
//!
//! Every failed write can produce a log line, which under a misbehaving
//! client turns into a flood. Each tenant gets a byte budget per second;
//! messages that do not fit are dropped.

use crate::config::WriteFailuresConfig;
use crate::limits::Limits;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

struct LogBudget {
    tokens: f64,
    last: Instant,
}

/// Logs write failures within a per-tenant byte budget.
pub struct WriteFailuresManager {
    config: WriteFailuresConfig,
    limits: Arc<dyn Limits>,
    budgets: Mutex<HashMap<String, LogBudget>>,
}

impl WriteFailuresManager {
    /// Create a manager.
    pub fn new(config: WriteFailuresConfig, limits: Arc<dyn Limits>) -> Self {
        Self {
            config,
            limits,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Log `err` for `tenant_id` if the tenant has budget left. Returns true
    /// when the message was logged.
    pub fn log(&self, tenant_id: &str, err: &dyn Display) -> bool {
        self.log_at(Instant::now(), tenant_id, err)
    }

    fn log_at(&self, now: Instant, tenant_id: &str, err: &dyn Display) -> bool {
        if self.config.log_rate_bytes == 0 {
            return false;
        }
        if !self.limits.tenant_limits(tenant_id).limited_log_push_errors {
            return false;
        }

        let msg = err.to_string();
        if !self.take(now, tenant_id, msg.len()) {
            return false;
        }

        if self.config.add_insights_label {
            warn!(tenant = tenant_id, insight = true, details = %msg, "write operation failed");
        } else {
            warn!(tenant = tenant_id, details = %msg, "write operation failed");
        }
        true
    }

    fn take(&self, now: Instant, tenant_id: &str, cost: usize) -> bool {
        let rate = self.config.log_rate_bytes as f64;
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        let budget = budgets
            .entry(tenant_id.to_string())
            .or_insert_with(|| LogBudget {
                tokens: rate,
                last: now,
            });

        let elapsed = now.saturating_duration_since(budget.last).as_secs_f64();
        budget.tokens = (budget.tokens + elapsed * rate).min(rate);
        if now > budget.last {
            budget.last = now;
        }

        let cost = cost as f64;
        if budget.tokens < cost {
            return false;
        }
        budget.tokens -= cost;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{Overrides, TenantLimits};
    use std::time::Duration;

    fn manager(rate: u64) -> WriteFailuresManager {
        WriteFailuresManager::new(
            WriteFailuresConfig {
                log_rate_bytes: rate,
                add_insights_label: false,
            },
            Arc::new(Overrides::default()),
        )
    }

    #[test]
    fn test_budget_exhausts_and_refills() {
        let m = manager(10);
        let now = Instant::now();
        assert!(m.log_at(now, "acme", &"12345"));
        assert!(m.log_at(now, "acme", &"12345"));
        assert!(!m.log_at(now, "acme", &"1"));
        assert!(m.log_at(now, "globex", &"1"));
        assert!(m.log_at(now + Duration::from_secs(1), "acme", &"1234567890"));
    }

    #[test]
    fn test_disabled_by_zero_rate() {
        assert!(!manager(0).log("acme", &"boom"));
    }

    #[test]
    fn test_disabled_per_tenant() {
        let limits = Arc::new(Overrides::default());
        limits.set_tenant(
            "quiet",
            TenantLimits {
                limited_log_push_errors: false,
                ..Default::default()
            },
        );
        let m = WriteFailuresManager::new(WriteFailuresConfig::default(), limits);
        assert!(!m.log("quiet", &"boom"));
        assert!(m.log("loud", &"boom"));
    }
}
