//! Observed per-stream ingestion rates.
//!
//! [`IngesterRateStore`] periodically pulls stream rates from every healthy
//! node. A stream's rate is the maximum reported across its replicas; rates
//! of a stream's shards are then summed under the un-sharded stream hash,
//! with the push rate taken as the highest shard push rate. Entries not
//! refreshed within the keep-alive window are dropped.

use crate::client::{ClientPool, StreamRate};
use crate::config::RateStoreConfig;
use crate::error::{DistributorError, Result};
use crate::ring::ReadRing;
use std::collections::{hash_map, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of observed stream rates.
pub trait RateStore: Send + Sync {
    /// `(bytes per second, pushes per second)` for an un-sharded stream.
    /// Unknown streams report `(0, 0.0)`.
    fn rate_for(&self, tenant_id: &str, stream_hash: u64) -> (i64, f64);
}

#[derive(Debug, Clone, Copy)]
struct ExpiringRate {
    rate: i64,
    pushes: f64,
    updated_at: Instant,
}

/// Rate store fed by node rate reports.
pub struct IngesterRateStore {
    config: RateStoreConfig,
    ring: Arc<dyn ReadRing>,
    clients: Arc<ClientPool>,
    rates: RwLock<HashMap<String, HashMap<u64, ExpiringRate>>>,
}

impl IngesterRateStore {
    /// Create an empty store.
    pub fn new(config: RateStoreConfig, ring: Arc<dyn ReadRing>, clients: Arc<ClientPool>) -> Self {
        Self {
            config,
            ring,
            clients,
            rates: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn the refresh loop. It stops when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.update_interval());
            info!(
                interval_ms = self.config.stream_rate_update_interval_ms,
                "rate store started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.update_all_rates().await {
                            warn!(error = %e, "failed to update stream rates");
                        }
                    }
                }
            }
            info!("rate store stopped");
        })
    }

    /// Pull rates from every healthy node and fold them into the store.
    pub async fn update_all_rates(&self) -> Result<()> {
        let reports = self.fetch_rates().await?;
        let updated = self.apply(reports, Instant::now());
        if self.config.debug {
            debug!(streams = updated, "refreshed stream rates");
        }
        Ok(())
    }

    async fn fetch_rates(&self) -> Result<Vec<StreamRate>> {
        let instances = self.ring.healthy_instances();
        let permits = Arc::new(Semaphore::new(self.config.max_request_parallelism.max(1)));
        let timeout = self.config.request_timeout();

        let mut tasks = JoinSet::new();
        for instance in instances {
            let client = match self.clients.get_client_for(&instance.addr) {
                Ok(c) => c,
                Err(e) => {
                    warn!(addr = %instance.addr, error = %e, "unable to get client for node");
                    continue;
                }
            };
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                match tokio::time::timeout(timeout, client.stream_rates()).await {
                    Ok(Ok(rates)) => Some(rates),
                    Ok(Err(e)) => {
                        warn!(addr = %instance.addr, error = %e, "unable to get stream rates from node");
                        None
                    }
                    Err(_) => {
                        warn!(addr = %instance.addr, "timed out getting stream rates from node");
                        None
                    }
                }
            });
        }

        let mut all = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(rates)) => all.extend(rates),
                Ok(None) => {}
                Err(e) => {
                    return Err(DistributorError::NodePush {
                        addr: String::new(),
                        msg: format!("stream rate task failed: {e}"),
                    })
                }
            }
        }
        Ok(all)
    }

    /// Fold one round of reports into the store at `now`. Returns the number
    /// of un-sharded streams updated.
    pub fn apply(&self, reports: Vec<StreamRate>, now: Instant) -> usize {
        let mut by_replica: HashMap<(String, u64), StreamRate> = HashMap::new();
        for report in reports {
            match by_replica.entry((report.tenant.clone(), report.stream_hash)) {
                hash_map::Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    existing.rate = existing.rate.max(report.rate);
                    existing.pushes = existing.pushes.max(report.pushes);
                }
                hash_map::Entry::Vacant(slot) => {
                    slot.insert(report);
                }
            }
        }

        let mut by_stream: HashMap<(String, u64), (i64, f64)> = HashMap::new();
        for ((tenant, _), report) in by_replica {
            let entry = by_stream
                .entry((tenant, report.stream_hash_no_shard))
                .or_insert((0, 0.0));
            entry.0 += report.rate;
            entry.1 = entry.1.max(f64::from(report.pushes));
        }

        let updated = by_stream.len();
        let keep_alive = self.config.keep_alive();
        let mut rates = self.rates.write().unwrap_or_else(|e| e.into_inner());
        for ((tenant, hash), (rate, pushes)) in by_stream {
            rates.entry(tenant).or_default().insert(
                hash,
                ExpiringRate {
                    rate,
                    pushes,
                    updated_at: now,
                },
            );
        }
        rates.retain(|_, streams| {
            streams.retain(|_, r| now.saturating_duration_since(r.updated_at) < keep_alive);
            !streams.is_empty()
        });
        updated
    }

    /// Number of tracked un-sharded streams.
    pub fn stream_count(&self) -> usize {
        self.rates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }
}

impl RateStore for IngesterRateStore {
    fn rate_for(&self, tenant_id: &str, stream_hash: u64) -> (i64, f64) {
        let rates = self.rates.read().unwrap_or_else(|e| e.into_inner());
        rates
            .get(tenant_id)
            .and_then(|streams| streams.get(&stream_hash))
            .map(|r| (r.rate, r.pushes))
            .unwrap_or((0, 0.0))
    }
}
