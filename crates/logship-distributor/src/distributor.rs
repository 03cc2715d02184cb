//! The push path.
//!
//! [`Distributor::push`] validates a tenant's batch, shards its streams,
//! applies the tenant rate limit and external stream limits, then writes the
//! accepted streams to their replica nodes and/or the append log. It returns
//! once every stream reached its write quorum on every enabled path, the
//! first stream fails, or the caller gives up.

use crate::append_log::{AppendLogWriter, LogProducer};
use crate::client::ClientPool;
use crate::config::DistributorConfig;
use crate::error::{DistributorError, Result, RingError};
use crate::fanout::{PushTask, PushWorkerPool};
use crate::field_detection::FieldDetector;
use crate::ingest_limits::{IngestLimits, LimitsFrontendClient};
use crate::labels::{LabelPair, Labels};
use crate::limits::{Limits, TenantLimits};
use crate::metrics::DistributorMetrics;
use crate::rate_limiter::{HealthyInstancesCount, InstanceCounter, RateLimiter, TenantRateStrategy};
use crate::rate_store::{IngesterRateStore, RateStore};
use crate::ring::{InstanceDesc, PartitionRingReader, ReadRing, ReplicaSelector};
use crate::shard_tracker::ShardTracker;
use crate::sharding::StreamSharder;
use crate::stream::{Entry, KeyedStream, PushRequest, PushResponse, RequestContext, FORMAT_NATIVE};
use crate::tee::Tee;
use crate::tracker::{PushTracker, StreamTracker};
use crate::usage::UsageTracker;
use crate::validator::{
    entries_total_size, DiscardReason, LabelCache, PushStats, ValidationContext, Validator,
};
use crate::write_failures::WriteFailuresManager;
use prometheus::Registry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_OK: u16 = 200;

/// Lifecycle state of a distributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributorState {
    /// Created, not yet started.
    New,
    /// Accepting pushes.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped.
    Stopped,
}

/// Collaborators of a distributor.
pub struct Dependencies {
    /// Per-tenant limits.
    pub limits: Arc<dyn Limits>,
    /// Replica ring.
    pub ring: Arc<dyn ReadRing>,
    /// Node clients.
    pub clients: Arc<ClientPool>,
    /// Append-log partition ring (required when append-log writes are on).
    pub partition_ring: Option<Arc<dyn PartitionRingReader>>,
    /// Append-log producer (required when append-log writes are on).
    pub producer: Option<Arc<dyn LogProducer>>,
    /// Stream rate source. When unset, the distributor pulls rates from the
    /// ring's nodes itself while running.
    pub rate_store: Option<Arc<dyn RateStore>>,
    /// Healthy distributor count for the global rate strategy.
    pub distributors: Arc<dyn HealthyInstancesCount>,
    /// Secondary consumer of accepted streams.
    pub tee: Option<Arc<dyn Tee>>,
    /// Usage tracker of discarded bytes.
    pub usage_tracker: Option<Arc<dyn UsageTracker>>,
    /// External limits service client (required when enabled).
    pub limits_frontend: Option<Arc<dyn LimitsFrontendClient>>,
}

impl Dependencies {
    /// Minimal dependencies: replica writes only, no optional consumers.
    pub fn new(limits: Arc<dyn Limits>, ring: Arc<dyn ReadRing>, clients: Arc<ClientPool>) -> Self {
        Self {
            limits,
            ring,
            clients,
            partition_ring: None,
            producer: None,
            rate_store: None,
            distributors: Arc::new(InstanceCounter::default()),
            tee: None,
            usage_tracker: None,
            limits_frontend: None,
        }
    }
}

struct RateStoreLoop {
    store: Arc<IngesterRateStore>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Accepts tenant pushes and replicates them downstream.
pub struct Distributor {
    config: DistributorConfig,
    limits: Arc<dyn Limits>,
    validator: Validator,
    sharder: StreamSharder,
    rate_limiter: RateLimiter,
    replicas: ReplicaSelector,
    clients: Arc<ClientPool>,
    partition_ring: Option<Arc<dyn PartitionRingReader>>,
    append_log: Option<Arc<AppendLogWriter>>,
    ingest_limits: Option<IngestLimits>,
    tee: Option<Arc<dyn Tee>>,
    usage: Option<Arc<dyn UsageTracker>>,
    write_failures: WriteFailuresManager,
    metrics: DistributorMetrics,
    rate_store_loop: Mutex<Option<RateStoreLoop>>,
    workers: RwLock<Option<Arc<PushWorkerPool>>>,
    state: Mutex<DistributorState>,
}

impl Distributor {
    /// Create a distributor and register its metrics on `registry`.
    pub fn new(config: DistributorConfig, deps: Dependencies, registry: &Registry) -> Result<Self> {
        config.validate()?;

        let metrics = DistributorMetrics::new(registry)?;
        metrics
            .replication_factor
            .set(deps.ring.replication_factor() as i64);

        let append_log = if config.kafka_writes_enabled {
            let producer = deps.producer.ok_or_else(|| DistributorError::Config {
                msg: "append-log writes enabled without a producer".to_string(),
            })?;
            if deps.partition_ring.is_none() {
                return Err(DistributorError::Config {
                    msg: "append-log writes enabled without a partition ring".to_string(),
                });
            }
            Some(Arc::new(AppendLogWriter::new(
                producer,
                metrics.clone(),
                config.max_record_size_bytes,
            )))
        } else {
            None
        };

        let ingest_limits = if config.ingest_limits_enabled {
            let client = deps.limits_frontend.ok_or_else(|| DistributorError::Config {
                msg: "ingest limits enabled without a limits client".to_string(),
            })?;
            Some(IngestLimits::new(client, metrics.clone()))
        } else {
            None
        };

        let (rate_store, rate_store_loop): (Arc<dyn RateStore>, _) = match deps.rate_store {
            Some(store) => (store, None),
            None => {
                let store = Arc::new(IngesterRateStore::new(
                    config.rate_store.clone(),
                    deps.ring.clone(),
                    deps.clients.clone(),
                ));
                let shared: Arc<dyn RateStore> = store.clone();
                (
                    shared,
                    Some(RateStoreLoop {
                        store,
                        running: None,
                    }),
                )
            }
        };

        let sharder = StreamSharder::new(
            rate_store,
            Arc::new(ShardTracker::new()),
            metrics.clone(),
            config.time_shard_len(),
        );
        let rate_limiter = RateLimiter::new(
            Arc::new(TenantRateStrategy::new(deps.limits.clone(), deps.distributors)),
            config.rate_limiter_recheck(),
        );
        let validator = Validator::new(
            deps.limits.clone(),
            metrics.clone(),
            deps.usage_tracker.clone(),
        );
        let write_failures =
            WriteFailuresManager::new(config.write_failures.clone(), deps.limits.clone());

        Ok(Self {
            config,
            limits: deps.limits,
            validator,
            sharder,
            rate_limiter,
            replicas: ReplicaSelector::new(deps.ring),
            clients: deps.clients,
            partition_ring: deps.partition_ring,
            append_log,
            ingest_limits,
            tee: deps.tee,
            usage: deps.usage_tracker,
            write_failures,
            metrics,
            rate_store_loop: Mutex::new(rate_store_loop),
            workers: RwLock::new(None),
            state: Mutex::new(DistributorState::New),
        })
    }

    /// Start the push workers and the rate refresh loop. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            DistributorState::Running => return Ok(()),
            DistributorState::Stopping => return Err(DistributorError::NotRunning),
            DistributorState::New | DistributorState::Stopped => {}
        }

        let pool = PushWorkerPool::start(
            self.config.push_worker_count,
            self.clients.clone(),
            self.metrics.clone(),
            self.config.remote_timeout(),
        );
        *self.workers.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(pool));

        if let Some(rate_loop) = self
            .rate_store_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            let cancel = CancellationToken::new();
            let handle = rate_loop.store.clone().start(cancel.clone());
            rate_loop.running = Some((cancel, handle));
        }

        *state = DistributorState::Running;
        info!(
            workers = self.config.push_worker_count,
            ingester_writes = self.config.ingester_writes_enabled,
            kafka_writes = self.config.kafka_writes_enabled,
            "distributor started"
        );
        Ok(())
    }

    /// Stop accepting pushes, stop the workers and the rate refresh loop.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != DistributorState::Running {
                return;
            }
            *state = DistributorState::Stopping;
        }

        let pool = self
            .workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pool) = pool {
            pool.stop().await;
        }

        let running = self
            .rate_store_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .and_then(|l| l.running.take());
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "rate store loop panicked");
            }
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = DistributorState::Stopped;
        info!("distributor stopped");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DistributorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Metrics of this distributor.
    pub fn metrics(&self) -> &DistributorMetrics {
        &self.metrics
    }

    /// Push a batch in the native format.
    pub async fn push(&self, ctx: &RequestContext, req: PushRequest) -> Result<PushResponse> {
        self.push_with_format(ctx, req, FORMAT_NATIVE).await
    }

    /// Push a batch, labelling discard metrics with `format`.
    ///
    /// The call takes at least the tenant's simulated push latency, whatever
    /// the outcome, unless the caller cancels.
    pub async fn push_with_format(
        &self,
        ctx: &RequestContext,
        req: PushRequest,
        format: &str,
    ) -> Result<PushResponse> {
        let started = tokio::time::Instant::now();
        let latency = self.limits.tenant_limits(&ctx.tenant_id).simulated_push_latency();

        let result = self.push_inner(ctx, req, format).await;

        if !latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep_until(started + latency) => {}
                _ = ctx.cancel.cancelled() => {}
            }
        }
        result
    }

    async fn push_inner(
        &self,
        ctx: &RequestContext,
        req: PushRequest,
        format: &str,
    ) -> Result<PushResponse> {
        if req.streams.is_empty() {
            return Err(DistributorError::MissingStreams);
        }
        let workers = self.running_workers()?;

        let tenant_id = ctx.tenant_id.as_str();
        let now = Instant::now();
        let vctx = self.validator.validation_context(SystemTime::now(), tenant_id);

        let batch = self.validate_and_shard(&vctx, req, format);
        let PreparedBatch {
            mut streams,
            stats,
            parsed,
            policies,
            validation_errors,
            blocked,
            warnings,
        } = batch;

        self.metrics
            .bytes_received
            .with_label_values(&[tenant_id])
            .inc_by(stats.line_size as u64);
        self.metrics
            .lines_received
            .with_label_values(&[tenant_id])
            .inc_by(stats.line_count as u64);

        let validation_err = match blocked {
            Some(err) => Some(err),
            None if !validation_errors.is_empty() => Some(DistributorError::Validation {
                message: validation_errors.join("\n"),
            }),
            None => None,
        };

        if streams.is_empty() {
            return match validation_err {
                Some(err) => Err(err),
                None => Ok(PushResponse { warnings }),
            };
        }

        if !self.rate_limiter.allow_n(now, tenant_id, stats.line_size) {
            self.track_discarded(&vctx, &stats, &parsed, DiscardReason::RateLimited, format);
            let err = DistributorError::RateLimited {
                tenant: tenant_id.to_string(),
                limit: self.rate_limiter.limit(now, tenant_id) as u64,
                lines: stats.line_count,
                bytes: stats.line_size,
            };
            self.write_failures.log(tenant_id, &err);
            return Err(err);
        }

        if let Some(ingest_limits) = &self.ingest_limits {
            match ingest_limits.enforce_limits(tenant_id, &streams).await {
                Ok(accepted) if !self.config.ingest_limits_dry_run_enabled => {
                    self.track_rejected_streams(&vctx, &streams, &accepted, &policies, format);
                    if accepted.is_empty() {
                        return Err(DistributorError::LimitsExceeded);
                    }
                    streams = accepted;
                }
                Ok(_) => {}
                Err(e) => warn!(tenant = tenant_id, error = %e, "failed to check stream limits"),
            }
        }

        if let Some(tee) = &self.tee {
            tee.duplicate(tenant_id, &streams);
        }

        let pending = streams.len() * self.config.enabled_sinks();
        let (tracker, completion) = PushTracker::new(pending);

        let by_node = if self.config.ingester_writes_enabled {
            self.group_by_node(&streams)?
        } else {
            HashMap::new()
        };

        if let Some(writer) = &self.append_log {
            self.send_streams_to_append_log(writer, &vctx.limits, tenant_id, streams, &tracker)?;
        }

        for (instance, node_streams) in by_node.into_values() {
            let task = PushTask {
                instance,
                streams: node_streams,
                tracker: tracker.clone(),
            };
            match workers.submit(task, &ctx.cancel).await {
                Ok(()) => {}
                Err(DistributorError::Cancelled) => break,
                Err(e) => {
                    tracker.done_with_result(Err(e));
                    break;
                }
            }
        }
        drop(tracker);

        completion.wait(&ctx.cancel).await?;
        debug!(tenant = tenant_id, "push complete");

        match validation_err {
            Some(err) => Err(err),
            None => Ok(PushResponse { warnings }),
        }
    }

    fn running_workers(&self) -> Result<Arc<PushWorkerPool>> {
        if self.state() != DistributorState::Running {
            return Err(DistributorError::NotRunning);
        }
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DistributorError::NotRunning)
    }

    fn validate_and_shard(
        &self,
        vctx: &ValidationContext,
        req: PushRequest,
        format: &str,
    ) -> PreparedBatch {
        let tenant_id = vctx.tenant_id.as_str();
        let limits = vctx.limits.as_ref();
        let detector = FieldDetector::new(limits);
        let mut batch = PreparedBatch::default();
        let mut label_cache = LabelCache::new();

        for mut stream in req.streams {
            if stream.entries.is_empty() {
                continue;
            }

            self.validator.truncate_lines(vctx, &mut stream);

            let parsed = match self.validator.parse_stream_labels_cached(
                vctx,
                &stream,
                format,
                &mut label_cache,
            ) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.write_failures.log(tenant_id, &e);
                    batch.validation_errors.push(e.message);
                    continue;
                }
            };
            stream.labels = parsed.canonical.clone();
            stream.hash = parsed.hash;
            let stream_bytes = entries_total_size(&stream.entries);
            batch.parsed.push((parsed.labels.clone(), stream_bytes));

            let missing = self
                .validator
                .missing_enforced_labels(vctx, &parsed.labels, &parsed.policy);
            if !missing.is_empty() {
                let message = format!(
                    "missing required labels {} for user {} for stream {}",
                    missing.join(","),
                    tenant_id,
                    stream.labels
                );
                self.write_failures.log(tenant_id, &message);
                self.validator.report_discarded(
                    vctx,
                    DiscardReason::MissingEnforcedLabels,
                    &parsed.labels,
                    &parsed.policy,
                    stream_bytes,
                    stream.entries.len(),
                    format,
                );
                batch.validation_errors.push(message);
                continue;
            }

            if let Some(block) = self.validator.should_block_ingestion(vctx, &parsed.policy) {
                self.write_failures.log(tenant_id, &block.message);
                self.validator.report_discarded(
                    vctx,
                    block.reason,
                    &parsed.labels,
                    &parsed.policy,
                    stream_bytes,
                    stream.entries.len(),
                    format,
                );
                if block.status == STATUS_OK {
                    batch.warnings.push(block.message);
                } else {
                    batch.blocked = Some(DistributorError::IngestionBlocked {
                        status: block.status,
                        message: block.message,
                    });
                }
                continue;
            }

            let mut accepted: Vec<Entry> = Vec::with_capacity(stream.entries.len());
            let mut prev_ts = stream.entries[0].timestamp_ns;
            let mut push_size = 0;

            for mut entry in std::mem::take(&mut stream.entries) {
                if let Err(e) = self.validator.validate_entry(
                    vctx,
                    &parsed.labels,
                    &stream.labels,
                    &entry,
                    &parsed.policy,
                    format,
                ) {
                    self.write_failures.log(tenant_id, &e);
                    batch.validation_errors.push(e.message);
                    continue;
                }

                self.validator
                    .normalize_structured_metadata(vctx, &mut entry, format);
                discover_fields(&detector, &parsed.labels, &mut entry);

                if limits.increment_duplicate_timestamp {
                    if let Some(prev) = accepted.last() {
                        if prev.line != entry.line
                            && (entry.timestamp_ns == prev_ts
                                || entry.timestamp_ns == prev.timestamp_ns)
                        {
                            entry.timestamp_ns = prev.timestamp_ns + 1;
                        } else {
                            prev_ts = entry.timestamp_ns;
                        }
                    }
                }

                batch.stats.compute(&entry, &parsed.policy);
                push_size += entry.line.len();
                accepted.push(entry);
            }

            if accepted.is_empty() {
                continue;
            }
            stream.entries = accepted;

            for keyed in self.sharder.shard(
                tenant_id,
                &limits.shard_streams,
                vctx.now_ns,
                stream,
                &parsed.labels,
                push_size,
            ) {
                batch
                    .policies
                    .insert(keyed.hash_key_no_shard, parsed.policy.clone());
                batch.streams.push(keyed);
            }
        }
        batch
    }

    /// Record streams dropped by the limits service as discarded.
    fn track_rejected_streams(
        &self,
        vctx: &ValidationContext,
        streams: &[KeyedStream],
        accepted: &[KeyedStream],
        policies: &HashMap<u64, String>,
        format: &str,
    ) {
        let kept: HashSet<u64> = accepted.iter().map(|s| s.hash_key_no_shard).collect();
        for stream in streams.iter().filter(|s| !kept.contains(&s.hash_key_no_shard)) {
            let policy = policies
                .get(&stream.hash_key_no_shard)
                .map_or("", String::as_str);
            self.metrics.record_discarded(
                DiscardReason::StreamLimit.as_str(),
                &vctx.tenant_id,
                policy,
                format,
                stream.stream.entries.len(),
                entries_total_size(&stream.stream.entries),
            );
        }
    }

    fn track_discarded(
        &self,
        vctx: &ValidationContext,
        stats: &PushStats,
        parsed: &[(Labels, usize)],
        reason: DiscardReason,
        format: &str,
    ) {
        for (policy, count, size) in stats.by_policy() {
            self.metrics
                .record_discarded(reason.as_str(), &vctx.tenant_id, policy, format, count, size);
        }
        if let Some(usage) = &self.usage {
            for (labels, bytes) in parsed {
                usage.discarded_bytes_add(
                    &vctx.tenant_id,
                    reason.as_str(),
                    labels,
                    *bytes as f64,
                    format,
                );
            }
        }
    }

    /// Stream trackers grouped by node address. Every stream's replica set is
    /// resolved before anything is sent.
    fn group_by_node(
        &self,
        streams: &[KeyedStream],
    ) -> Result<HashMap<String, (InstanceDesc, Vec<Arc<StreamTracker>>)>> {
        let mut by_node: HashMap<String, (InstanceDesc, Vec<Arc<StreamTracker>>)> = HashMap::new();
        for stream in streams {
            let set = self.replicas.replicas_for(stream.hash_key)?;
            if set.min_success() == 0 {
                return Err(RingError::TooFewHealthyInstances {
                    required: 1,
                    found: 0,
                }
                .into());
            }
            let tracker = Arc::new(StreamTracker::new(
                stream.clone(),
                set.min_success(),
                set.max_errors,
            ));
            for instance in set.instances {
                by_node
                    .entry(instance.addr.clone())
                    .or_insert_with(|| (instance, Vec::new()))
                    .1
                    .push(tracker.clone());
            }
        }
        Ok(by_node)
    }

    fn send_streams_to_append_log(
        &self,
        writer: &Arc<AppendLogWriter>,
        limits: &TenantLimits,
        tenant_id: &str,
        streams: Vec<KeyedStream>,
        tracker: &Arc<PushTracker>,
    ) -> Result<()> {
        let Some(partitions) = &self.partition_ring else {
            return Err(DistributorError::Config {
                msg: "append-log writes enabled without a partition ring".to_string(),
            });
        };
        let subring = Arc::new(
            partitions.shuffle_shard(tenant_id, limits.ingestion_partitions_tenant_shard_size)?,
        );

        for stream in streams {
            let writer = writer.clone();
            let subring = subring.clone();
            let tracker = tracker.clone();
            let tenant_id = tenant_id.to_string();
            tokio::spawn(async move {
                let result = writer.write_stream(&subring, &tenant_id, &stream).await;
                tracker.done_with_result(result);
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct PreparedBatch {
    streams: Vec<KeyedStream>,
    stats: PushStats,
    parsed: Vec<(Labels, usize)>,
    policies: HashMap<u64, String>,
    validation_errors: Vec<String>,
    blocked: Option<DistributorError>,
    warnings: Vec<String>,
}

fn discover_fields(detector: &FieldDetector<'_>, labels: &Labels, entry: &mut Entry) {
    if detector.should_discover_log_levels() {
        if let Some(level) = detector.extract_log_level(labels, &entry.structured_metadata, &*entry) {
            entry.structured_metadata.push(level);
        }
    }
    if detector.should_discover_generic_fields() {
        let found: Vec<LabelPair> = detector
            .generic_fields()
            .iter()
            .filter_map(|(field, hints)| {
                detector.extract_generic_field(
                    field,
                    hints,
                    labels,
                    &entry.structured_metadata,
                    &*entry,
                )
            })
            .collect();
        entry.structured_metadata.extend(found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientFactory, NodeClient, StreamRate};
    use crate::limits::Overrides;
    use crate::ring::{HashRing, InstanceDesc};
    use crate::stream::Stream;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        pushed: StdMutex<Vec<Stream>>,
    }

    #[async_trait]
    impl NodeClient for Recorder {
        async fn push(&self, req: PushRequest) -> Result<()> {
            self.pushed.lock().unwrap().extend(req.streams);
            Ok(())
        }

        async fn stream_rates(&self) -> Result<Vec<StreamRate>> {
            Ok(Vec::new())
        }
    }

    struct Shared(Arc<Recorder>);

    impl ClientFactory for Shared {
        fn create(&self, _addr: &str) -> Result<Arc<dyn NodeClient>> {
            Ok(self.0.clone())
        }
    }

    struct NoRates;

    impl RateStore for NoRates {
        fn rate_for(&self, _tenant_id: &str, _stream_hash: u64) -> (i64, f64) {
            (0, 0.0)
        }
    }

    fn distributor(limits: TenantLimits) -> (Distributor, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let ring = Arc::new(HashRing::new(1));
        ring.add_instance(InstanceDesc::new("node-1", "node-1:9095"));
        let clients = Arc::new(ClientPool::new(Arc::new(Shared(recorder.clone()))));
        let mut deps = Dependencies::new(Arc::new(Overrides::new(limits)), ring, clients);
        deps.rate_store = Some(Arc::new(NoRates));
        let config = DistributorConfig {
            push_worker_count: 2,
            ..Default::default()
        };
        let d = Distributor::new(config, deps, &Registry::new()).unwrap();
        (d, recorder)
    }

    fn now_ns() -> i64 {
        crate::validator::unix_nanos(SystemTime::now())
    }

    fn request(labels: &str, lines: &[&str]) -> PushRequest {
        let ts = now_ns();
        PushRequest::new(vec![Stream::new(
            labels,
            lines.iter().map(|l| Entry::new(ts, *l)).collect(),
        )])
    }

    #[tokio::test]
    async fn test_not_running_and_missing_streams() {
        let (d, _) = distributor(TenantLimits::default());
        let ctx = RequestContext::new("acme");

        let err = d.push(&ctx, PushRequest::default()).await.unwrap_err();
        assert_eq!(err.status_code(), 422);

        let err = d.push(&ctx, request(r#"{app="api"}"#, &["x"])).await.unwrap_err();
        assert!(matches!(err, DistributorError::NotRunning));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (d, _) = distributor(TenantLimits::default());
        assert_eq!(d.state(), DistributorState::New);
        d.start().unwrap();
        assert_eq!(d.state(), DistributorState::Running);
        d.stop().await;
        assert_eq!(d.state(), DistributorState::Stopped);
        d.start().unwrap();
        assert_eq!(d.state(), DistributorState::Running);
        d.stop().await;
    }

    #[tokio::test]
    async fn test_push_writes_canonical_stream() {
        let (d, recorder) = distributor(TenantLimits::default());
        d.start().unwrap();
        let ctx = RequestContext::new("acme");

        let resp = d
            .push(&ctx, request(r#"{env="prod", app="api"}"#, &["a", "b"]))
            .await
            .unwrap();
        assert!(resp.warnings.is_empty());

        let pushed = recorder.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].labels, r#"{app="api", env="prod"}"#);
        assert_eq!(pushed[0].entries.len(), 2);
        assert_eq!(
            d.metrics().lines_received.with_label_values(&["acme"]).get(),
            2
        );
        d.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_are_bumped() {
        let (d, recorder) = distributor(TenantLimits {
            increment_duplicate_timestamp: true,
            ..Default::default()
        });
        d.start().unwrap();
        let ctx = RequestContext::new("acme");
        let ts = now_ns();
        let req = PushRequest::new(vec![Stream::new(
            r#"{app="api"}"#,
            vec![
                Entry::new(ts, "a"),
                Entry::new(ts, "b"),
                Entry::new(ts, "c"),
            ],
        )]);
        d.push(&ctx, req).await.unwrap();

        let pushed = recorder.pushed.lock().unwrap().clone();
        let stamps: Vec<i64> = pushed[0].entries.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(stamps, vec![ts, ts + 1, ts + 2]);
        d.stop().await;
    }

    #[tokio::test]
    async fn test_soft_block_returns_warning() {
        let (d, recorder) = distributor(TenantLimits {
            blocked_ingestion_until: Some(i64::MAX),
            blocked_ingestion_status_code: 200,
            ..Default::default()
        });
        d.start().unwrap();
        let resp = d
            .push(&RequestContext::new("acme"), request(r#"{app="api"}"#, &["x"]))
            .await
            .unwrap();
        assert_eq!(resp.warnings.len(), 1);
        assert!(recorder.pushed.lock().unwrap().is_empty());
        d.stop().await;
    }

    #[tokio::test]
    async fn test_level_discovery_adds_metadata() {
        let (d, recorder) = distributor(TenantLimits {
            discover_log_levels: true,
            ..Default::default()
        });
        d.start().unwrap();
        d.push(
            &RequestContext::new("acme"),
            request(r#"{app="api"}"#, &["level=warn disk almost full"]),
        )
        .await
        .unwrap();

        let pushed = recorder.pushed.lock().unwrap().clone();
        assert_eq!(
            pushed[0].entries[0].structured_metadata,
            vec![LabelPair::new("detected_level", "warn")]
        );
        d.stop().await;
    }

    struct NoReplicas;

    impl ReadRing for NoReplicas {
        fn get(
            &self,
            _key: u32,
            _op: crate::ring::Operation,
            buf: Vec<InstanceDesc>,
        ) -> std::result::Result<crate::ring::ReplicationSet, RingError> {
            Ok(crate::ring::ReplicationSet {
                instances: buf,
                max_errors: 0,
            })
        }

        fn replication_factor(&self) -> usize {
            1
        }

        fn healthy_instances(&self) -> Vec<InstanceDesc> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_empty_replica_set_fails_instead_of_waiting() {
        let clients = Arc::new(ClientPool::new(Arc::new(Shared(Arc::default()))));
        let mut deps = Dependencies::new(
            Arc::new(Overrides::default()),
            Arc::new(NoReplicas),
            clients,
        );
        deps.rate_store = Some(Arc::new(NoRates));
        let d = Distributor::new(DistributorConfig::default(), deps, &Registry::new()).unwrap();
        d.start().unwrap();

        let pushed = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            d.push(&RequestContext::new("acme"), request(r#"{app="api"}"#, &["x"])),
        )
        .await
        .expect("push must not wait for an unreachable quorum");
        let err = pushed.unwrap_err();
        assert!(matches!(
            err,
            DistributorError::Ring(RingError::TooFewHealthyInstances { .. })
        ));
        assert_eq!(err.status_code(), 500);
        d.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_label_strings_in_one_request() {
        let (d, recorder) = distributor(TenantLimits::default());
        d.start().unwrap();
        let ts = now_ns();
        let req = PushRequest::new(vec![
            Stream::new(r#"{env="prod", app="api"}"#, vec![Entry::new(ts, "a")]),
            Stream::new(r#"{env="prod", app="api"}"#, vec![Entry::new(ts + 1, "b")]),
        ]);
        d.push(&RequestContext::new("acme"), req).await.unwrap();

        let pushed = recorder.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 2);
        assert!(pushed.iter().all(|s| s.labels == r#"{app="api", env="prod"}"#));
        d.stop().await;
    }

    #[test]
    fn test_kafka_requires_producer() {
        let ring = Arc::new(HashRing::new(1));
        let clients = Arc::new(ClientPool::new(Arc::new(Shared(Arc::default()))));
        let deps = Dependencies::new(Arc::new(Overrides::default()), ring, clients);
        let config = DistributorConfig {
            kafka_writes_enabled: true,
            ..Default::default()
        };
        let err = Distributor::new(config, deps, &Registry::new()).err().unwrap();
        assert!(matches!(err, DistributorError::Config { .. }));
    }
}
