//! Prometheus metrics for the push path.

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, DEFAULT_BUCKETS,
};

const NAMESPACE: &str = "logship";

/// All distributor metrics, registered on one registry.
#[derive(Clone)]
pub struct DistributorMetrics {
    /// Batch appends sent to nodes, by node address.
    pub ingester_appends: IntCounterVec,
    /// Batch appends that timed out, by node address.
    pub ingester_append_timeouts: IntCounterVec,
    /// Configured replication factor.
    pub replication_factor: IntGauge,
    /// Number of times a stream was sharded.
    pub stream_sharding_count: IntCounter,
    /// Structured metadata names/values sanitized, by tenant and format.
    pub structured_metadata_sanitized: IntCounterVec,
    /// Appends to the append log, by partition and status.
    pub kafka_appends: IntCounterVec,
    /// Latency of append-log writes.
    pub kafka_write_latency: Histogram,
    /// Bytes written to the append log.
    pub kafka_write_bytes: IntCounter,
    /// Records produced per stream write.
    pub kafka_records_per_request: Histogram,
    /// Discarded entries, by reason, tenant, policy and format.
    pub discarded_samples: IntCounterVec,
    /// Discarded bytes, by reason, tenant, policy and format.
    pub discarded_bytes: IntCounterVec,
    /// Mutated (truncated) entries, by reason and tenant.
    pub mutated_samples: IntCounterVec,
    /// Mutated (truncated) bytes, by reason and tenant.
    pub mutated_bytes: IntCounterVec,
    /// Accepted line bytes, by tenant.
    pub bytes_received: IntCounterVec,
    /// Accepted lines, by tenant.
    pub lines_received: IntCounterVec,
    /// Streams rejected by the external limits service, by reason.
    pub ingest_limits_rejected: IntCounterVec,
}

impl DistributorMetrics {
    /// Create and register all metrics.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            ingester_appends: counter_vec(
                "distributor_ingester_appends_total",
                "The total number of batch appends sent to ingesters.",
                &["ingester"],
            )?,
            ingester_append_timeouts: counter_vec(
                "distributor_ingester_append_timeouts_total",
                "The total number of failed batch appends sent to ingesters due to timeouts.",
                &["ingester"],
            )?,
            replication_factor: IntGauge::with_opts(
                Opts::new(
                    "distributor_replication_factor",
                    "The configured replication factor.",
                )
                .namespace(NAMESPACE),
            )?,
            stream_sharding_count: IntCounter::with_opts(
                Opts::new(
                    "stream_sharding_count",
                    "Total number of times the distributor has sharded streams.",
                )
                .namespace(NAMESPACE),
            )?,
            structured_metadata_sanitized: counter_vec(
                "distributor_push_structured_metadata_sanitized_total",
                "The total number of times structured metadata was sanitized at ingestion time.",
                &["tenant", "format"],
            )?,
            kafka_appends: counter_vec(
                "distributor_kafka_appends_total",
                "The total number of appends sent to the append log.",
                &["partition", "status"],
            )?,
            kafka_write_latency: Histogram::with_opts(
                HistogramOpts::new(
                    "distributor_kafka_latency_seconds",
                    "Latency to write an incoming request to the append log.",
                )
                .namespace(NAMESPACE)
                .buckets(DEFAULT_BUCKETS.to_vec()),
            )?,
            kafka_write_bytes: IntCounter::with_opts(
                Opts::new(
                    "distributor_kafka_sent_bytes_total",
                    "Total number of bytes sent to the append log.",
                )
                .namespace(NAMESPACE),
            )?,
            kafka_records_per_request: Histogram::with_opts(
                HistogramOpts::new(
                    "distributor_kafka_records_per_write_request",
                    "The number of records a single stream write has been split into.",
                )
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(1.0, 2.0, 8)?),
            )?,
            discarded_samples: counter_vec(
                "discarded_samples_total",
                "The total number of samples that were discarded.",
                &["reason", "tenant", "policy", "format"],
            )?,
            discarded_bytes: counter_vec(
                "discarded_bytes_total",
                "The total number of bytes that were discarded.",
                &["reason", "tenant", "policy", "format"],
            )?,
            mutated_samples: counter_vec(
                "mutated_samples_total",
                "The total number of samples that have been mutated.",
                &["reason", "tenant"],
            )?,
            mutated_bytes: counter_vec(
                "mutated_bytes_total",
                "The total number of bytes that have been mutated.",
                &["reason", "tenant"],
            )?,
            bytes_received: counter_vec(
                "distributor_bytes_received_total",
                "The total number of uncompressed line bytes received per tenant.",
                &["tenant"],
            )?,
            lines_received: counter_vec(
                "distributor_lines_received_total",
                "The total number of lines received per tenant.",
                &["tenant"],
            )?,
            ingest_limits_rejected: counter_vec(
                "distributor_ingest_limits_rejected_streams_total",
                "The total number of streams rejected by the limits service.",
                &["reason"],
            )?,
        };

        registry.register(Box::new(metrics.ingester_appends.clone()))?;
        registry.register(Box::new(metrics.ingester_append_timeouts.clone()))?;
        registry.register(Box::new(metrics.replication_factor.clone()))?;
        registry.register(Box::new(metrics.stream_sharding_count.clone()))?;
        registry.register(Box::new(metrics.structured_metadata_sanitized.clone()))?;
        registry.register(Box::new(metrics.kafka_appends.clone()))?;
        registry.register(Box::new(metrics.kafka_write_latency.clone()))?;
        registry.register(Box::new(metrics.kafka_write_bytes.clone()))?;
        registry.register(Box::new(metrics.kafka_records_per_request.clone()))?;
        registry.register(Box::new(metrics.discarded_samples.clone()))?;
        registry.register(Box::new(metrics.discarded_bytes.clone()))?;
        registry.register(Box::new(metrics.mutated_samples.clone()))?;
        registry.register(Box::new(metrics.mutated_bytes.clone()))?;
        registry.register(Box::new(metrics.bytes_received.clone()))?;
        registry.register(Box::new(metrics.lines_received.clone()))?;
        registry.register(Box::new(metrics.ingest_limits_rejected.clone()))?;

        Ok(metrics)
    }

    /// Metrics on a private registry, for tests and embedded use.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(&Registry::new())
    }

    /// Record discarded entries and bytes.
    pub fn record_discarded(
        &self,
        reason: &str,
        tenant: &str,
        policy: &str,
        format: &str,
        samples: usize,
        bytes: usize,
    ) {
        let labels = [reason, tenant, policy, format];
        self.discarded_samples
            .with_label_values(&labels)
            .inc_by(samples as u64);
        self.discarded_bytes
            .with_label_values(&labels)
            .inc_by(bytes as u64);
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}
