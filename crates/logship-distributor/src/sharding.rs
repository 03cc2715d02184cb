//! Splitting streams by time window and by observed throughput.
//!
//! Time sharding cuts old entries into windows of half the maximum chunk age
//! so that late data does not keep ancient chunks open on the nodes. Rate
//! sharding spreads a hot stream over several derived streams, each with its
//! own ring token, so no single replica set takes all of its traffic.

use crate::labels::{token_for, Labels, LabelsBuilder};
use crate::limits::ShardStreamsConfig;
use crate::metrics::DistributorMetrics;
use crate::rate_store::RateStore;
use crate::shard_tracker::ShardTracker;
use crate::stream::{Entry, KeyedStream, Stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Label carrying the rate shard number.
pub const SHARD_LABEL: &str = "__stream_shard__";

/// Label carrying the time window of a time shard, `<start>_<end>` in Unix
/// seconds.
pub const TIME_SHARD_LABEL: &str = "__time_shard__";

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// One output of time sharding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeShard {
    /// Stream with the window label applied (or the original labels for the
    /// trailing recent shard).
    pub stream: Stream,
    /// Parsed labels of `stream`.
    pub labels: Labels,
    /// Sum of line sizes.
    pub lines_size: usize,
}

/// Turns validated streams into keyed streams.
pub struct StreamSharder {
    rate_store: Arc<dyn RateStore>,
    shard_tracker: Arc<ShardTracker>,
    metrics: DistributorMetrics,
    time_shard_len: Duration,
}

impl StreamSharder {
    /// Create a sharder.
    pub fn new(
        rate_store: Arc<dyn RateStore>,
        shard_tracker: Arc<ShardTracker>,
        metrics: DistributorMetrics,
        time_shard_len: Duration,
    ) -> Self {
        Self {
            rate_store,
            shard_tracker,
            metrics,
            time_shard_len,
        }
    }

    /// Apply time sharding and then rate sharding, as enabled for the
    /// tenant. Each time window is rate-sharded on its own.
    pub fn shard(
        &self,
        tenant_id: &str,
        cfg: &ShardStreamsConfig,
        now_ns: i64,
        stream: Stream,
        labels: &Labels,
        push_size: usize,
    ) -> Vec<KeyedStream> {
        if !cfg.time_sharding_enabled {
            return self.maybe_shard_by_rate(tenant_id, cfg, stream, labels, push_size);
        }

        let ignore_recent_from =
            now_ns.saturating_sub(duration_nanos(cfg.time_sharding_ignore_recent()));
        self.shard_stream_by_time(stream, labels, ignore_recent_from)
            .into_iter()
            .flat_map(|ts| {
                self.maybe_shard_by_rate(tenant_id, cfg, ts.stream, &ts.labels, ts.lines_size)
            })
            .collect()
    }

    fn maybe_shard_by_rate(
        &self,
        tenant_id: &str,
        cfg: &ShardStreamsConfig,
        stream: Stream,
        labels: &Labels,
        push_size: usize,
    ) -> Vec<KeyedStream> {
        if cfg.enabled {
            return self.shard_stream(tenant_id, cfg, stream, labels, push_size);
        }
        vec![unsharded(tenant_id, stream)]
    }

    /// Split entries older than `ignore_recent_from` (Unix ns) into windows.
    ///
    /// Entries are stably sorted by timestamp. Windows are aligned to the
    /// window length and cut off at `ignore_recent_from`. Entries at or after
    /// the cutoff form one trailing shard that keeps the original labels.
    pub fn shard_stream_by_time(
        &self,
        mut stream: Stream,
        labels: &Labels,
        ignore_recent_from: i64,
    ) -> Vec<TimeShard> {
        if stream.entries.is_empty() {
            return Vec::new();
        }
        stream.entries.sort_by_key(|e| e.timestamp_ns);

        let shard_len = duration_nanos(self.time_shard_len);
        if shard_len <= 0 || stream.entries[0].timestamp_ns >= ignore_recent_from {
            let lines_size = stream.lines_size();
            return vec![TimeShard {
                stream,
                labels: labels.clone(),
                lines_size,
            }];
        }

        let mut builder = LabelsBuilder::new(labels);
        let mut shards = Vec::new();
        let mut rest = std::mem::take(&mut stream.entries);

        while rest
            .first()
            .is_some_and(|e| e.timestamp_ns < ignore_recent_from)
        {
            let first_ts = rest[0].timestamp_ns;
            let start = first_ts - first_ts.rem_euclid(shard_len);
            let end = start.saturating_add(shard_len);
            let cutoff = end.min(ignore_recent_from);

            let split = rest
                .iter()
                .skip(1)
                .position(|e| e.timestamp_ns >= cutoff)
                .map_or(rest.len(), |p| p + 1);
            let tail = rest.split_off(split);
            let entries = std::mem::replace(&mut rest, tail);

            let window = format!(
                "{}_{}",
                start.div_euclid(NANOS_PER_SEC),
                end.div_euclid(NANOS_PER_SEC)
            );
            let shard_labels = builder.set(TIME_SHARD_LABEL, &window).labels();
            let lines_size = entries.iter().map(|e| e.line.len()).sum();
            shards.push(TimeShard {
                stream: Stream {
                    labels: shard_labels.to_string(),
                    hash: shard_labels.stable_hash(),
                    entries,
                },
                labels: shard_labels,
                lines_size,
            });
        }

        if !rest.is_empty() {
            let lines_size = rest.iter().map(|e| e.line.len()).sum();
            shards.push(TimeShard {
                stream: Stream {
                    labels: stream.labels,
                    hash: stream.hash,
                    entries: rest,
                },
                labels: labels.clone(),
                lines_size,
            });
        }
        shards
    }

    /// Rate-shard one stream.
    pub fn shard_stream(
        &self,
        tenant_id: &str,
        cfg: &ShardStreamsConfig,
        stream: Stream,
        labels: &Labels,
        push_size: usize,
    ) -> Vec<KeyedStream> {
        let shard_count = self.shard_count_for(tenant_id, cfg, &stream, push_size);
        if shard_count <= 1 {
            return vec![unsharded(tenant_id, stream)];
        }

        self.metrics.stream_sharding_count.inc();
        if cfg.logging_enabled {
            info!(
                tenant = tenant_id,
                stream = %stream.labels,
                shard_count,
                "sharding request"
            );
        }
        self.divide_entries_between_shards(tenant_id, shard_count, labels, stream)
    }

    /// Number of shards a stream needs for this push.
    pub fn shard_count_for(
        &self,
        tenant_id: &str,
        cfg: &ShardStreamsConfig,
        stream: &Stream,
        push_size: usize,
    ) -> usize {
        if cfg.desired_rate_bytes <= 0 {
            if cfg.logging_enabled {
                error!(
                    tenant = tenant_id,
                    desired_rate = cfg.desired_rate_bytes,
                    "invalid desired rate"
                );
            }
            return 1;
        }

        let (rate, push_rate) = self.rate_store.rate_for(tenant_id, stream.hash);
        if push_rate == 0.0 {
            return 1;
        }
        let push_rate = push_rate.min(1.0);
        let push = (push_size as f64 * push_rate) as i64;
        calculate_shards(rate, push, cfg.desired_rate_bytes)
    }

    /// Spread a stream's entries round-robin over its shards.
    pub fn divide_entries_between_shards(
        &self,
        tenant_id: &str,
        total_shards: usize,
        labels: &Labels,
        mut stream: Stream,
    ) -> Vec<KeyedStream> {
        let entries = std::mem::take(&mut stream.entries);
        let mut derived = self.create_shards(tenant_id, total_shards, labels, &stream, entries.len());
        divide_entries(entries, &mut derived);
        derived
    }

    /// Empty derived streams for `min(total_shards, entry_count)` shards,
    /// continuing from the tracker's last shard number for the stream.
    pub fn create_shards(
        &self,
        tenant_id: &str,
        total_shards: usize,
        labels: &Labels,
        stream: &Stream,
        entry_count: usize,
    ) -> Vec<KeyedStream> {
        if total_shards == 0 {
            error!(
                tenant = tenant_id,
                stream = %stream.labels,
                "attempt to create shard with zeroed total shards"
            );
            return Vec::new();
        }

        let start = self.shard_tracker.last_shard_num(tenant_id, stream.hash);
        let count = total_shards.min(entry_count);
        let per_shard = entry_count.div_ceil(total_shards);
        let mut builder = LabelsBuilder::new(labels);

        let derived = (0..count)
            .map(|i| {
                let shard_num = (start + i) % total_shards;
                let shard_labels = builder.set(SHARD_LABEL, &shard_num.to_string()).labels();
                let canonical = shard_labels.to_string();
                KeyedStream {
                    hash_key: token_for(tenant_id, &canonical),
                    hash_key_no_shard: stream.hash,
                    stream: Stream {
                        hash: shard_labels.stable_hash(),
                        labels: canonical,
                        entries: Vec::with_capacity(per_shard),
                    },
                }
            })
            .collect();

        self.shard_tracker
            .set_last_shard_num(tenant_id, stream.hash, start + count);
        derived
    }
}

/// `ceil((rate + push_size) / desired_rate)`, or 1 when that is at most 1
/// or the desired rate is not positive.
pub fn calculate_shards(rate: i64, push_size: i64, desired_rate: i64) -> usize {
    if desired_rate <= 0 {
        return 1;
    }
    let shards = rate.saturating_add(push_size) as f64 / desired_rate as f64;
    if shards <= 1.0 {
        return 1;
    }
    shards.ceil() as usize
}

/// Deal entries round-robin over `shards`, preserving their order within
/// each shard.
pub fn divide_entries(entries: Vec<Entry>, shards: &mut [KeyedStream]) {
    if shards.is_empty() {
        return;
    }
    let n = shards.len();
    for (i, entry) in entries.into_iter().enumerate() {
        shards[i % n].stream.entries.push(entry);
    }
}

fn unsharded(tenant_id: &str, stream: Stream) -> KeyedStream {
    KeyedStream {
        hash_key: token_for(tenant_id, &stream.labels),
        hash_key_no_shard: stream.hash,
        stream,
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
