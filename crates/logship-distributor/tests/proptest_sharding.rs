//! Property-based tests for stream sharding.
//!
//! These check that rate and time sharding only redistribute entries: nothing
//! is lost, duplicated or reordered within a shard.

use logship_distributor::shard_tracker::ShardTracker;
use logship_distributor::sharding::{calculate_shards, StreamSharder, SHARD_LABEL, TIME_SHARD_LABEL};
use logship_distributor::{DistributorMetrics, Entry, Labels, RateStore, Stream};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const SECOND: i64 = 1_000_000_000;

struct NoRate;

impl RateStore for NoRate {
    fn rate_for(&self, _tenant_id: &str, _stream_hash: u64) -> (i64, f64) {
        (0, 0.0)
    }
}

fn sharder(time_shard_len: Duration) -> StreamSharder {
    StreamSharder::new(
        Arc::new(NoRate),
        Arc::new(ShardTracker::new()),
        DistributorMetrics::unregistered().unwrap(),
        time_shard_len,
    )
}

fn base_labels() -> Labels {
    Labels::from_pairs([("app", "api")])
}

fn stream_of(timestamps: &[i64]) -> Stream {
    let labels = base_labels();
    let mut stream = Stream::new(
        labels.to_string(),
        timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| Entry::new(*ts, format!("line-{i}")))
            .collect(),
    );
    stream.hash = labels.stable_hash();
    stream
}

fn sorted_lines<'a>(entries: impl Iterator<Item = &'a Entry>) -> Vec<(i64, String)> {
    let mut out: Vec<(i64, String)> = entries.map(|e| (e.timestamp_ns, e.line.clone())).collect();
    out.sort();
    out
}

proptest! {
    #[test]
    fn prop_rate_sharding_conserves_entries(entry_count in 1usize..200, shards in 1usize..32) {
        let s = sharder(Duration::from_secs(3600));
        let timestamps: Vec<i64> = (0..entry_count as i64).collect();
        let stream = stream_of(&timestamps);
        let before = sorted_lines(stream.entries.iter());

        let derived = s.divide_entries_between_shards("acme", shards, &base_labels(), stream);

        prop_assert_eq!(derived.len(), shards.min(entry_count));
        let total: usize = derived.iter().map(|d| d.stream.entries.len()).sum();
        prop_assert_eq!(total, entry_count);
        prop_assert_eq!(sorted_lines(derived.iter().flat_map(|d| d.stream.entries.iter())), before);
        for d in &derived {
            prop_assert!(d.stream.labels.contains(SHARD_LABEL));
            prop_assert!(!d.stream.entries.is_empty());
        }
    }

    #[test]
    fn prop_rate_sharding_keeps_order_within_shard(entry_count in 1usize..100, shards in 1usize..8) {
        let s = sharder(Duration::from_secs(3600));
        let timestamps: Vec<i64> = (0..entry_count as i64).collect();
        let derived = s.divide_entries_between_shards(
            "acme",
            shards,
            &base_labels(),
            stream_of(&timestamps),
        );
        for d in &derived {
            let ts: Vec<i64> = d.stream.entries.iter().map(|e| e.timestamp_ns).collect();
            let mut sorted = ts.clone();
            sorted.sort();
            prop_assert_eq!(ts, sorted);
        }
    }

    #[test]
    fn prop_time_sharding_preserves_entries(
        offsets in proptest::collection::vec(0i64..(4 * 3600), 1..100),
    ) {
        let s = sharder(Duration::from_secs(3600));
        let base = 1_700_000_000 * SECOND;
        let timestamps: Vec<i64> = offsets.iter().map(|o| base + o * SECOND).collect();
        let stream = stream_of(&timestamps);
        let before = sorted_lines(stream.entries.iter());
        let ignore_recent_from = base + 3 * 3600 * SECOND;

        let shards = s.shard_stream_by_time(stream, &base_labels(), ignore_recent_from);

        prop_assert_eq!(sorted_lines(shards.iter().flat_map(|t| t.stream.entries.iter())), before);
        for shard in &shards {
            prop_assert!(!shard.stream.entries.is_empty());
            let sharded = shard.stream.labels.contains(TIME_SHARD_LABEL);
            let all_old = shard.stream.entries.iter().all(|e| e.timestamp_ns < ignore_recent_from);
            prop_assert_eq!(sharded, all_old);
            let size: usize = shard.stream.entries.iter().map(|e| e.line.len()).sum();
            prop_assert_eq!(shard.lines_size, size);
        }
    }

    #[test]
    fn prop_no_sharding_without_history(push in 0i64..10_000, extra in 0i64..10_000) {
        prop_assert_eq!(calculate_shards(0, push, push + extra + 1), 1);
    }

    #[test]
    fn prop_shard_count_covers_load(rate in 0i64..1_000_000, push in 0i64..1_000_000, desired in 1i64..100_000) {
        let shards = calculate_shards(rate, push, desired) as i64;
        prop_assert!(shards >= 1);
        prop_assert!(shards * desired >= rate + push);
    }
}
