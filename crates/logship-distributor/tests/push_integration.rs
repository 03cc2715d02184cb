//! End-to-end push scenarios against an in-process ring of mock nodes.
//!
//! These tests drive `Distributor::push` through validation, sharding, rate
//! limiting and both write paths, and check what reached the nodes.

mod common;

use async_trait::async_trait;
use common::{fast_config, now_ns, FixedRate, NodeMode, TestCluster};
use logship_distributor::append_log::decode;
use logship_distributor::ingest_limits::ExceedsReason;
use logship_distributor::sharding::SHARD_LABEL;
use logship_distributor::{
    DiscardReason, DistributorConfig, DistributorError, DistributorState, Entry,
    ExceedsLimitsRequest, ExceedsLimitsResult, Labels, LimitsFrontendClient, LogProducer,
    ProduceResult, PushRequest, Record, RequestContext, Result, ShardStreamsConfig,
    StaticPartitionRing, Stream, TenantLimits,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn single_stream(labels: &str, lines: &[&str]) -> PushRequest {
    let ts = now_ns();
    PushRequest::new(vec![Stream::new(
        labels,
        lines
            .iter()
            .enumerate()
            .map(|(i, l)| Entry::new(ts + i as i64, *l))
            .collect(),
    )])
}

#[tokio::test]
async fn test_quorum_reached_with_one_slow_node() {
    let cluster = TestCluster::new(3, 3, TenantLimits::default());
    cluster.nodes[2].set_mode(NodeMode::Hang);
    let d = cluster.distributor();

    let resp = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api", team="core"}"#, &["one", "two", "three"]),
        )
        .await
        .unwrap();
    assert!(resp.warnings.is_empty());

    assert_eq!(cluster.nodes[0].entry_count(), 3);
    assert_eq!(cluster.nodes[1].entry_count(), 3);
    assert_eq!(cluster.nodes[2].entry_count(), 0);
    d.stop().await;
}

#[tokio::test]
async fn test_late_failure_after_quorum_keeps_success() {
    let cluster = TestCluster::new(3, 3, TenantLimits::default());
    cluster.nodes[2].set_mode(NodeMode::FailAfter(Duration::from_millis(50)));
    let d = cluster.distributor();

    let resp = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one", "two", "three"]),
        )
        .await;
    assert!(resp.is_ok());
    assert_eq!(cluster.nodes[0].entry_count(), 3);
    assert_eq!(cluster.nodes[1].entry_count(), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        d.metrics()
            .ingester_appends
            .with_label_values(&["node-2:9095"])
            .get(),
        1
    );
    assert_eq!(cluster.nodes[2].entry_count(), 0);
    d.stop().await;
}

#[tokio::test]
async fn test_push_fails_when_quorum_lost() {
    let cluster = TestCluster::new(3, 3, TenantLimits::default());
    cluster.nodes[1].set_mode(NodeMode::Fail);
    cluster.nodes[2].set_mode(NodeMode::Fail);
    let d = cluster.distributor();

    let err = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DistributorError::NodePush { .. }));
    assert_eq!(err.status_code(), 500);
    d.stop().await;
}

#[tokio::test]
async fn test_missing_enforced_label_rejects_stream() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        enforced_labels: vec!["team".to_string()],
        ..Default::default()
    });
    let d = cluster.distributor();

    let err = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one"]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(err
        .to_string()
        .contains("missing required labels team for user acme"));
    assert_eq!(cluster.total_entries(), 0);

    let discarded = d
        .metrics()
        .discarded_samples
        .with_label_values(&[
            DiscardReason::MissingEnforcedLabels.as_str(),
            "acme",
            "",
            "native",
        ])
        .get();
    assert_eq!(discarded, 1);
    d.stop().await;
}

#[tokio::test]
async fn test_valid_streams_written_despite_invalid_sibling() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let d = cluster.distributor();
    let ts = now_ns();
    let req = PushRequest::new(vec![
        Stream::new(r#"{app="api"}"#, vec![Entry::new(ts, "good")]),
        Stream::new("not a selector", vec![Entry::new(ts, "bad")]),
    ]);

    let err = d.push(&RequestContext::new("acme"), req).await.unwrap_err();
    assert!(matches!(err, DistributorError::Validation { .. }));
    assert_eq!(cluster.total_entries(), 1);
    d.stop().await;
}

#[tokio::test]
async fn test_duplicate_timestamp_bumped_by_one_nanosecond() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        increment_duplicate_timestamp: true,
        ..Default::default()
    });
    let d = cluster.distributor();
    let ts = now_ns();
    let req = PushRequest::new(vec![Stream::new(
        r#"{app="api"}"#,
        vec![Entry::new(ts, "first"), Entry::new(ts, "second")],
    )]);

    d.push(&RequestContext::new("acme"), req).await.unwrap();

    let pushed = cluster.nodes[0].pushed();
    let stamps: Vec<i64> = pushed[0].entries.iter().map(|e| e.timestamp_ns).collect();
    assert_eq!(stamps, vec![ts, ts + 1]);
    d.stop().await;
}

#[tokio::test]
async fn test_hot_stream_is_sharded() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        shard_streams: ShardStreamsConfig {
            enabled: true,
            desired_rate_bytes: 100,
            ..Default::default()
        },
        ..Default::default()
    });
    let mut deps = cluster.dependencies();
    deps.rate_store = Some(Arc::new(FixedRate {
        rate: 1000,
        push_rate: 1.0,
    }));
    let d = cluster.distributor_with(fast_config(), deps);

    let lines: Vec<String> = (0..20).map(|i| format!("line {i:02}")).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    d.push(
        &RequestContext::new("acme"),
        single_stream(r#"{app="api"}"#, &refs),
    )
    .await
    .unwrap();

    let pushed = cluster.nodes[0].pushed();
    assert!(pushed.len() > 1);
    assert!(pushed.iter().all(|s| s.labels.contains(SHARD_LABEL)));
    assert_eq!(cluster.total_entries(), 20);
    assert_eq!(d.metrics().stream_sharding_count.get(), 1);
    d.stop().await;
}

#[tokio::test]
async fn test_rate_limited_push() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        ingestion_rate_mb: 0.0001,
        ingestion_burst_size_mb: 0.0001,
        ..Default::default()
    });
    let d = cluster.distributor();
    let long_line = "x".repeat(1024);

    let err = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &[long_line.as_str()]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    match err {
        DistributorError::RateLimited { lines, bytes, .. } => {
            assert_eq!(lines, 1);
            assert_eq!(bytes, 1024);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(cluster.total_entries(), 0);
    d.stop().await;
}

#[tokio::test]
async fn test_empty_request_is_unprocessable() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let d = cluster.distributor();
    let err = d
        .push(&RequestContext::new("acme"), PushRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DistributorError::MissingStreams));
    assert_eq!(err.status_code(), 422);
    d.stop().await;
}

#[tokio::test]
async fn test_blocked_tenant_gets_configured_status() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        blocked_ingestion_until: Some(i64::MAX),
        ..Default::default()
    });
    let d = cluster.distributor();

    let err = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one"]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 260);
    assert_eq!(cluster.total_entries(), 0);
    d.stop().await;
}

#[tokio::test]
async fn test_soft_blocked_tenant_gets_warning() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        blocked_ingestion_until: Some(i64::MAX),
        blocked_ingestion_status_code: 200,
        ..Default::default()
    });
    let d = cluster.distributor();

    let resp = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one"]),
        )
        .await
        .unwrap();
    assert_eq!(resp.warnings.len(), 1);
    assert_eq!(cluster.total_entries(), 0);
    d.stop().await;
}

#[derive(Default)]
struct CapturingProducer {
    records: Mutex<Vec<Record>>,
}

#[async_trait]
impl LogProducer for CapturingProducer {
    async fn produce_sync(&self, records: Vec<Record>) -> Vec<ProduceResult> {
        let results = records
            .iter()
            .map(|r| ProduceResult::ok(r.value.len()))
            .collect();
        self.records.lock().unwrap().extend(records);
        results
    }
}

#[tokio::test]
async fn test_append_log_only_path() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let producer = Arc::new(CapturingProducer::default());
    let mut deps = cluster.dependencies();
    deps.producer = Some(producer.clone());
    deps.partition_ring = Some(Arc::new(StaticPartitionRing::with_active(4)));
    let config = DistributorConfig {
        ingester_writes_enabled: false,
        kafka_writes_enabled: true,
        ..fast_config()
    };
    let d = cluster.distributor_with(config, deps);

    d.push(
        &RequestContext::new("acme"),
        single_stream(r#"{app="api"}"#, &["one", "two"]),
    )
    .await
    .unwrap();

    assert_eq!(cluster.total_entries(), 0);
    let records = producer.records.lock().unwrap().clone();
    assert_eq!(records.len(), 1);
    let (tenant, stream) = decode(&records[0]).unwrap();
    assert_eq!(tenant, "acme");
    assert_eq!(stream.entries.len(), 2);
    d.stop().await;
}

#[tokio::test]
async fn test_caller_cancellation() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    cluster.nodes[0].set_mode(NodeMode::Hang);
    let config = DistributorConfig {
        remote_timeout_ms: 60_000,
        ..fast_config()
    };
    let d = cluster.distributor_with(config, cluster.dependencies());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = d
        .push(
            &RequestContext::with_cancel("acme", cancel),
            single_stream(r#"{app="api"}"#, &["one"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DistributorError::Cancelled));
    assert_eq!(err.status_code(), 499);
    d.stop().await;
}

#[tokio::test]
async fn test_push_after_stop_is_unavailable() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let d = cluster.distributor();
    d.stop().await;
    assert_eq!(d.state(), DistributorState::Stopped);

    let err = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one"]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn test_simulated_latency_delays_response() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        simulated_push_latency_ms: 100,
        ..Default::default()
    });
    let d = cluster.distributor();

    let start = tokio::time::Instant::now();
    d.push(
        &RequestContext::new("acme"),
        single_stream(r#"{app="api"}"#, &["one"]),
    )
    .await
    .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
    d.stop().await;
}

/// Limits service rejecting the listed label sets, or failing every call.
struct StreamLimitsService {
    rejected: HashSet<u64>,
    unavailable: bool,
}

impl StreamLimitsService {
    fn rejecting(selectors: &[&str]) -> Self {
        Self {
            rejected: selectors
                .iter()
                .map(|s| Labels::parse(s).unwrap().stable_hash())
                .collect(),
            unavailable: false,
        }
    }

    fn unavailable() -> Self {
        Self {
            rejected: HashSet::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl LimitsFrontendClient for StreamLimitsService {
    async fn exceeds_limits(&self, req: ExceedsLimitsRequest) -> Result<Vec<ExceedsLimitsResult>> {
        if self.unavailable {
            return Err(DistributorError::NodePush {
                addr: "limits-frontend".to_string(),
                msg: "connection refused".to_string(),
            });
        }
        Ok(req
            .streams
            .iter()
            .filter(|s| self.rejected.contains(&s.stream_hash))
            .map(|s| ExceedsLimitsResult {
                stream_hash: s.stream_hash,
                reason: ExceedsReason::MaxStreams,
            })
            .collect())
    }
}

fn with_stream_limits(
    cluster: &TestCluster,
    service: StreamLimitsService,
    dry_run: bool,
    rate: Option<FixedRate>,
) -> logship_distributor::Distributor {
    let mut deps = cluster.dependencies();
    deps.limits_frontend = Some(Arc::new(service));
    if let Some(rate) = rate {
        deps.rate_store = Some(Arc::new(rate));
    }
    let config = DistributorConfig {
        ingest_limits_enabled: true,
        ingest_limits_dry_run_enabled: dry_run,
        ..fast_config()
    };
    cluster.distributor_with(config, deps)
}

fn stream_limit_discards(d: &logship_distributor::Distributor) -> u64 {
    d.metrics()
        .discarded_samples
        .with_label_values(&[DiscardReason::StreamLimit.as_str(), "acme", "", "native"])
        .get()
}

#[tokio::test]
async fn test_all_streams_over_limit() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let d = with_stream_limits(
        &cluster,
        StreamLimitsService::rejecting(&[r#"{app="api"}"#]),
        false,
        None,
    );

    let err = d
        .push(
            &RequestContext::new("acme"),
            single_stream(r#"{app="api"}"#, &["one", "two", "three"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DistributorError::LimitsExceeded));
    assert_eq!(err.status_code(), 429);
    assert_eq!(cluster.total_entries(), 0);
    assert_eq!(stream_limit_discards(&d), 3);
    d.stop().await;
}

#[tokio::test]
async fn test_stream_limits_dry_run_does_not_enforce() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let d = with_stream_limits(
        &cluster,
        StreamLimitsService::rejecting(&[r#"{app="api"}"#]),
        true,
        None,
    );

    d.push(
        &RequestContext::new("acme"),
        single_stream(r#"{app="api"}"#, &["one", "two", "three"]),
    )
    .await
    .unwrap();
    assert_eq!(cluster.total_entries(), 3);
    assert_eq!(
        d.metrics()
            .ingest_limits_rejected
            .with_label_values(&["max_streams"])
            .get(),
        1
    );
    assert_eq!(stream_limit_discards(&d), 0);
    d.stop().await;
}

#[tokio::test]
async fn test_rejected_stream_dropped_with_all_shards() {
    let cluster = TestCluster::new(1, 1, TenantLimits {
        shard_streams: ShardStreamsConfig {
            enabled: true,
            desired_rate_bytes: 100,
            ..Default::default()
        },
        ..Default::default()
    });
    let d = with_stream_limits(
        &cluster,
        StreamLimitsService::rejecting(&[r#"{app="api"}"#]),
        false,
        Some(FixedRate {
            rate: 1000,
            push_rate: 1.0,
        }),
    );

    let ts = now_ns();
    let req = PushRequest::new(vec![
        Stream::new(
            r#"{app="api"}"#,
            (0..10).map(|i| Entry::new(ts + i, format!("api {i}"))).collect(),
        ),
        Stream::new(
            r#"{app="web"}"#,
            (0..4).map(|i| Entry::new(ts + i, format!("web {i}"))).collect(),
        ),
    ]);
    d.push(&RequestContext::new("acme"), req).await.unwrap();

    let pushed = cluster.nodes[0].pushed();
    assert!(!pushed.is_empty());
    assert!(pushed.iter().all(|s| s.labels.contains(r#"app="web""#)));
    assert_eq!(cluster.total_entries(), 4);
    assert_eq!(stream_limit_discards(&d), 10);
    d.stop().await;
}

#[tokio::test]
async fn test_stream_limits_unavailable_fails_open() {
    let cluster = TestCluster::new(1, 1, TenantLimits::default());
    let d = with_stream_limits(&cluster, StreamLimitsService::unavailable(), false, None);

    d.push(
        &RequestContext::new("acme"),
        single_stream(r#"{app="api"}"#, &["one", "two", "three"]),
    )
    .await
    .unwrap();
    assert_eq!(cluster.total_entries(), 3);
    d.stop().await;
}
