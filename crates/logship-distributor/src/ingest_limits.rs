//! Checks against the external limits service.
//!
//! The service tracks per-tenant stream counts and rates across the whole
//! cluster. The distributor asks it which streams of a request exceed those
//! limits and drops them.

use crate::error::Result;
use crate::metrics::DistributorMetrics;
use crate::stream::KeyedStream;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Why the limits service rejected a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceedsReason {
    /// The tenant has too many active streams.
    MaxStreams,
    /// The stream exceeds its rate limit.
    RateLimited,
}

impl ExceedsReason {
    /// Metric label for the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceedsReason::MaxStreams => "max_streams",
            ExceedsReason::RateLimited => "rate_limited",
        }
    }
}

/// One stream in a limits request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Hash of the un-sharded stream.
    pub stream_hash: u64,
    /// Total entry bytes in this request.
    pub total_size: u64,
}

/// Request to the limits service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceedsLimitsRequest {
    /// Tenant identifier.
    pub tenant: String,
    /// Streams in the push.
    pub streams: Vec<StreamMetadata>,
}

/// A rejected stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceedsLimitsResult {
    /// Hash of the rejected un-sharded stream.
    pub stream_hash: u64,
    /// Reason for the rejection.
    pub reason: ExceedsReason,
}

/// Client for the limits service.
#[async_trait]
pub trait LimitsFrontendClient: Send + Sync {
    /// Streams of the request that exceed limits.
    async fn exceeds_limits(&self, req: ExceedsLimitsRequest) -> Result<Vec<ExceedsLimitsResult>>;
}

/// Applies limits service decisions to a push.
pub struct IngestLimits {
    client: Arc<dyn LimitsFrontendClient>,
    metrics: DistributorMetrics,
}

impl IngestLimits {
    /// Create the enforcer.
    pub fn new(client: Arc<dyn LimitsFrontendClient>, metrics: DistributorMetrics) -> Self {
        Self { client, metrics }
    }

    /// Streams that are within limits. Every shard of a rejected logical
    /// stream is dropped.
    pub async fn enforce_limits(
        &self,
        tenant_id: &str,
        streams: &[KeyedStream],
    ) -> Result<Vec<KeyedStream>> {
        let req = ExceedsLimitsRequest {
            tenant: tenant_id.to_string(),
            streams: streams
                .iter()
                .map(|s| StreamMetadata {
                    stream_hash: s.hash_key_no_shard,
                    total_size: s.stream.total_size() as u64,
                })
                .collect(),
        };
        let results = self.client.exceeds_limits(req).await?;
        if results.is_empty() {
            return Ok(streams.to_vec());
        }

        let mut rejected = HashSet::with_capacity(results.len());
        for result in &results {
            self.metrics
                .ingest_limits_rejected
                .with_label_values(&[result.reason.as_str()])
                .inc();
            rejected.insert(result.stream_hash);
        }
        debug!(
            tenant = tenant_id,
            rejected = rejected.len(),
            "streams exceed limits"
        );

        Ok(streams
            .iter()
            .filter(|s| !rejected.contains(&s.hash_key_no_shard))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DistributorError;
    use crate::stream::{Entry, Stream};

    struct RejectHashes(Vec<u64>);

    #[async_trait]
    impl LimitsFrontendClient for RejectHashes {
        async fn exceeds_limits(
            &self,
            req: ExceedsLimitsRequest,
        ) -> Result<Vec<ExceedsLimitsResult>> {
            if req.tenant == "broken" {
                return Err(DistributorError::LimitsExceeded);
            }
            Ok(req
                .streams
                .iter()
                .filter(|s| self.0.contains(&s.stream_hash))
                .map(|s| ExceedsLimitsResult {
                    stream_hash: s.stream_hash,
                    reason: ExceedsReason::MaxStreams,
                })
                .collect())
        }
    }

    fn keyed(hash_key: u32, no_shard: u64) -> KeyedStream {
        KeyedStream {
            hash_key,
            hash_key_no_shard: no_shard,
            stream: Stream::new(r#"{app="api"}"#, vec![Entry::new(1, "line")]),
        }
    }

    #[tokio::test]
    async fn test_rejected_streams_are_dropped() {
        let metrics = DistributorMetrics::unregistered().unwrap();
        let limits = IngestLimits::new(Arc::new(RejectHashes(vec![2])), metrics.clone());
        let streams = vec![keyed(1, 1), keyed(2, 2), keyed(3, 2)];

        let accepted = limits.enforce_limits("acme", &streams).await.unwrap();
        assert_eq!(accepted, vec![keyed(1, 1)]);
        assert_eq!(
            metrics
                .ingest_limits_rejected
                .with_label_values(&["max_streams"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn test_nothing_rejected() {
        let limits = IngestLimits::new(
            Arc::new(RejectHashes(Vec::new())),
            DistributorMetrics::unregistered().unwrap(),
        );
        let streams = vec![keyed(1, 1)];
        assert_eq!(limits.enforce_limits("acme", &streams).await.unwrap(), streams);
    }

    #[tokio::test]
    async fn test_client_error_propagates() {
        let limits = IngestLimits::new(
            Arc::new(RejectHashes(Vec::new())),
            DistributorMetrics::unregistered().unwrap(),
        );
        assert!(limits.enforce_limits("broken", &[keyed(1, 1)]).await.is_err());
    }
}
