#![warn(missing_docs)]

//! logship distributor: the stateless write front of a multi-tenant log store.
//!
//! Push path: Request → Validate → Shard → Rate limit → Stream limits → Tee →
//! Replicas (quorum) and/or Append log → Response

pub mod append_log;
pub mod client;
pub mod config;
pub mod distributor;
pub mod error;
pub mod fanout;
pub mod field_detection;
pub mod ingest_limits;
pub mod labels;
pub mod limits;
pub mod metrics;
pub mod rate_limiter;
pub mod rate_store;
pub mod ring;
pub mod shard_tracker;
pub mod sharding;
pub mod stream;
pub mod tee;
pub mod tracker;
pub mod usage;
pub mod validator;
pub mod write_failures;

pub use append_log::{AppendLogWriter, LogProducer, ProduceResult, Record};
pub use client::{ClientFactory, ClientPool, NodeClient, StreamRate};
pub use config::{DistributorConfig, RateStoreConfig, WriteFailuresConfig};
pub use distributor::{Dependencies, Distributor, DistributorState};
pub use error::{DistributorError, ProduceError, Result, RingError};
pub use ingest_limits::{ExceedsLimitsRequest, ExceedsLimitsResult, LimitsFrontendClient};
pub use labels::{LabelPair, Labels};
pub use limits::{Limits, Overrides, ShardStreamsConfig, TenantLimits};
pub use metrics::DistributorMetrics;
pub use rate_limiter::{HealthyInstancesCount, InstanceCounter};
pub use rate_store::{IngesterRateStore, RateStore};
pub use ring::{HashRing, InstanceDesc, PartitionRingReader, ReadRing, StaticPartitionRing};
pub use stream::{Entry, KeyedStream, PushRequest, PushResponse, RequestContext, Stream};
pub use tee::{Tee, TeeChain};
pub use usage::{DiscardedBytesTotals, UsageTracker};
pub use validator::DiscardReason;
