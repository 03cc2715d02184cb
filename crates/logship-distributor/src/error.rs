//! Error types for the distributor.

use thiserror::Error;

/// HTTP status returned for malformed or rejected input.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// HTTP status returned when a request carries no streams.
pub const STATUS_UNPROCESSABLE_ENTITY: u16 = 422;
/// HTTP status returned for rate-limited or over-limit requests.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// Non-standard status used when the caller went away before completion.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;
/// HTTP status returned for upstream write failures.
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;
/// HTTP status returned while the distributor is not accepting pushes.
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Errors produced by the ring abstractions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RingError {
    /// The ring has no instances at all.
    #[error("empty ring")]
    EmptyRing,

    /// Not enough healthy instances to form a write quorum.
    #[error("at least {required} live replicas required, could only find {found}")]
    TooFewHealthyInstances {
        /// Minimum number of healthy replicas required.
        required: usize,
        /// Healthy replicas actually found.
        found: usize,
    },

    /// No active partition is available for writes.
    #[error("no active partition found")]
    NoActivePartitions,

    /// The requested partition does not exist.
    #[error("partition {0} not found")]
    PartitionNotFound(i32),
}

/// Errors produced while encoding a stream into append-log records.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A single entry does not fit into one record.
    #[error("single entry size ({size} bytes) exceeds maximum record size ({max} bytes)")]
    EntryTooLarge {
        /// Encoded size of the offending entry.
        size: usize,
        /// Configured maximum record size.
        max: usize,
    },

    /// Serialization failure.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),
}

/// Errors reported by the append-log producer for one record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProduceError {
    /// The produce request timed out.
    #[error("produce timed out")]
    Timeout,

    /// Any other produce failure.
    #[error("produce failed: {0}")]
    Failed(String),
}

/// Errors that can occur while pushing to the distributor.
#[derive(Debug, Clone, Error)]
pub enum DistributorError {
    /// The request contained no streams.
    #[error("error at least one valid stream is required for ingestion")]
    MissingStreams,

    /// One or more streams or entries failed validation.
    #[error("{message}")]
    Validation {
        /// All validation messages, newline separated.
        message: String,
    },

    /// Ingestion is blocked for the tenant or one of its policies.
    #[error("{message}")]
    IngestionBlocked {
        /// Status code configured for the block.
        status: u16,
        /// Reason for the block.
        message: String,
    },

    /// The tenant's ingestion rate limit was exceeded.
    #[error("ingestion rate limit exceeded for user {tenant} (limit: {limit} bytes/sec) while attempting to ingest '{lines}' lines totaling '{bytes}' bytes, reduce log volume or request a higher limit")]
    RateLimited {
        /// Tenant identifier.
        tenant: String,
        /// Current limit in bytes per second.
        limit: u64,
        /// Lines in the rejected request.
        lines: usize,
        /// Bytes in the rejected request.
        bytes: usize,
    },

    /// The external limits service rejected every stream.
    #[error("request exceeded limits")]
    LimitsExceeded,

    /// The ring could not produce a valid write set.
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// A node rejected or failed a push.
    #[error("push to {addr} failed: {msg}")]
    NodePush {
        /// Node address.
        addr: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// A node did not answer within the remote timeout.
    #[error("push to {addr} timed out after {timeout_ms}ms")]
    NodeTimeout {
        /// Node address.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Writing a stream to the append log failed.
    #[error("failed to write stream to append log: {msg}")]
    AppendLog {
        /// Error message describing the failure.
        msg: String,
    },

    /// The caller cancelled the request.
    #[error("context canceled")]
    Cancelled,

    /// The distributor is not running.
    #[error("distributor is not running")]
    NotRunning,

    /// In-flight writes were dropped before reporting a result.
    #[error("distributor shut down")]
    Shutdown,

    /// Invalid configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl DistributorError {
    /// Status code class reported to the client for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DistributorError::MissingStreams => STATUS_UNPROCESSABLE_ENTITY,
            DistributorError::Validation { .. } => STATUS_BAD_REQUEST,
            DistributorError::IngestionBlocked { status, .. } => *status,
            DistributorError::RateLimited { .. } | DistributorError::LimitsExceeded => {
                STATUS_TOO_MANY_REQUESTS
            }
            DistributorError::Cancelled => STATUS_CLIENT_CLOSED_REQUEST,
            DistributorError::NotRunning => STATUS_SERVICE_UNAVAILABLE,
            DistributorError::Ring(_)
            | DistributorError::NodePush { .. }
            | DistributorError::NodeTimeout { .. }
            | DistributorError::AppendLog { .. }
            | DistributorError::Shutdown
            | DistributorError::Config { .. }
            | DistributorError::Metrics(_) => STATUS_INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true for 4xx errors, which clients should not retry.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<prometheus::Error> for DistributorError {
    fn from(err: prometheus::Error) -> Self {
        DistributorError::Metrics(err.to_string())
    }
}

/// Result type for distributor operations.
pub type Result<T> = std::result::Result<T, DistributorError>;
