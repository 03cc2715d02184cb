//! Wire-level stream types exchanged with clients, nodes and the append log.

use crate::labels::LabelPair;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Format label used for the native push API.
pub const FORMAT_NATIVE: &str = "native";

/// A single log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unix timestamp in nanoseconds.
    pub timestamp_ns: i64,
    /// Line content.
    pub line: String,
    /// Structured metadata attached to the line.
    pub structured_metadata: Vec<LabelPair>,
}

impl Entry {
    /// Create an entry without structured metadata.
    pub fn new(timestamp_ns: i64, line: impl Into<String>) -> Self {
        Self {
            timestamp_ns,
            line: line.into(),
            structured_metadata: Vec::new(),
        }
    }

    /// Attach a structured metadata pair.
    pub fn with_metadata(mut self, name: &str, value: &str) -> Self {
        self.structured_metadata.push(LabelPair::new(name, value));
        self
    }

    /// Byte size of the structured metadata names and values.
    pub fn structured_metadata_size(&self) -> usize {
        self.structured_metadata
            .iter()
            .map(|p| p.name.len() + p.value.len())
            .sum()
    }
}

/// Entries sharing one label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Label set in its string form.
    pub labels: String,
    /// Stable hash of the parsed labels (zero until validated).
    pub hash: u64,
    /// Log entries.
    pub entries: Vec<Entry>,
}

impl Stream {
    /// Create a stream from a label string and entries.
    pub fn new(labels: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            labels: labels.into(),
            hash: 0,
            entries,
        }
    }

    /// Sum of line lengths in bytes.
    pub fn lines_size(&self) -> usize {
        self.entries.iter().map(|e| e.line.len()).sum()
    }

    /// Sum of line and structured metadata sizes in bytes.
    pub fn total_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.line.len() + e.structured_metadata_size())
            .sum()
    }
}

/// A stream together with its routing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedStream {
    /// Shard-aware ring token, used for replica and partition selection.
    pub hash_key: u32,
    /// Hash of the logical stream regardless of sharding.
    pub hash_key_no_shard: u64,
    /// The stream itself.
    pub stream: Stream,
}

/// A batch of streams pushed by a client, or forwarded to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Streams in the batch.
    pub streams: Vec<Stream>,
}

impl PushRequest {
    /// Create a request.
    pub fn new(streams: Vec<Stream>) -> Self {
        Self { streams }
    }
}

/// Response to a successful push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushResponse {
    /// Messages for streams dropped without failing the request (soft blocks).
    pub warnings: Vec<String>,
}

/// Per-request context carrying the out-of-band tenant id and the caller's
/// cancellation signal.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Fires when the caller gives up on the request.
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// Context for a tenant with a fresh cancellation token.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context for a tenant bound to an existing token.
    pub fn with_cancel(tenant_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            cancel,
        }
    }
}
