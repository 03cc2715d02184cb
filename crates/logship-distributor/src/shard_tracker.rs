//! Per-stream shard cursor.
//!
//! Remembers where round-robin sharding stopped for each `(tenant, stream)`
//! so consecutive pushes continue on the next shard instead of always
//! starting at zero.

use std::collections::HashMap;
use std::sync::Mutex;

/// Last shard index handed out per tenant and stream hash.
#[derive(Debug, Default)]
pub struct ShardTracker {
    last: Mutex<HashMap<(String, u64), usize>>,
}

impl ShardTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard index the next push for this stream starts at (0 if unseen).
    pub fn last_shard_num(&self, tenant_id: &str, stream_hash: u64) -> usize {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.get(&(tenant_id.to_string(), stream_hash))
            .copied()
            .unwrap_or(0)
    }

    /// Record where the next push for this stream should start.
    pub fn set_last_shard_num(&self, tenant_id: &str, stream_hash: u64, shard_num: usize) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.insert((tenant_id.to_string(), stream_hash), shard_num);
    }

    /// Number of tracked streams.
    pub fn len(&self) -> usize {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
