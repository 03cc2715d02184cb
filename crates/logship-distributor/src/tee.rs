//! Secondary consumers of accepted streams.

use crate::stream::KeyedStream;
use std::sync::Arc;

/// Receives a copy of every accepted batch. Implementations must not block
/// the push path; anything slow belongs on a background task.
pub trait Tee: Send + Sync {
    /// Duplicate accepted streams for a tenant.
    fn duplicate(&self, tenant_id: &str, streams: &[KeyedStream]);
}

/// Fans a batch out to several tees in order.
#[derive(Clone, Default)]
pub struct TeeChain {
    tees: Vec<Arc<dyn Tee>>,
}

impl TeeChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tee to the chain.
    pub fn with(mut self, tee: Arc<dyn Tee>) -> Self {
        self.tees.push(tee);
        self
    }

    /// Number of tees.
    pub fn len(&self) -> usize {
        self.tees.len()
    }

    /// Returns true if the chain has no tees.
    pub fn is_empty(&self) -> bool {
        self.tees.is_empty()
    }
}

impl Tee for TeeChain {
    fn duplicate(&self, tenant_id: &str, streams: &[KeyedStream]) {
        for tee in &self.tees {
            tee.duplicate(tenant_id, streams);
        }
    }
}
