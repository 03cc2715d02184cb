//! Clients for downstream storage nodes.

use crate::error::Result;
use crate::stream::PushRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Observed throughput of one stream on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRate {
    /// Tenant the stream belongs to.
    pub tenant: String,
    /// Hash of the (possibly sharded) stream.
    pub stream_hash: u64,
    /// Hash of the logical stream before sharding.
    pub stream_hash_no_shard: u64,
    /// Bytes per second.
    pub rate: i64,
    /// Pushes per second.
    pub pushes: u32,
}

/// Connection to one storage node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Write a batch of streams.
    async fn push(&self, req: PushRequest) -> Result<()>;

    /// Per-stream rates currently observed by the node.
    async fn stream_rates(&self) -> Result<Vec<StreamRate>>;
}

/// Creates clients for node addresses.
pub trait ClientFactory: Send + Sync {
    /// Open a client for `addr`.
    fn create(&self, addr: &str) -> Result<Arc<dyn NodeClient>>;
}

/// Cache of node clients keyed by address.
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    clients: DashMap<String, Arc<dyn NodeClient>>,
}

impl ClientPool {
    /// Create an empty pool.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: DashMap::new(),
        }
    }

    /// Cached client for `addr`, creating it on first use.
    pub fn get_client_for(&self, addr: &str) -> Result<Arc<dyn NodeClient>> {
        if let Some(client) = self.clients.get(addr) {
            return Ok(client.clone());
        }
        let client = self.factory.create(addr)?;
        debug!(addr, "created node client");
        Ok(self
            .clients
            .entry(addr.to_string())
            .or_insert(client)
            .clone())
    }

    /// Drop the cached client for `addr`.
    pub fn remove(&self, addr: &str) -> bool {
        self.clients.remove(addr).is_some()
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are cached.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
