//! Read-only ring abstractions for replica and partition selection.
//!
//! The distributor only ever reads the ring. [`ReadRing`] resolves a stream
//! token into a [`ReplicationSet`]; [`PartitionRingReader`] hands out
//! per-tenant partition subrings for the append-log path. [`HashRing`] and
//! [`StaticPartitionRing`] are in-memory implementations backed by token maps.

use crate::error::RingError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Typical replication factor 3, plus one for an inactive instance, plus one
/// spare. Used to size lookup buffers.
pub const MAX_EXPECTED_REPLICATION_SET: usize = 5;

const DEFAULT_TOKENS_PER_INSTANCE: u32 = 128;
const DEFAULT_TOKENS_PER_PARTITION: u32 = 16;

/// Ring operation a lookup is performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Write, extending the set past instances that are not active.
    Write,
    /// Write without extending the set.
    WriteNoExtend,
    /// Read.
    Read,
}

/// Lifecycle state of a ring instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Serving reads and writes.
    Active,
    /// Starting up.
    Joining,
    /// Shutting down.
    Leaving,
    /// Registered without tokens.
    Pending,
}

/// One ring member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    /// Instance id.
    pub id: String,
    /// Address used to reach the instance.
    pub addr: String,
    /// Availability zone.
    pub zone: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Heartbeat health.
    pub healthy: bool,
}

impl InstanceDesc {
    /// An active, healthy instance.
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            zone: String::new(),
            state: InstanceState::Active,
            healthy: true,
        }
    }

    /// Returns true if the instance can take part in `op`.
    pub fn is_healthy_for(&self, op: Operation) -> bool {
        match op {
            Operation::Read => {
                self.healthy && matches!(self.state, InstanceState::Active | InstanceState::Leaving)
            }
            Operation::Write | Operation::WriteNoExtend => {
                self.healthy && self.state == InstanceState::Active
            }
        }
    }
}

/// Instances that must acknowledge a write, and how many of them may fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSet {
    /// Replicas to write to.
    pub instances: Vec<InstanceDesc>,
    /// Failures tolerated before the write fails.
    pub max_errors: usize,
}

impl ReplicationSet {
    /// Acknowledgements required for success.
    pub fn min_success(&self) -> usize {
        self.instances.len().saturating_sub(self.max_errors)
    }
}

/// Read-only view of the replica ring.
pub trait ReadRing: Send + Sync {
    /// Replication set for a token. `buf` is reused for the instance list.
    fn get(
        &self,
        key: u32,
        op: Operation,
        buf: Vec<InstanceDesc>,
    ) -> Result<ReplicationSet, RingError>;

    /// Configured replication factor.
    fn replication_factor(&self) -> usize;

    /// Every instance currently healthy for writes.
    fn healthy_instances(&self) -> Vec<InstanceDesc>;
}

/// Replica selection for stream tokens.
#[derive(Clone)]
pub struct ReplicaSelector {
    ring: Arc<dyn ReadRing>,
}

impl ReplicaSelector {
    /// Wrap a ring.
    pub fn new(ring: Arc<dyn ReadRing>) -> Self {
        Self { ring }
    }

    /// Replicas for a stream token, computed fresh on every call.
    pub fn replicas_for(&self, hash_key: u32) -> Result<ReplicationSet, RingError> {
        self.ring.get(
            hash_key,
            Operation::WriteNoExtend,
            Vec::with_capacity(MAX_EXPECTED_REPLICATION_SET),
        )
    }

    /// The underlying ring.
    pub fn ring(&self) -> &Arc<dyn ReadRing> {
        &self.ring
    }
}

#[derive(Debug, Default)]
struct RingState {
    tokens: BTreeMap<u32, String>,
    instances: HashMap<String, InstanceDesc>,
}

/// In-memory consistent hash ring.
///
/// Every instance owns a fixed number of tokens derived from its id. A key is
/// served by the owners of the first tokens at or after it, walking clockwise.
pub struct HashRing {
    replication_factor: usize,
    tokens_per_instance: u32,
    state: RwLock<RingState>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(replication_factor: usize) -> Self {
        Self::with_tokens(replication_factor, DEFAULT_TOKENS_PER_INSTANCE)
    }

    /// Create an empty ring with a custom token count per instance.
    pub fn with_tokens(replication_factor: usize, tokens_per_instance: u32) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
            tokens_per_instance: tokens_per_instance.max(1),
            state: RwLock::new(RingState::default()),
        }
    }

    /// Add or replace an instance.
    pub fn add_instance(&self, desc: InstanceDesc) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.tokens.retain(|_, owner| *owner != desc.id);
        let seed = hash_str(&desc.id);
        for i in 0..self.tokens_per_instance {
            let mut token = mix64(seed ^ u64::from(i)) as u32;
            // Collisions keep the existing owner; probe to the next free token.
            while state.tokens.contains_key(&token) {
                token = token.wrapping_add(1);
            }
            state.tokens.insert(token, desc.id.clone());
        }
        state.instances.insert(desc.id.clone(), desc);
    }

    /// Remove an instance and its tokens.
    pub fn remove_instance(&self, id: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.tokens.retain(|_, owner| owner != id);
        state.instances.remove(id).is_some()
    }

    /// Mark an instance healthy or unhealthy.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.instances.get_mut(id) {
            Some(desc) => {
                desc.healthy = healthy;
                true
            }
            None => false,
        }
    }

    /// Change an instance's lifecycle state.
    pub fn set_state(&self, id: &str, instance_state: InstanceState) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.instances.get_mut(id) {
            Some(desc) => {
                desc.state = instance_state;
                true
            }
            None => false,
        }
    }

    /// Number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .instances
            .len()
    }
}

impl ReadRing for HashRing {
    fn get(
        &self,
        key: u32,
        op: Operation,
        mut buf: Vec<InstanceDesc>,
    ) -> Result<ReplicationSet, RingError> {
        buf.clear();
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.tokens.is_empty() {
            return Err(RingError::EmptyRing);
        }

        let mut wanted = self.replication_factor.min(state.instances.len());
        let mut seen: HashSet<&str> = HashSet::with_capacity(wanted);
        let clockwise = state.tokens.range(key..).chain(state.tokens.range(..key));
        for (_, owner) in clockwise {
            if buf.len() >= wanted {
                break;
            }
            if !seen.insert(owner.as_str()) {
                continue;
            }
            let Some(desc) = state.instances.get(owner) else {
                continue;
            };
            if op == Operation::Write
                && desc.state != InstanceState::Active
                && wanted < state.instances.len()
            {
                wanted += 1;
            }
            buf.push(desc.clone());
        }

        let replication_factor = self.replication_factor.max(buf.len());
        let min_success = replication_factor / 2 + 1;
        buf.retain(|desc| desc.is_healthy_for(op));
        if buf.len() < min_success {
            return Err(RingError::TooFewHealthyInstances {
                required: min_success,
                found: buf.len(),
            });
        }

        let max_errors = buf.len() - min_success;
        Ok(ReplicationSet {
            instances: buf,
            max_errors,
        })
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    fn healthy_instances(&self) -> Vec<InstanceDesc> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut healthy: Vec<InstanceDesc> = state
            .instances
            .values()
            .filter(|d| d.is_healthy_for(Operation::Write))
            .cloned()
            .collect();
        healthy.sort_by(|a, b| a.id.cmp(&b.id));
        healthy
    }
}

/// Lifecycle state of an append-log partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    /// Accepting writes.
    Active,
    /// Not accepting writes.
    Inactive,
}

/// One append-log partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDesc {
    /// Partition id.
    pub id: i32,
    /// Lifecycle state.
    pub state: PartitionState,
}

/// A set of partitions with their tokens.
#[derive(Debug, Clone, Default)]
pub struct PartitionRing {
    partitions: BTreeMap<i32, PartitionState>,
    tokens: BTreeMap<u32, i32>,
}

impl PartitionRing {
    /// Build a ring from partition descriptors.
    pub fn new(partitions: impl IntoIterator<Item = PartitionDesc>) -> Self {
        let mut ring = Self::default();
        for p in partitions {
            ring.insert(p.id, p.state);
        }
        ring
    }

    fn insert(&mut self, id: i32, state: PartitionState) {
        let seed = mix64(id as u64);
        for i in 0..DEFAULT_TOKENS_PER_PARTITION {
            let mut token = mix64(seed ^ u64::from(i)) as u32;
            while self.tokens.contains_key(&token) {
                token = token.wrapping_add(1);
            }
            self.tokens.insert(token, id);
        }
        self.partitions.insert(id, state);
    }

    /// Number of partitions.
    pub fn partitions_count(&self) -> usize {
        self.partitions.len()
    }

    /// Ids of active partitions, ascending.
    pub fn active_partition_ids(&self) -> Vec<i32> {
        self.partitions
            .iter()
            .filter(|(_, s)| **s == PartitionState::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The active partition owning `key`: the first active partition whose
    /// token is at or after the key, walking clockwise.
    pub fn active_partition_for_key(&self, key: u32) -> Result<i32, RingError> {
        self.tokens
            .range(key..)
            .chain(self.tokens.range(..key))
            .map(|(_, id)| *id)
            .find(|id| self.partitions.get(id) == Some(&PartitionState::Active))
            .ok_or(RingError::NoActivePartitions)
    }

    /// Deterministic subring of `size` active partitions for a tenant.
    ///
    /// A size of zero, or one covering every active partition, returns the
    /// whole ring.
    pub fn shuffle_shard(&self, tenant_id: &str, size: usize) -> Result<PartitionRing, RingError> {
        let active = self.active_partition_ids();
        if active.is_empty() {
            return Err(RingError::NoActivePartitions);
        }
        if size == 0 || size >= active.len() {
            return Ok(self.clone());
        }

        let seed = hash_str(tenant_id);
        let mut chosen = BTreeMap::new();
        let mut round = 0u64;
        while chosen.len() < size {
            let idx = (mix64(seed.wrapping_add(round)) % active.len() as u64) as usize;
            chosen.insert(active[idx], PartitionState::Active);
            round += 1;
        }

        let mut subring = PartitionRing::default();
        for (id, state) in chosen {
            subring.insert(id, state);
        }
        Ok(subring)
    }
}

/// Source of per-tenant partition subrings.
pub trait PartitionRingReader: Send + Sync {
    /// Subring of `size` partitions for a tenant (0 = all).
    fn shuffle_shard(&self, tenant_id: &str, size: usize) -> Result<PartitionRing, RingError>;
}

/// Partition ring whose layout only changes through explicit updates.
pub struct StaticPartitionRing {
    ring: RwLock<Arc<PartitionRing>>,
}

impl StaticPartitionRing {
    /// `count` active partitions numbered from zero.
    pub fn with_active(count: i32) -> Self {
        Self::new(PartitionRing::new((0..count).map(|id| PartitionDesc {
            id,
            state: PartitionState::Active,
        })))
    }

    /// Wrap a partition ring.
    pub fn new(ring: PartitionRing) -> Self {
        Self {
            ring: RwLock::new(Arc::new(ring)),
        }
    }

    /// Change a partition's state.
    pub fn set_state(&self, id: i32, state: PartitionState) -> Result<(), RingError> {
        let mut guard = self.ring.write().unwrap_or_else(|e| e.into_inner());
        if !guard.partitions.contains_key(&id) {
            return Err(RingError::PartitionNotFound(id));
        }
        let mut updated = (**guard).clone();
        updated.partitions.insert(id, state);
        *guard = Arc::new(updated);
        Ok(())
    }

    /// Current ring snapshot.
    pub fn snapshot(&self) -> Arc<PartitionRing> {
        self.ring.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PartitionRingReader for StaticPartitionRing {
    fn shuffle_shard(&self, tenant_id: &str, size: usize) -> Result<PartitionRing, RingError> {
        self.snapshot().shuffle_shard(tenant_id, size)
    }
}

fn hash_str(s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037;
    for b in s.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

fn mix64(x: u64) -> u64 {
    let mut x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
