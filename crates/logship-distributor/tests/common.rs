//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use logship_distributor::{
    ClientFactory, ClientPool, Dependencies, Distributor, DistributorConfig, DistributorError,
    HashRing, InstanceDesc, NodeClient, Overrides, PushRequest, RateStore, Result, Stream,
    StreamRate, TenantLimits,
};
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static TRACING: Once = Once::new();

/// Install a test tracing subscriber once per binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// How a mock node answers pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    /// Accept every push.
    Ok,
    /// Reject every push.
    Fail,
    /// Never answer within any reasonable timeout.
    Hang,
    /// Reject every push after a delay.
    FailAfter(Duration),
}

/// In-memory node recording the streams it accepted.
pub struct MockNode {
    addr: String,
    mode: Mutex<NodeMode>,
    pushed: Mutex<Vec<Stream>>,
}

impl MockNode {
    pub fn new(addr: &str, mode: NodeMode) -> Self {
        Self {
            addr: addr.to_string(),
            mode: Mutex::new(mode),
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: NodeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn pushed(&self) -> Vec<Stream> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn entry_count(&self) -> usize {
        self.pushed().iter().map(|s| s.entries.len()).sum()
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn push(&self, req: PushRequest) -> Result<()> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            NodeMode::Ok => {
                self.pushed.lock().unwrap().extend(req.streams);
                Ok(())
            }
            NodeMode::Fail => Err(DistributorError::NodePush {
                addr: self.addr.clone(),
                msg: "node refused the push".to_string(),
            }),
            NodeMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            NodeMode::FailAfter(delay) => {
                tokio::time::sleep(delay).await;
                Err(DistributorError::NodePush {
                    addr: self.addr.clone(),
                    msg: "node failed late".to_string(),
                })
            }
        }
    }

    async fn stream_rates(&self) -> Result<Vec<StreamRate>> {
        Ok(Vec::new())
    }
}

/// Factory handing out the mock node registered for each address.
#[derive(Default)]
pub struct MockFactory {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockFactory {
    pub fn add(&self, node: Arc<MockNode>) {
        self.nodes.lock().unwrap().insert(node.addr.clone(), node);
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, addr: &str) -> Result<Arc<dyn NodeClient>> {
        self.nodes
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .map(|n| n as Arc<dyn NodeClient>)
            .ok_or_else(|| DistributorError::NodePush {
                addr: addr.to_string(),
                msg: "unknown node".to_string(),
            })
    }
}

/// Rate store reporting the same rate for every stream.
pub struct FixedRate {
    pub rate: i64,
    pub push_rate: f64,
}

impl RateStore for FixedRate {
    fn rate_for(&self, _tenant_id: &str, _stream_hash: u64) -> (i64, f64) {
        (self.rate, self.push_rate)
    }
}

/// An in-process cluster: a ring of mock nodes behind one distributor.
pub struct TestCluster {
    pub nodes: Vec<Arc<MockNode>>,
    pub ring: Arc<HashRing>,
    pub clients: Arc<ClientPool>,
    pub overrides: Arc<Overrides>,
}

impl TestCluster {
    /// `node_count` healthy nodes with the given replication factor.
    pub fn new(node_count: usize, replication_factor: usize, limits: TenantLimits) -> Self {
        init_tracing();
        let factory = Arc::new(MockFactory::default());
        let ring = Arc::new(HashRing::new(replication_factor));
        let nodes = (0..node_count)
            .map(|i| {
                let addr = format!("node-{i}:9095");
                let node = Arc::new(MockNode::new(&addr, NodeMode::Ok));
                factory.add(node.clone());
                ring.add_instance(InstanceDesc::new(format!("node-{i}"), addr));
                node
            })
            .collect();
        Self {
            nodes,
            ring,
            clients: Arc::new(ClientPool::new(factory)),
            overrides: Arc::new(Overrides::new(limits)),
        }
    }

    /// Dependencies with a rate store that never triggers sharding.
    pub fn dependencies(&self) -> Dependencies {
        let mut deps = Dependencies::new(
            self.overrides.clone(),
            self.ring.clone(),
            self.clients.clone(),
        );
        deps.rate_store = Some(Arc::new(FixedRate {
            rate: 0,
            push_rate: 0.0,
        }));
        deps
    }

    /// A started distributor with a short remote timeout.
    pub fn distributor(&self) -> Distributor {
        self.distributor_with(fast_config(), self.dependencies())
    }

    pub fn distributor_with(&self, config: DistributorConfig, deps: Dependencies) -> Distributor {
        let d = Distributor::new(config, deps, &Registry::new()).unwrap();
        d.start().unwrap();
        d
    }

    pub fn total_entries(&self) -> usize {
        self.nodes.iter().map(|n| n.entry_count()).sum()
    }
}

/// Config with few workers and a 200ms remote timeout.
pub fn fast_config() -> DistributorConfig {
    DistributorConfig {
        push_worker_count: 4,
        remote_timeout_ms: 200,
        ..Default::default()
    }
}

/// Current Unix time in nanoseconds.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}
