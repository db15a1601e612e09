#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gotong::prelude::*;
use gotong::{LinkState, MemoryStore};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const CLUSTER: &str = "test-cluster";

/// Counts up by `increment` every `period` while cached.
pub struct Ticker {
    pub period: Duration,
    pub created: Arc<AtomicUsize>,
    pub disposed: Arc<AtomicUsize>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            created: Arc::new(AtomicUsize::new(0)),
            disposed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn start(&self, ticks: u64, increment: u64) -> Arc<TickerState> {
        let state = Arc::new(TickerState {
            ticks: AtomicU64::new(ticks),
            increment: AtomicU64::new(increment),
            task: Mutex::new(None),
        });
        let ticking = Arc::clone(&state);
        let period = self.period;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let increment = ticking.increment.load(Ordering::SeqCst);
                ticking.ticks.fetch_add(increment, Ordering::SeqCst);
            }
        });
        *state.task.lock().unwrap() = Some(task);
        state
    }
}

pub struct TickerState {
    ticks: AtomicU64,
    increment: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TickerState {
    fn describe(&self) -> Value {
        json!({
            "ticks": self.ticks.load(Ordering::SeqCst),
            "increment": self.increment.load(Ordering::SeqCst),
        })
    }
}

fn increment_of(args: &Value) -> Option<u64> {
    args.get("increment").and_then(Value::as_u64)
}

#[async_trait]
impl Resource for Ticker {
    type Instance = Arc<TickerState>;

    async fn create(
        &self,
        _id: &str,
        args: Value,
        existing: Option<Self::Instance>,
    ) -> Result<Self::Instance, ClusterError> {
        if let Some(existing) = existing {
            if let Some(increment) = increment_of(&args) {
                existing.increment.store(increment, Ordering::SeqCst);
            }
            return Ok(existing);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.start(0, increment_of(&args).unwrap_or(2)))
    }

    async fn get(
        &self,
        _id: &str,
        instance: &Self::Instance,
        _args: Value,
    ) -> Result<Value, ClusterError> {
        Ok(json!(instance.ticks.load(Ordering::SeqCst)))
    }

    async fn invoke(
        &self,
        _id: &str,
        instance: &Self::Instance,
        _args: Value,
    ) -> Result<Value, ClusterError> {
        Ok(instance.describe())
    }

    fn serialize(&self, _id: &str, instance: &Self::Instance) -> Result<Value, ClusterError> {
        Ok(instance.describe())
    }

    async fn deserialize(
        &self,
        id: &str,
        snapshot: Value,
        _args: Value,
    ) -> Result<Self::Instance, ClusterError> {
        let ticks = snapshot.get("ticks").and_then(Value::as_u64);
        let increment = increment_of(&snapshot);
        match (ticks, increment) {
            (Some(ticks), Some(increment)) => Ok(self.start(ticks, increment)),
            _ => Err(ClusterError::internal(format!("{id}: unreadable ticker snapshot"))),
        }
    }

    fn dispose(&self, _id: &str, instance: Self::Instance) {
        if let Some(task) = instance.task.lock().unwrap().take() {
            task.abort();
        }
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A plain number. `create` is slow to widen races; `invoke` increments,
/// after sleeping `delay_ms` when given.
pub struct Counter {
    pub created: Arc<AtomicUsize>,
}

#[async_trait]
impl Resource for Counter {
    type Instance = Arc<AtomicU64>;

    async fn create(
        &self,
        _id: &str,
        args: Value,
        existing: Option<Self::Instance>,
    ) -> Result<Self::Instance, ClusterError> {
        if let Some(existing) = existing {
            return Ok(existing);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let start = args.get("start").and_then(Value::as_u64).unwrap_or(0);
        Ok(Arc::new(AtomicU64::new(start)))
    }

    async fn get(
        &self,
        _id: &str,
        instance: &Self::Instance,
        _args: Value,
    ) -> Result<Value, ClusterError> {
        Ok(json!(instance.load(Ordering::SeqCst)))
    }

    async fn invoke(
        &self,
        _id: &str,
        instance: &Self::Instance,
        args: Value,
    ) -> Result<Value, ClusterError> {
        if let Some(delay) = args.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(json!(instance.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// Holds its `start` argument; on a `broken` node `get` always fails.
pub struct Fragile {
    pub broken: bool,
}

#[async_trait]
impl Resource for Fragile {
    type Instance = Value;

    async fn create(
        &self,
        _id: &str,
        args: Value,
        existing: Option<Self::Instance>,
    ) -> Result<Self::Instance, ClusterError> {
        Ok(existing.unwrap_or_else(|| args.get("start").cloned().unwrap_or(Value::Null)))
    }

    async fn get(
        &self,
        id: &str,
        instance: &Self::Instance,
        _args: Value,
    ) -> Result<Value, ClusterError> {
        if self.broken {
            return Err(ClusterError::internal(format!("{id}: snapshot unavailable")));
        }
        Ok(instance.clone())
    }
}

pub fn fragile(broken: bool) -> ResourceRegistry {
    ResourceRegistry::builder()
        .register("Fragile", ResourceDefinition::new(Fragile { broken }, CacheOptions::default()))
        .build()
        .unwrap()
}

pub fn fast_peer() -> PeerConfig {
    PeerConfig {
        ping: Duration::from_millis(50),
        timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(5),
    }
}

pub async fn start_node(
    store: &MemoryStore,
    resources: ResourceRegistry,
    port: u16,
) -> ClusterNode {
    let config = NodeConfig::builder()
        .cluster(CLUSTER)
        .store(Arc::new(store.clone()))
        .server(ServerConfig::new("127.0.0.1", port))
        .peer(fast_peer())
        .resources(resources)
        .lock_timeout(Duration::from_secs(5))
        .announce_interval(Duration::from_millis(50))
        .build()
        .expect("valid node config");
    ClusterNode::start(config).await.expect("node starts")
}

/// Starts `size` server nodes sharing one store and waits until every node
/// sees every other node up.
pub async fn start_cluster(
    size: usize,
    resources: impl Fn() -> ResourceRegistry,
) -> (MemoryStore, Vec<ClusterNode>) {
    let store = MemoryStore::new();
    let mut nodes = Vec::with_capacity(size);
    for _ in 0..size {
        nodes.push(start_node(&store, resources(), 0).await);
    }
    for node in &nodes {
        wait_for_up_peers(node, size - 1).await;
    }
    (store, nodes)
}

pub fn up_peers(node: &ClusterNode) -> usize {
    node.peer_ids()
        .iter()
        .filter(|peer| node.peer_state(peer) == Some(LinkState::Up))
        .count()
}

pub async fn wait_for_up_peers(node: &ClusterNode, count: usize) {
    eventually(|| up_peers(node) == count).await;
}

/// Polls `condition` for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn close_all(nodes: &[ClusterNode]) {
    for node in nodes {
        node.close().await.expect("node closes");
    }
}
