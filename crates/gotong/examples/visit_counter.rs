use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use gotong::prelude::*;
use gotong::telemetry::TelemetryConfig;
use gotong::{GotongError, MemoryStore};
use serde_json::json;

/// A counter that only lives on one node of the cluster at a time.
struct Visits;

#[async_trait]
impl Resource for Visits {
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
        _args: Value,
    ) -> Result<Value, ClusterError> {
        Ok(json!(instance.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn serialize(&self, _id: &str, instance: &Self::Instance) -> Result<Value, ClusterError> {
        Ok(json!({ "start": instance.load(Ordering::SeqCst) }))
    }

    async fn deserialize(
        &self,
        id: &str,
        snapshot: Value,
        _args: Value,
    ) -> Result<Self::Instance, ClusterError> {
        self.create(id, snapshot, None).await
    }
}

async fn start(store: &MemoryStore) -> Result<ClusterNode, GotongError> {
    let resources = ResourceRegistry::builder()
        .register(
            "Visits",
            ResourceDefinition::new(
                Visits,
                CacheOptions::default().with_ttl(Duration::from_secs(30)),
            ),
        )
        .build()?;
    let config = NodeConfig::builder()
        .cluster("demo")
        .store(Arc::new(store.clone()))
        .server(ServerConfig::default())
        .peer(PeerConfig::default())
        .resources(resources)
        .build()?;
    ClusterNode::start(config).await
}

#[tokio::main]
async fn main() -> Result<(), GotongError> {
    TelemetryConfig::builder()
        .service_name("visit-counter")
        .log_level("info,gotong=debug")
        .build()
        .init()?;

    // One in-process store stands in for the shared key/value service.
    let store = MemoryStore::new();
    let nodes = vec![start(&store).await?, start(&store).await?, start(&store).await?];
    tokio::time::sleep(Duration::from_secs(1)).await;

    let value = nodes[0]
        .acquire_resource("home", "Visits", json!({ "start": 10 }), json!({}))
        .await?;
    println!("node {} created home with {value}", nodes[0].id());

    let found = nodes[1]
        .acquire_resource("home", "Visits", json!({}), json!({}))
        .await?;
    println!("node {} found home with {found}", nodes[1].id());

    let owner = nodes[0].id().clone();
    let visits = nodes[2]
        .call_resource(&owner, "home", "Visits", json!({}))
        .await?;
    println!("node {} recorded a visit on {owner}: {visits}", nodes[2].id());

    nodes[0].close().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    for node in &nodes[1..] {
        if let Ok(value) = node.has_resource("home", "Visits", json!({})).await {
            println!("node {} took over home at {value}", node.id());
        }
    }

    for node in &nodes[1..] {
        node.close().await?;
    }
    gotong::telemetry::shutdown_tracing();
    Ok(())
}
