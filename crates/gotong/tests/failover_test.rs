mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use common::*;
use gotong::prelude::*;
use gotong::{LinkState, MemoryStore};
use serde_json::json;
use tokio::time::Instant;

fn counters(created: &Arc<AtomicUsize>) -> ResourceRegistry {
    let counter = Counter {
        created: Arc::clone(created),
    };
    ResourceRegistry::builder()
        .register("Counter", ResourceDefinition::new(counter, CacheOptions::default()))
        .build()
        .unwrap()
}

fn tickers() -> ResourceRegistry {
    ResourceRegistry::builder()
        .register(
            "Ticker",
            ResourceDefinition::new(
                Ticker::new(Duration::from_millis(100)),
                CacheOptions::default(),
            ),
        )
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redirect_fails_when_owner_goes_down() {
    let created = Arc::new(AtomicUsize::new(0));
    let (_store, mut nodes) = start_cluster(2, || counters(&created)).await;
    nodes[0]
        .acquire_resource("a", "Counter", json!({}), json!({}))
        .await
        .unwrap();

    let owner = Arc::new(nodes.remove(0));
    let caller = nodes.remove(0);
    let owner_id = owner.id().clone();

    let closing = {
        let owner = Arc::clone(&owner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            owner.close().await
        })
    };

    let started = Instant::now();
    let err = caller
        .redirect_request(&owner_id, "a", "Counter", json!({ "delay_ms": 3000 }))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Uninitialized(_)));
    assert!(started.elapsed() < Duration::from_secs(2));

    closing.await.unwrap().unwrap();
    // The peer is kept, only marked down.
    assert_eq!(caller.peer_ids(), vec![owner_id.clone()]);
    assert_eq!(caller.peer_state(&owner_id), Some(LinkState::Down));
    caller.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_survivor_reclaims_resources_of_dead_peer() {
    let (_store, mut nodes) = start_cluster(3, tickers).await;
    nodes[0]
        .acquire_resource("a", "Ticker", json!({ "increment": 3 }), json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    // Re-publish so the snapshot carries some ticks.
    nodes[0]
        .create_resource("a", "Ticker", json!({ "increment": 3 }))
        .await
        .unwrap();
    let published = nodes[0].invoke("a", "Ticker", json!({})).await.unwrap();
    assert!(published["ticks"].as_u64().unwrap() >= 3);

    let dead = nodes.remove(0);
    dead.close().await.unwrap();

    let mut holder = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while holder.is_none() {
        assert!(Instant::now() < deadline, "nobody reclaimed the resource");
        for (index, node) in nodes.iter().enumerate() {
            if node.has_resource("a", "Ticker", json!({})).await.is_ok() {
                holder = Some(index);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let holder = holder.unwrap();
    let other = 1 - holder;

    let state = nodes[holder].invoke("a", "Ticker", json!({})).await.unwrap();
    assert_eq!(state["increment"], json!(3));
    assert!(state["ticks"].as_u64().unwrap() >= 3);
    assert!(
        nodes[other]
            .has_resource("a", "Ticker", json!({}))
            .await
            .is_err()
    );

    // Survivors acquire the reclaimed copy instead of creating one.
    let acquired = nodes[other]
        .acquire_resource("a", "Ticker", json!({}), json!({}))
        .await
        .unwrap();
    assert!(acquired.as_u64().unwrap() >= 3);

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scavenge_without_records_is_empty() {
    let (_store, nodes) = start_cluster(1, tickers).await;
    let report = nodes[0].scavenge(&NodeId::from("127.0.0.1:1")).await;
    assert_eq!(report, gotong::ScavengeReport::default());
    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discovery_and_reconnect() {
    let store = MemoryStore::new();
    let first = start_node(&store, tickers(), 0).await;
    let second = start_node(&store, tickers(), 0).await;
    wait_for_up_peers(&first, 1).await;
    wait_for_up_peers(&second, 1).await;
    eventually(|| first.server_client_count() == Some(1)).await;
    eventually(|| second.server_client_count() == Some(1)).await;

    let second_id = second.id().clone();
    let port = second_id
        .as_str()
        .rsplit(':')
        .next()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap();
    second.close().await.unwrap();
    eventually(|| first.peer_state(&second_id) == Some(LinkState::Down)).await;
    eventually(|| first.server_client_count() == Some(0)).await;

    let revived = start_node(&store, tickers(), port).await;
    assert_eq!(revived.id(), &second_id);
    eventually(|| first.peer_state(&second_id) == Some(LinkState::Up)).await;
    assert_eq!(first.peer_ids(), vec![second_id.clone()]);
    wait_for_up_peers(&revived, 1).await;

    revived.close().await.unwrap();
    first.close().await.unwrap();
}
