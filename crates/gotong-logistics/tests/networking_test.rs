use std::time::Duration;

use gotong_core::{ClusterError, Value};
use gotong_logistics::{
    Frame, LinkOptions, LinkState, MethodTable, PeerLink, RpcListener, TokioTransport, read_frame,
    write_frame,
};
use serde_json::json;

fn fast_link() -> LinkOptions {
    LinkOptions {
        ping: Duration::from_millis(50),
        timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(2),
    }
}

fn echo_methods() -> MethodTable {
    let mut methods = MethodTable::new();
    methods
        .register("echo", |params: Value| async move { Ok(params) })
        .register("slow", |_params: Value| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Value::Null)
        })
        .register("missing", |params: Value| async move {
            Err(ClusterError::not_found(params.to_string()))
        });
    methods
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_networking_echo() {
    let listener = RpcListener::bind("127.0.0.1", 0).await.unwrap();
    let peer = listener.id().clone();
    let server = listener.serve(echo_methods());

    let link = PeerLink::connect(peer, fast_link());
    link.ready().await.expect("Failed to connect");
    let remote = link.request().await.unwrap();

    let reply = remote.invoke("echo", json!({ "hello": "gotong" })).await.unwrap();
    assert_eq!(reply, json!({ "hello": "gotong" }));

    // Errors cross the wire with their kind intact.
    let err = remote.invoke("missing", json!("a")).await.unwrap_err();
    assert!(err.is_not_found());

    let err = remote.invoke("nope", Value::Null).await.unwrap_err();
    assert!(matches!(err, ClusterError::Internal(_)));

    wait_for(|| server.client_count() == 1).await;
    link.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_raw_transport_ping() {
    let listener = RpcListener::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = listener.serve(MethodTable::new());

    let transport = TokioTransport::connect(addr).await.expect("Failed to connect");
    let (mut reader, mut writer) = transport.into_split();
    write_frame(&mut writer, &Frame::Ping { id: 7 }).await.expect("Send failed");
    let reply = read_frame(&mut reader).await.expect("Recv failed");
    assert_eq!(reply, Some(Frame::Pong { id: 7 }));

    server.close().await;
}

#[tokio::test]
async fn test_call_timeout() {
    let listener = RpcListener::bind("127.0.0.1", 0).await.unwrap();
    let peer = listener.id().clone();
    let server = listener.serve(echo_methods());

    let link = PeerLink::connect(peer, fast_link());
    let remote = link.request().await.unwrap();
    let err = remote
        .invoke_within("slow", Value::Null, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Transport(_)));

    link.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_link_goes_down_and_recovers() {
    let listener = RpcListener::bind("127.0.0.1", 0).await.unwrap();
    let peer = listener.id().clone();
    let port = listener.local_addr().unwrap().port();
    let server = listener.serve(echo_methods());

    let link = PeerLink::connect(peer, fast_link());
    link.ready().await.unwrap();
    let mut liveness = link.subscribe();

    server.close().await;
    liveness
        .wait_for(|state| *state == LinkState::Down)
        .await
        .unwrap();
    assert!(link.request_within(Duration::from_millis(50)).await.is_err());

    let listener = RpcListener::bind("127.0.0.1", port).await.unwrap();
    let server = listener.serve(echo_methods());
    let remote = link
        .request_within(Duration::from_secs(2))
        .await
        .expect("link should reconnect");
    assert_eq!(remote.invoke("echo", json!(1)).await.unwrap(), json!(1));

    link.close().await;
    assert_eq!(link.state(), LinkState::Down);
    server.close().await;
}

#[tokio::test]
async fn test_unreachable_peer_is_uninitialized() {
    // Bind and drop to get a port nobody listens on.
    let port = {
        let listener = RpcListener::bind("127.0.0.1", 0).await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let link = PeerLink::connect(format!("127.0.0.1:{port}").as_str().into(), fast_link());
    let err = link.ready().await.unwrap_err();
    assert!(matches!(err, ClusterError::Uninitialized(_)));
    link.close().await;
}
