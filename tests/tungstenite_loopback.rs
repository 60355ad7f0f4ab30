use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use resilient_ws::StreamClient;
use resilient_ws::core::{ClientConfig, ConnectionState, ErrorCategory, Priority, SendOutcome};
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

/// Websocket server that echoes text and binary messages back.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_backoff(Duration::from_millis(20), Duration::from_millis(100), 2.0)
        .with_jitter(Duration::ZERO, Some(11))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_roundtrip_and_graceful_close() {
    let addr = echo_server().await;
    let client = StreamClient::new(config()).unwrap();
    let mut messages = client.messages();

    client.connect(format!("ws://{addr}/echo")).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();

    let outcome = client.send("ping-1", Priority::Normal).await.unwrap();
    assert_eq!(outcome, SendOutcome::Accepted);
    let echoed = tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("echo received")
        .unwrap();
    assert_eq!(echoed, Bytes::from_static(b"ping-1"));

    client.disconnect(None, None).await.unwrap();
    client
        .wait_for_state(ConnectionState::Disconnected, WAIT)
        .await
        .unwrap();

    let snapshot = client.snapshot().await.unwrap();
    assert!(snapshot.context.connection.last_error.is_none());
    assert_eq!(snapshot.context.metrics.messages_received, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_exhausts_retries() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = StreamClient::new(config().with_max_retries(2)).unwrap();

    client.connect(format!("ws://{addr}/gone")).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    let snapshot = loop {
        let snapshot = client.snapshot().await.unwrap();
        if snapshot.state == ConnectionState::Disconnected
            && snapshot.context.metrics.error_count >= 3
        {
            break snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never gave up: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let error = snapshot.context.connection.last_error.unwrap();
    assert_eq!(error.category, ErrorCategory::Network);
    assert_eq!(error.attempt, 2);
}
