use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use resilient_ws::StreamClient;
use resilient_ws::core::{
    ClientConfig, ConnectionState, ErrorCause, Priority, RejectReason, SendOutcome, StreamError,
};
use resilient_ws::machine::StateChange;
use resilient_ws::testing::{MockServer, MockTransport};

const URL: &str = "ws://mock.test/feed";
const WAIT: Duration = Duration::from_secs(2);

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100), 2.0)
        .with_jitter(Duration::ZERO, Some(3))
}

fn spawn(auto_open: bool) -> (StreamClient<MockTransport>, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    server.set_auto_open(auto_open);
    let client = StreamClient::spawn(config(), transport).unwrap();
    (client, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_send_and_receive() {
    let (client, server) = spawn(true);
    let mut messages = client.messages();

    let state = client.connect(URL).await.unwrap();
    assert_eq!(state, ConnectionState::Connecting);
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();
    assert!(client.is_connected());

    let id = server.latest().unwrap();
    assert_eq!(server.url(id).as_deref(), Some(URL));

    let outcome = client.send("hello", Priority::Normal).await.unwrap();
    assert_eq!(outcome, SendOutcome::Accepted);
    assert_eq!(server.sent(id), vec![Bytes::from_static(b"hello")]);

    server.message(id, "tick");
    let received = tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("message delivered")
        .unwrap();
    assert_eq!(received, Bytes::from_static(b"tick"));

    let metrics = client.metrics().await.unwrap();
    assert_eq!(metrics.messages_sent, 1);
    assert_eq!(metrics.messages_received, 1);
    assert_eq!(
        client.recent_messages().await.unwrap(),
        vec![Bytes::from_static(b"tick")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_with_protocols_forwards_them() {
    let (client, server) = spawn(true);
    client
        .connect_with_protocols(URL, ["feed.v2", "feed.v1"])
        .await
        .unwrap();
    let id = server.wait_for_connections(1, WAIT).await.unwrap();
    assert_eq!(
        server.protocols(id),
        vec!["feed.v2".to_string(), "feed.v1".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_url_is_rejected_before_the_machine() {
    let (client, server) = spawn(true);

    let err = client.connect("http://mock.test/feed").await.unwrap_err();
    assert!(matches!(err, StreamError::Configuration(_)), "{err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(server.connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_connect_reports_invalid_state() {
    let (client, _server) = spawn(true);
    client.connect(URL).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();

    let err = client.connect(URL).await.unwrap_err();
    assert!(matches!(err, StreamError::InvalidState(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_a_transport_failure() {
    let (client, server) = spawn(true);
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    client
        .subscribe(move |change: &StateChange| {
            if change.is_state_change() {
                sink.lock().unwrap().push((change.from, change.to));
            }
        })
        .await
        .unwrap();

    client.connect(URL).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();
    let first = server.latest().unwrap();

    server.fail(first, ErrorCause::network("connection reset by peer"));
    server.wait_for_connections(2, WAIT).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();

    assert!(server.terminated(first));
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.context.metrics.reconnect_attempts, 0);
    assert_eq!(snapshot.context.metrics.error_count, 1);

    let seen = transitions.lock().unwrap().clone();
    assert!(seen.contains(&(ConnectionState::Connected, ConnectionState::Reconnecting)));
    assert!(seen.contains(&(ConnectionState::Reconnecting, ConnectionState::Connecting)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_sent_while_connecting_are_delivered_after_open() {
    let (client, server) = spawn(false);
    client.connect(URL).await.unwrap();

    for payload in ["a", "b", "c"] {
        let outcome = client.send(payload, Priority::Normal).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
    }
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connecting);
    assert_eq!(snapshot.queued, 3);

    let id = server.latest().unwrap();
    server.open(id);
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();
    assert_eq!(
        server.sent(id),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_disconnect_waits_for_the_peer() {
    let (client, server) = spawn(true);
    client.connect(URL).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();
    let id = server.latest().unwrap();

    let state = client
        .disconnect(Some(1000), Some("done".to_string()))
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Disconnecting);
    assert_eq!(server.close_request(id), Some((1000, "done".to_string())));

    server.close(id, 1000, "done", true);
    client
        .wait_for_state(ConnectionState::Disconnected, WAIT)
        .await
        .unwrap();
    assert!(server.released(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_and_clear_discards_held_messages() {
    let (client, _server) = spawn(false);
    client.connect(URL).await.unwrap();
    client.send("stale", Priority::Normal).await.unwrap();

    let state = client.disconnect_and_clear().await.unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(client.snapshot().await.unwrap().queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_is_idempotent() {
    let (client, server) = spawn(true);
    client.connect(URL).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();
    let id = server.latest().unwrap();

    client.terminate(Some("shutdown".to_string())).await.unwrap();
    client.terminate(None).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Terminated);
    assert!(server.terminated(id));

    let outcome = client.send("late", Priority::High).await.unwrap();
    assert_eq!(outcome, SendOutcome::Rejected(RejectReason::Terminated));
    assert!(matches!(
        client.connect(URL).await,
        Err(StreamError::Terminated)
    ));
    assert!(matches!(
        client.disconnect(None, None).await,
        Err(StreamError::Terminated)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_last_handle_releases_the_connection() {
    let (client, server) = spawn(true);
    client.connect(URL).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();
    let id = server.latest().unwrap();

    drop(client);

    let deadline = tokio::time::Instant::now() + WAIT;
    while !server.released(id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection was not released after the client was dropped"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_is_rejected_at_spawn() {
    let (transport, _server) = MockTransport::channel_pair();
    let config = ClientConfig::default().with_backoff(
        Duration::from_secs(10),
        Duration::from_secs(1),
        2.0,
    );
    assert!(matches!(
        StreamClient::spawn(config, transport),
        Err(StreamError::Configuration(_))
    ));
}
