//! End-to-end tests driving a [`Client`] against a scripted in-memory server.

/// The `testing` module in the crate is only compiled under `test` config,
/// which integration test programs do not see.  Include it by path so both
/// test layers share the same helpers.
#[path = "../src/testing.rs"]
mod test_helpers;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};
use test_helpers::{TestTransport, init_test_logging, setup_test_channel};

use mopidy_ws::{Client, ClientError, ConnectionState, Connector, ErrorCode, Transport};

/// Server-side half of an in-memory connection: read the client's frames,
/// write frames back.  Dropping it hangs up on the client.
struct ServerEnd(TestTransport);

impl ServerEnd {
    /// Next request the client sent, parsed.
    async fn recv_request(&mut self) -> Value {
        let frame = self
            .0
            .receive_message()
            .await
            .unwrap()
            .expect("client hung up");
        serde_json::from_str(&frame).expect("client sent invalid JSON")
    }

    async fn send(&mut self, frame: Value) {
        self.0.send_message(frame.to_string()).await.unwrap();
    }

    async fn reply_result(&mut self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }
}

fn channel_transport() -> (TestTransport, ServerEnd) {
    let (near, far) = setup_test_channel();
    (near, ServerEnd(far))
}

enum DialOutcome {
    Accept(TestTransport),
    Refuse,
}

/// Connector that hands out scripted transports (or dial failures) in order.
struct QueueConnector {
    outcomes: Arc<Mutex<VecDeque<DialOutcome>>>,
}

impl QueueConnector {
    fn new(outcomes: impl IntoIterator<Item = DialOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
        }
    }

    fn accepting(transports: impl IntoIterator<Item = TestTransport>) -> Self {
        Self::new(transports.into_iter().map(DialOutcome::Accept))
    }
}

impl Connector for QueueConnector {
    type Transport = TestTransport;
    type Error = std::io::Error;

    fn target(&self) -> std::borrow::Cow<'static, str> {
        "queue:scripted".into()
    }

    async fn connect(&self) -> Result<Self::Transport, Self::Error> {
        match self.outcomes.lock().unwrap().pop_front() {
            Some(DialOutcome::Accept(transport)) => Ok(transport),
            Some(DialOutcome::Refuse) | None => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted dial refusal",
            )),
        }
    }
}

fn scripted_client(connector: QueueConnector) -> Client {
    Client::builder("ws://scripted.invalid/mopidy/ws")
        .connector(connector)
        .retry_delay(Duration::ZERO)
        .build()
}

#[tokio::test]
async fn play_sends_the_wire_format_and_returns_unit() -> anyhow::Result<()> {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));
    client.connect().await?;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.playback().play().await }
    });

    let request = server.recv_request().await;
    assert_eq!(request["jsonrpc"], json!("2.0"));
    assert_eq!(request["method"], json!("core.playback.play"));
    assert_eq!(request["params"], json!({}));
    assert!(request["id"].is_u64());

    server.reply_result(&request["id"], Value::Null).await;
    call.await??;
    Ok(())
}

#[tokio::test]
async fn replies_correlate_by_id_regardless_of_arrival_order() -> anyhow::Result<()> {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));
    client.connect().await?;

    let calls = ["core.a", "core.b", "core.c"].map(|method| {
        let client = client.clone();
        tokio::spawn(async move { client.call::<String>(method).await })
    });

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.recv_request().await);
    }

    // Answer in reverse order, each reply naming the method it answers.
    for request in requests.iter().rev() {
        server
            .reply_result(&request["id"], request["method"].clone())
            .await;
    }

    let [a, b, c] = calls;
    assert_eq!(a.await??, "core.a");
    assert_eq!(b.await??, "core.b");
    assert_eq!(c.await??, "core.c");
    Ok(())
}

#[tokio::test]
async fn request_ids_never_collide_across_client_instances() {
    init_test_logging();

    let mut observed_ids = Vec::new();
    for _ in 0..2 {
        let (transport, mut server) = channel_transport();
        let client = scripted_client(QueueConnector::accepting([transport]));
        client.connect().await.unwrap();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.playback().stop().await }
        });
        let request = server.recv_request().await;
        observed_ids.push(request["id"].as_u64().unwrap());
        server.reply_result(&request["id"], Value::Null).await;
        call.await.unwrap().unwrap();
    }

    assert!(observed_ids[0] < observed_ids[1]);
}

#[tokio::test]
async fn reply_with_unknown_id_is_dropped_harmlessly() {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));
    client.connect().await.unwrap();

    // Unsolicited reply that matches no pending request.
    server
        .send(json!({"jsonrpc": "2.0", "id": 999_999_u64, "result": "stray"}))
        .await;

    // The connection keeps working.
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.version().await }
    });
    let request = server.recv_request().await;
    server.reply_result(&request["id"], json!("4.0.0")).await;
    assert_eq!(call.await.unwrap().unwrap(), "4.0.0");
}

#[tokio::test]
async fn remote_error_surfaces_method_code_and_traceback() {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));
    client.connect().await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.mixer().set_volume(150).await }
    });

    let request = server.recv_request().await;
    assert_eq!(request["method"], json!("core.mixer.set_volume"));
    assert_eq!(request["params"], json!({"volume": 150}));
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {
                "code": -32602,
                "message": "Invalid params",
                "data": {"traceback": "Traceback (most recent call last): ..."},
            },
        }))
        .await;

    let error = call.await.unwrap().unwrap_err();
    assert_matches!(error, ClientError::Remote { method, error } => {
        assert_eq!(method, "core.mixer.set_volume");
        assert_eq!(error.code, ErrorCode::InvalidParams);
        assert_eq!(error.message, "Invalid params");
        assert!(error.traceback().unwrap().starts_with("Traceback"));
    });
}

#[tokio::test]
async fn typed_event_handler_fires_exactly_once_per_event() {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = client.on_volume_changed(move |volume| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(volume);
        }
    });

    client.connect().await.unwrap();
    server
        .send(json!({"event": "volume_changed", "volume": 42}))
        .await;

    let volume = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("event was never dispatched")
        .unwrap();
    assert_eq!(volume, 42);

    // A mute event must not reach a volume handler.
    server
        .send(json!({"event": "mute_changed", "mute": true}))
        .await;
    tokio::task::yield_now().await;
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test]
async fn connect_retries_until_a_dial_succeeds() -> anyhow::Result<()> {
    init_test_logging();
    let (transport, _server) = channel_transport();
    let connector = QueueConnector::new([
        DialOutcome::Refuse,
        DialOutcome::Refuse,
        DialOutcome::Accept(transport),
    ]);

    let client = Client::builder("ws://scripted.invalid/mopidy/ws")
        .connector(connector)
        .retries(3)
        .retry_delay(Duration::ZERO)
        .build();

    client.connect().await?;
    assert_eq!(client.state(), ConnectionState::Connected);
    Ok(())
}

#[tokio::test]
async fn connect_fails_after_the_retry_budget_is_spent() {
    init_test_logging();
    let connector = QueueConnector::new([
        DialOutcome::Refuse,
        DialOutcome::Refuse,
        DialOutcome::Refuse,
    ]);

    let client = Client::builder("ws://scripted.invalid/mopidy/ws")
        .connector(connector)
        .retries(3)
        .retry_delay(Duration::ZERO)
        .build();

    let error = client.connect().await.unwrap_err();
    assert_matches!(error, ClientError::Connect { url, attempts: 3, .. } => {
        assert_eq!(url, "queue:scripted");
    });
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn pending_requests_fail_when_the_connection_drops() {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = Client::builder("ws://scripted.invalid/mopidy/ws")
        .connector(QueueConnector::accepting([transport]))
        .auto_reconnect(false)
        .build();
    client.connect().await.unwrap();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.playback().get_state().await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.mixer().get_volume().await }
    });

    // Both requests reach the server, then it hangs up without answering.
    server.recv_request().await;
    server.recv_request().await;
    drop(server);

    assert_matches!(first.await.unwrap(), Err(ClientError::ConnectionLost));
    assert_matches!(second.await.unwrap(), Err(ClientError::ConnectionLost));
}

#[tokio::test]
async fn calls_dial_lazily_when_not_yet_connected() {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));

    // No explicit connect; the call itself dials.
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.playback().play().await }
    });

    let request = server.recv_request().await;
    server.reply_result(&request["id"], Value::Null).await;
    call.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn dropped_connection_is_redialed_automatically() {
    init_test_logging();
    let (first_transport, server_one) = channel_transport();
    let (second_transport, mut server_two) = channel_transport();
    let client =
        scripted_client(QueueConnector::accepting([first_transport, second_transport]));
    client.connect().await.unwrap();

    // First server hangs up; the client reconnects on its own and the next
    // call lands on the replacement connection.
    drop(server_one);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.version().await }
    });
    let request = server_two.recv_request().await;
    server_two.reply_result(&request["id"], json!("4.0.0")).await;
    assert_eq!(call.await.unwrap().unwrap(), "4.0.0");
}

#[tokio::test]
async fn disconnect_is_deliberate_and_sticks() {
    init_test_logging();
    let (transport, _server) = channel_transport();
    let client = Client::builder("ws://scripted.invalid/mopidy/ws")
        .connector(QueueConnector::accepting([transport]))
        .auto_reconnect(false)
        .build();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // With auto-reconnect off, calls fail fast instead of dialing.
    let error = client.playback().play().await.unwrap_err();
    assert_matches!(error, ClientError::NotConnected);
}

#[tokio::test]
async fn unanswered_calls_time_out_when_configured() {
    init_test_logging();
    let (transport, mut server) = channel_transport();
    let client = Client::builder("ws://scripted.invalid/mopidy/ws")
        .connector(QueueConnector::accepting([transport]))
        .request_timeout(Duration::from_millis(50))
        .build();
    client.connect().await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.playback().get_state().await }
    });

    // Swallow the request and never answer it.
    let request = server.recv_request().await;
    let error = call.await.unwrap().unwrap_err();
    assert_matches!(error, ClientError::RequestTimeout { method, .. } => {
        assert_eq!(method, "core.playback.get_state");
    });

    // The late reply's caller is gone; the connection shrugs and moves on.
    server.reply_result(&request["id"], json!("playing")).await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.version().await }
    });
    let request = server.recv_request().await;
    server.reply_result(&request["id"], json!("4.0.0")).await;
    assert_eq!(call.await.unwrap().unwrap(), "4.0.0");
}

#[tokio::test]
async fn shutdown_stops_the_event_loop_cleanly() -> anyhow::Result<()> {
    init_test_logging();
    let (transport, _server) = channel_transport();
    let client = scripted_client(QueueConnector::accepting([transport]));
    client.connect().await?;

    client.shutdown().await?;
    Ok(())
}
