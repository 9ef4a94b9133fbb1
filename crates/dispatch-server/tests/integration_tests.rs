//! End-to-end tests over real WebSocket connections.
//!
//! Each test boots the full app on an ephemeral port, connects real clients
//! with signed tokens, and observes fan-out behavior from the client side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use dispatch_core::auth::{self, TokenClaims};
use dispatch_core::{EventConfig, StepConfig};
use dispatch_server::config::{LimitMode, Settings};
use dispatch_server::server::{App, ShutdownHandle};
use dispatch_server::ServerError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn step(name: &str, params: &[&str]) -> StepConfig {
    StepConfig {
        name: name.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
    }
}

fn event(modifiers: Vec<StepConfig>, actions: Vec<StepConfig>) -> EventConfig {
    EventConfig { modifiers, actions }
}

fn test_settings(events: HashMap<String, EventConfig>) -> Settings {
    let mut settings = Settings::default();
    settings.server.address = "127.0.0.1:0".to_string();
    settings.server.auth.jwt_secret = SECRET.to_string();
    settings.events = events;
    settings
}

async fn start_app(
    settings: Settings,
) -> (SocketAddr, ShutdownHandle, JoinHandle<Result<(), ServerError>>) {
    let mut app = App::new(settings).expect("app construction");
    let addr = app.bind().await.expect("bind ephemeral port");
    let handle = app.shutdown_handle();
    let task = tokio::spawn(app.run());
    (addr, handle, task)
}

fn token_for(user: &str) -> String {
    auth::sign(&TokenClaims::new(user), SECRET.as_bytes())
}

async fn connect(addr: SocketAddr, user: &str) -> WsClient {
    try_connect(addr, user).await.expect("websocket connect")
}

async fn try_connect(addr: SocketAddr, user: &str) -> Result<WsClient, WsError> {
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token_for(user)).parse().expect("header value"),
    );
    let (client, _response) = connect_async(request).await?;
    Ok(client)
}

async fn send_frame(client: &mut WsClient, target: &str, event: &str, payload: Value) {
    let frame = serde_json::json!({
        "target": target,
        "event": event,
        "payload": payload,
    });
    client
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send frame");
}

/// Waits for the next text frame and returns its `(event, payload)` pair.
async fn recv_event(client: &mut WsClient) -> (String, Value) {
    let deadline = Duration::from_secs(2);
    loop {
        let message = timeout(deadline, client.next())
            .await
            .expect("timed out waiting for server frame")
            .expect("stream ended while waiting for server frame")
            .expect("websocket error while waiting for server frame");
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).expect("server frame is JSON");
            return (
                frame["event"].as_str().expect("event field").to_string(),
                frame["payload"].clone(),
            );
        }
    }
}

/// Asserts no text frame arrives within `window`.
async fn expect_silence(client: &mut WsClient, window: Duration) {
    let result = timeout(window, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => futures_util::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(text) = result {
        panic!("expected silence but received frame: {text}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_and_broadcast() {
    let events = HashMap::from([
        (
            "join".to_string(),
            event(
                vec![],
                vec![
                    step("_join", &["{$user.id}", "{$target.id}"]),
                    step("_notify_origin", &["joined", "{}"]),
                ],
            ),
        ),
        (
            "msg".to_string(),
            event(vec![], vec![step("_notify_room", &["message", "{.payload}"])]),
        ),
    ]);
    let (addr, shutdown, _task) = start_app(test_settings(events)).await;

    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;

    send_frame(&mut alice, "room1", "join", serde_json::json!({})).await;
    assert_eq!(recv_event(&mut alice).await.0, "joined");
    send_frame(&mut bob, "room1", "join", serde_json::json!({})).await;
    assert_eq!(recv_event(&mut bob).await.0, "joined");

    send_frame(&mut alice, "room1", "msg", serde_json::json!({"text": "hi"})).await;

    let (event_name, payload) = recv_event(&mut alice).await;
    assert_eq!(event_name, "message");
    assert_eq!(payload, serde_json::json!({"text": "hi"}));

    let (event_name, payload) = recv_event(&mut bob).await;
    assert_eq!(event_name, "message");
    assert_eq!(payload, serde_json::json!({"text": "hi"}));

    // Exactly once per socket.
    expect_silence(&mut alice, Duration::from_millis(200)).await;
    expect_silence(&mut bob, Duration::from_millis(200)).await;

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_secure_gate() {
    let events = HashMap::from([(
        "admin".to_string(),
        event(
            vec![step("secure", &[])],
            vec![step("_notify_origin", &["admin_ok", "{}"])],
        ),
    )]);
    let (addr, shutdown, _task) = start_app(test_settings(events)).await;

    let mut alice = connect(addr, "alice").await;

    // No token in the payload: the pipeline is vetoed with no side effects.
    send_frame(&mut alice, "room1", "admin", serde_json::json!({})).await;
    expect_silence(&mut alice, Duration::from_millis(300)).await;

    let payload = serde_json::json!({ "token": token_for("alice") });
    send_frame(&mut alice, "room1", "admin", payload).await;
    assert_eq!(recv_event(&mut alice).await.0, "admin_ok");

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rate_limit_boundary() {
    let events = HashMap::from([(
        "ping".to_string(),
        event(
            vec![step("rate_limit", &["3/s"])],
            vec![step("_notify_origin", &["pong", "{}"])],
        ),
    )]);
    let (addr, shutdown, _task) = start_app(test_settings(events)).await;

    let mut alice = connect(addr, "alice").await;

    for _ in 0..4 {
        send_frame(&mut alice, "room1", "ping", serde_json::json!({})).await;
    }
    for _ in 0..3 {
        assert_eq!(recv_event(&mut alice).await.0, "pong");
    }
    // The fourth message was over the limit.
    expect_silence(&mut alice, Duration::from_millis(300)).await;

    // After the window expires the counter resets.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    send_frame(&mut alice, "room1", "ping", serde_json::json!({})).await;
    assert_eq!(recv_event(&mut alice).await.0, "pong");

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_targeted_dm_deduplicates_sockets() {
    let events = HashMap::from([(
        "dm".to_string(),
        event(vec![], vec![step("_notify_room", &["dm", "{.payload}"])]),
    )]);
    let (addr, shutdown, _task) = start_app(test_settings(events)).await;

    let mut bob_first = connect(addr, "bob").await;
    let mut bob_second = connect(addr, "bob").await;
    let mut alice = connect(addr, "alice").await;

    send_frame(&mut alice, "user:bob", "dm", serde_json::json!({"text": "hi"})).await;

    for bob in [&mut bob_first, &mut bob_second] {
        let (event_name, payload) = recv_event(bob).await;
        assert_eq!(event_name, "dm");
        assert_eq!(payload, serde_json::json!({"text": "hi"}));
    }
    expect_silence(&mut bob_first, Duration::from_millis(200)).await;
    expect_silence(&mut bob_second, Duration::from_millis(200)).await;
    expect_silence(&mut alice, Duration::from_millis(200)).await;

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_cycling() {
    let events = HashMap::from([(
        "ping".to_string(),
        event(vec![], vec![step("_notify_origin", &["pong", "{}"])]),
    )]);
    let mut settings = test_settings(events);
    settings.server.connection_limit.max_per_user = 1;
    settings.server.connection_limit.mode = LimitMode::Cycle;
    let (addr, shutdown, _task) = start_app(settings).await;

    let mut carol_first = connect(addr, "carol").await;
    let mut carol_second = connect(addr, "carol").await;

    // The first socket is displaced: it sees a close frame or end-of-stream.
    let displaced = timeout(Duration::from_secs(2), async {
        loop {
            match carol_first.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(displaced.is_ok(), "first socket was not closed by cycling");

    // The replacement socket is live.
    send_frame(&mut carol_second, "room1", "ping", serde_json::json!({})).await;
    assert_eq!(recv_event(&mut carol_second).await.0, "pong");

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_limit_reject_mode() {
    let mut settings = test_settings(HashMap::new());
    settings.server.connection_limit.max_per_user = 1;
    settings.server.connection_limit.mode = LimitMode::Reject;
    let (addr, shutdown, _task) = start_app(settings).await;

    let _carol_first = connect(addr, "carol").await;
    match try_connect(addr, "carol").await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 429),
        other => panic!("expected HTTP 429 rejection, got {other:?}"),
    }

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_token_is_rejected() {
    let (addr, shutdown, _task) = start_app(test_settings(HashMap::new())).await;

    let request = format!("ws://{addr}/ws")
        .into_client_request()
        .expect("client request");
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }

    shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_shutdown_closes_sockets() {
    let (addr, shutdown, task) = start_app(test_settings(HashMap::new())).await;

    let mut alice = connect(addr, "alice").await;
    shutdown.shutdown();

    // The client sees a close frame (or end of stream) promptly.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match alice.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client socket was not closed on shutdown");

    // And the server task itself drains cleanly.
    let run_result = timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop in time")
        .expect("server task panicked");
    assert!(run_result.is_ok());
}
