//! End-to-end tests for the `/ws` notification channel.
//!
//! These tests run the real router on a random port and verify that:
//! - Subscribers receive a `beer_comment` frame when a comment is created
//! - Every open subscriber receives exactly one frame per event
//! - Malformed client frames are tolerated unless a limit is configured
//! - Closed sockets are removed from the connection registry

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use beerapi_server::auth::{PasswordConfig, PasswordHasher};
use beerapi_server::config::Config;
use beerapi_server::connection::ConnectionSettings;
use beerapi_server::routes::{create_router, AppState};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Spawns a test server on a random available port.
/// Returns the socket address and a handle to abort the server.
async fn spawn_test_server(
    settings: ConnectionSettings,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    // Bind first so links can carry the real address
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        secret_key: "notifications-test-secret".to_string(),
        port: addr.port(),
        url_prefix: "/api/v1".to_string(),
        base_url: format!("http://{addr}"),
        connection: settings,
    };
    let state = AppState::new(config)
        .with_password_hasher(PasswordHasher::new(PasswordConfig::fast()));
    let app = create_router(state);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(10)).await;

    (addr, handle)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

/// Polls `/health` until the server reports `expected` open websockets.
async fn wait_for_connections(addr: SocketAddr, expected: u64) {
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/health");

    timeout(RECV_TIMEOUT, async {
        loop {
            let health: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
            if health["connections"] == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("server never reported {expected} connections"));
}

/// Receives the next text frame and parses it as JSON.
async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Asserts that no text frame arrives within a short window.
async fn assert_silent(ws: &mut WsClient) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("unexpected frame: {}", text.as_str());
    }
}

/// Waits until the server ends the stream with a close frame or by dropping it.
async fn wait_closed(ws: &mut WsClient) {
    let closed = timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server never closed the connection");
}

/// Fixture data created through the REST API.
struct Fixture {
    user_id: String,
    token: String,
    beer_id: String,
}

async fn create_fixture(addr: SocketAddr) -> Fixture {
    let client = reqwest::Client::new();
    let api = format!("http://{addr}/api/v1");

    let user: Value = client
        .post(format!("{api}/user"))
        .json(&json!({"username": "JoDo", "firstname": "John", "lastname": "Doe", "password": "secret"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let user_id = user["data"]["id"].as_str().unwrap().to_string();

    let login: Value = client
        .post(format!("{api}/user/login"))
        .json(&json!({"username": "JoDo", "password": "secret"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = login["data"]["attributes"]["access_token"]
        .as_str()
        .unwrap()
        .to_string();

    let brewery: Value = client
        .post(format!("{api}/brewery"))
        .bearer_auth(&token)
        .json(&json!({"name": "BrewDog", "owner": "James Watt", "location": "Ellon"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let beer: Value = client
        .post(format!("{api}/beer"))
        .bearer_auth(&token)
        .json(&json!({
            "name": "Punk IPA",
            "breweryId": brewery["data"]["id"],
            "alcoholLevel": 5,
            "picture": "punk.png"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let beer_id = beer["data"]["id"].as_str().unwrap().to_string();

    Fixture {
        user_id,
        token,
        beer_id,
    }
}

async fn post_comment(addr: SocketAddr, fixture: &Fixture, body: &str) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(format!(
            "http://{addr}/api/v1/beer/{}/comments",
            fixture.beer_id
        ))
        .bearer_auth(&fixture.token)
        .json(&json!({"body": body}))
        .send()
        .await
        .unwrap()
        .status()
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn comment_is_pushed_to_subscriber() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;
    let fixture = create_fixture(addr).await;

    let mut ws = connect(addr).await;
    wait_for_connections(addr, 1).await;

    assert_eq!(post_comment(addr, &fixture, "Lovely").await, 201);

    let frame = next_json(&mut ws).await;
    assert_eq!(
        frame,
        json!({"action": "beer_comment", "user": fixture.user_id, "beer": fixture.beer_id})
    );

    server.abort();
}

#[tokio::test]
async fn every_subscriber_receives_one_frame() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;
    let fixture = create_fixture(addr).await;

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    let mut third = connect(addr).await;
    wait_for_connections(addr, 3).await;

    assert_eq!(post_comment(addr, &fixture, "Lovely").await, 201);

    for ws in [&mut first, &mut second, &mut third] {
        let frame = next_json(ws).await;
        assert_eq!(frame["action"], "beer_comment");
        assert_eq!(frame["beer"], fixture.beer_id.as_str());
        assert_silent(ws).await;
    }

    server.abort();
}

#[tokio::test]
async fn frames_arrive_in_emission_order() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;
    let fixture = create_fixture(addr).await;

    let mut ws = connect(addr).await;
    wait_for_connections(addr, 1).await;

    for body in ["first", "second", "third"] {
        assert_eq!(post_comment(addr, &fixture, body).await, 201);
    }

    for _ in 0..3 {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["user"], fixture.user_id.as_str());
    }

    server.abort();
}

#[tokio::test]
async fn rejected_comment_sends_nothing() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;
    let fixture = create_fixture(addr).await;

    let mut ws = connect(addr).await;
    wait_for_connections(addr, 1).await;

    // Missing body fails validation before anything is stored.
    let status = reqwest::Client::new()
        .post(format!(
            "http://{addr}/api/v1/beer/{}/comments",
            fixture.beer_id
        ))
        .bearer_auth(&fixture.token)
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 400);

    assert_silent(&mut ws).await;

    server.abort();
}

#[tokio::test]
async fn no_subscribers_does_not_fail_the_request() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;
    let fixture = create_fixture(addr).await;

    assert_eq!(post_comment(addr, &fixture, "Nobody listening").await, 201);

    server.abort();
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn malformed_frames_are_tolerated_by_default() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;
    let fixture = create_fixture(addr).await;

    let mut ws = connect(addr).await;
    wait_for_connections(addr, 1).await;

    for _ in 0..5 {
        ws.send(Message::Text("not json".into())).await.unwrap();
    }
    ws.send(Message::Text(r#"{"hello":"server"}"#.into()))
        .await
        .unwrap();

    assert_eq!(post_comment(addr, &fixture, "Still here").await, 201);
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["action"], "beer_comment");

    wait_for_connections(addr, 1).await;

    server.abort();
}

#[tokio::test]
async fn malformed_frame_limit_closes_connection() {
    let settings = ConnectionSettings {
        max_malformed_frames: 2,
        ..ConnectionSettings::default()
    };
    let (addr, server) = spawn_test_server(settings).await;

    let mut ws = connect(addr).await;
    wait_for_connections(addr, 1).await;

    ws.send(Message::Text("{".into())).await.unwrap();
    ws.send(Message::Text("}".into())).await.unwrap();

    wait_closed(&mut ws).await;
    wait_for_connections(addr, 0).await;

    server.abort();
}

#[tokio::test]
async fn client_close_unregisters_connection() {
    let (addr, server) = spawn_test_server(ConnectionSettings::default()).await;

    let mut first = connect(addr).await;
    let _second = connect(addr).await;
    wait_for_connections(addr, 2).await;

    first.close(None).await.unwrap();
    wait_for_connections(addr, 1).await;

    server.abort();
}

#[tokio::test]
async fn idle_timeout_closes_silent_connection() {
    let settings = ConnectionSettings {
        idle_timeout: Some(Duration::from_millis(100)),
        ..ConnectionSettings::default()
    };
    let (addr, server) = spawn_test_server(settings).await;

    let mut ws = connect(addr).await;
    wait_closed(&mut ws).await;
    wait_for_connections(addr, 0).await;

    server.abort();
}
