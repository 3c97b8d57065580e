//! End-to-end tests for the broker hub.
//!
//! These start a real server on a random port, connect golem and minion
//! websocket clients and verify the brokerage semantics:
//! - single golem per webstrate (second connect refused with 409)
//! - minion-connected events reach the golem before any data
//! - frames relayed in order through a pairing
//! - disconnect events on either side
//! - golem-not-found when no golem shows up in time

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use golem_herder::broker::{Hub, HubConfig};
use golem_herder::config::Config;
use golem_herder::container;
use golem_herder::daemon::DaemonRegistry;
use golem_herder::ledger::Ledger;
use golem_herder::server::{start_server, HerderState};
use golem_herder::token::TokenManager;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Start a herder on a random port with a throwaway ledger.
async fn start_test_server(hub: HubConfig) -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        port: 0,
        mounts: dir.path().join("mounts"),
        url: "localhost".to_string(),
        webstrates: "webstrates".to_string(),
        proxy: false,
        golem_image: "webstrates/golem".to_string(),
        token_password: None,
        privkey: fixture("key.pem"),
        pubkey: fixture("cert.pem"),
        meter_db: dir.path().join("meter.db"),
    };

    let state = Arc::new(HerderState {
        docker: container::connect().unwrap(),
        hub: Hub::new(hub),
        ledger: Ledger::open(&config.meter_db).unwrap(),
        tokens: TokenManager::new(&config.pubkey, &config.privkey).unwrap(),
        daemons: DaemonRegistry::new(),
        http: reqwest::Client::new(),
        config,
    });

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = start_server(addr, state).await.expect("server start");
    (bound, dir)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_ws(addr: SocketAddr, path: &str) -> WsStream {
    let url = format!("ws://{addr}{path}");
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect");
    stream
}

/// Read the next text frame, with a timeout.
async fn recv_text(stream: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn recv_event(stream: &mut WsStream) -> serde_json::Value {
    serde_json::from_str(&recv_text(stream).await).expect("event json")
}

#[tokio::test]
async fn test_second_golem_connect_conflicts() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let _golem = connect_ws(addr, "/golem/v1/connect/x").await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/golem/v1/connect/x"))
        .await
        .expect_err("second connect must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 409);
        }
        other => panic!("expected HTTP 409, got {other:?}"),
    }
}

#[tokio::test]
async fn test_golem_slot_frees_on_disconnect() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let mut golem = connect_ws(addr, "/golem/v1/connect/x").await;
    golem.close(None).await.unwrap();
    // Give the server a beat to unregister.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _again = connect_ws(addr, "/golem/v1/connect/x").await;
}

#[tokio::test]
async fn test_minion_connected_event_reaches_golem() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let _minion = connect_ws(addr, "/minion/v1/connect/y?type=worker").await;
    let mut golem = connect_ws(addr, "/golem/v1/connect/y").await;

    let event = recv_event(&mut golem).await;
    assert_eq!(event["Event"], "minion-connected");
    assert_eq!(event["Type"], "worker");
    assert!(event["ID"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn test_pairing_relays_frames_in_order() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let mut golem = connect_ws(addr, "/golem/v1/connect/z").await;
    let mut minion = connect_ws(addr, "/minion/v1/connect/z?type=robot").await;

    let event = recv_event(&mut golem).await;
    let minion_id = event["ID"].as_str().unwrap().to_string();

    let mut pairing = connect_ws(addr, &format!("/golem/v1/connect-to/z/{minion_id}")).await;

    // The minion hears about the golem before any data.
    let hello = recv_event(&mut minion).await;
    assert_eq!(hello["Event"], "golem-connected");

    // Golem -> minion, in order.
    for text in ["one", "two", "three"] {
        pairing.send(Message::Text(text.into())).await.unwrap();
    }
    assert_eq!(recv_text(&mut minion).await, "one");
    assert_eq!(recv_text(&mut minion).await, "two");
    assert_eq!(recv_text(&mut minion).await, "three");

    // Minion -> golem.
    minion.send(Message::Text("back".into())).await.unwrap();
    assert_eq!(recv_text(&mut pairing).await, "back");
}

#[tokio::test]
async fn test_pairing_unknown_minion_is_404() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let _golem = connect_ws(addr, "/golem/v1/connect/w").await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/golem/v1/connect-to/w/nope"))
        .await
        .expect_err("pairing with unknown minion must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {other:?}"),
    }
}

#[tokio::test]
async fn test_minion_disconnect_notifies_golem_and_pairing() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let mut golem = connect_ws(addr, "/golem/v1/connect/d").await;
    let mut minion = connect_ws(addr, "/minion/v1/connect/d").await;

    let event = recv_event(&mut golem).await;
    assert_eq!(event["Event"], "minion-connected");
    let minion_id = event["ID"].as_str().unwrap().to_string();

    let mut pairing = connect_ws(addr, &format!("/golem/v1/connect-to/d/{minion_id}")).await;
    // Drain the golem-connected hello on the minion side.
    let hello = recv_event(&mut minion).await;
    assert_eq!(hello["Event"], "golem-connected");

    minion.close(None).await.unwrap();

    let disconnected = recv_event(&mut golem).await;
    assert_eq!(disconnected["Event"], "minion-disconnected");
    assert_eq!(disconnected["ID"], minion_id);

    // The pairing socket hears it too (via the session's from queue).
    let seen = recv_event(&mut pairing).await;
    assert_eq!(seen["Event"], "minion-disconnected");
}

#[tokio::test]
async fn test_minion_without_golem_gets_not_found() {
    // Shorten the wait so the boundary behavior is testable.
    let (addr, _dir) = start_test_server(HubConfig {
        golem_wait_attempts: 3,
        golem_wait_interval: Duration::from_millis(20),
    })
    .await;

    let mut minion = connect_ws(addr, "/minion/v1/connect/lonely").await;
    let event = recv_event(&mut minion).await;
    assert_eq!(event["Event"], "golem-not-found");
    assert_eq!(event["ID"], "lonely");

    // The server closes the socket afterwards.
    let next = timeout(TIMEOUT, minion.next()).await.expect("close in time");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_minion_waits_for_late_golem() {
    let (addr, _dir) = start_test_server(HubConfig::default()).await;

    let minion = connect_ws(addr, "/minion/v1/connect/late?type=worker").await;
    // Golem shows up well within the grace period.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut golem = connect_ws(addr, "/golem/v1/connect/late").await;

    let event = recv_event(&mut golem).await;
    assert_eq!(event["Event"], "minion-connected");
    drop(minion);
}
