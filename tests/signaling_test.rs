//! Signaling broker behavior over real WebSockets: welcome/offer flow,
//! capacity rejection, protocol tolerance, and the bitrate hint path.

use crabstream::config::AppConfig;
use crabstream::signaling::SignalingBroker;
use crabstream::webrtc::PeerRegistry;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(max_peers: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.signaling_port = free_port();
    config.webrtc.max_peers = max_peers;
    // Keep ICE local so tests need no network
    config.webrtc.stun_server = String::new();
    config
}

async fn start_stack(config: &AppConfig) -> (Arc<PeerRegistry>, Arc<SignalingBroker>) {
    let registry = Arc::new(PeerRegistry::new(config.webrtc.clone()));
    registry.start();
    let broker = SignalingBroker::new(config.clone(), Arc::clone(&registry));
    broker.start().await.expect("broker binds");
    (registry, broker)
}

async fn connect(port: u16) -> WsStream {
    let (ws, _) = tokio::time::timeout(
        Duration::from_secs(5),
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}", port)),
    )
    .await
    .expect("connect timeout")
    .expect("connect");
    ws
}

/// Next text frame parsed as JSON, skipping non-text frames
async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("recv timeout")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("valid JSON from server");
        }
    }
}

/// Read envelopes until one matches the wanted type
async fn recv_type(ws: &mut WsStream, wanted: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no {} envelope in time",
            wanted
        );
        let msg = recv_json(ws).await;
        if msg["type"] == wanted {
            return msg;
        }
    }
}

#[tokio::test]
async fn welcome_then_offer_handshake() {
    let config = test_config(4);
    let port = config.server.signaling_port;
    let (registry, broker) = start_stack(&config).await;

    let mut ws = connect(port).await;

    let welcome = recv_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let peer_id = welcome["peerId"].as_str().unwrap();
    assert_eq!(peer_id.len(), 13);
    assert!(peer_id.starts_with("peer-"));
    assert!(peer_id[5..].chars().all(|c| c.is_ascii_hexdigit()));
    assert!(welcome["iceServers"].is_array());

    let offer = recv_type(&mut ws, "offer").await;
    let sdp = offer["sdp"].as_str().unwrap();
    assert!(sdp.contains("m=video"));
    assert!(sdp.contains("sendonly"));
    assert!(sdp.contains("H264/90000"));

    assert_eq!(registry.peer_count().await, 1);
    assert!(registry.get_session(peer_id).await.is_some());

    // Ping keeps the channel alive
    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    recv_type(&mut ws, "pong").await;

    // Disconnecting removes the peer
    ws.close(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.peer_count().await != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer not removed after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    broker.stop().await;
    registry.stop().await;
}

#[tokio::test]
async fn capacity_rejection_sends_error_and_closes() {
    let config = test_config(1);
    let port = config.server.signaling_port;
    let (registry, broker) = start_stack(&config).await;

    let mut first = connect(port).await;
    let welcome = recv_json(&mut first).await;
    assert_eq!(welcome["type"], "welcome");

    let mut second = connect(port).await;
    let rejection = recv_json(&mut second).await;
    assert_eq!(rejection["type"], "error");
    assert_eq!(rejection["message"], "Server full, max peers reached");

    // The server closes the rejected socket
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "rejected socket not closed"
        );
        match tokio::time::timeout(Duration::from_secs(5), second.next())
            .await
            .expect("close timeout")
        {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }

    assert_eq!(registry.peer_count().await, 1);

    broker.stop().await;
    registry.stop().await;
}

#[tokio::test]
async fn malformed_messages_are_tolerated() {
    let config = test_config(4);
    let port = config.server.signaling_port;
    let (registry, broker) = start_stack(&config).await;

    let mut ws = connect(port).await;
    recv_json(&mut ws).await; // welcome

    // Invalid JSON, unknown types, and empty payloads are all ignored
    ws.send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"transmogrify"}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"answer","sdp":""}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"candidate","data":{}}"#.to_string()))
        .await
        .unwrap();

    // The connection survives all of it
    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    recv_type(&mut ws, "pong").await;
    assert_eq!(registry.peer_count().await, 1);

    broker.stop().await;
    registry.stop().await;
}

#[tokio::test]
async fn bitrate_hints_reach_the_installed_callback() {
    let config = test_config(4);
    let port = config.server.signaling_port;
    let (registry, broker) = start_stack(&config).await;

    let seen = Arc::new(AtomicU32::new(0));
    {
        let seen = Arc::clone(&seen);
        broker.set_bitrate_callback(Arc::new(move |kbps| {
            seen.store(kbps, Ordering::SeqCst);
        }));
    }

    let mut ws = connect(port).await;
    recv_json(&mut ws).await; // welcome

    ws.send(Message::Text(r#"{"type":"bitrate","kbps":2500}"#.to_string()))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.load(Ordering::SeqCst) != 2500 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "bitrate hint not delivered"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // An envelope without kbps is ignored
    ws.send(Message::Text(r#"{"type":"bitrate"}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    recv_type(&mut ws, "pong").await;
    assert_eq!(seen.load(Ordering::SeqCst), 2500);

    broker.stop().await;
    registry.stop().await;
}
