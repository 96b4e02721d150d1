mod common;

use common::{local_instance, start_kernel, test_config};
use futures::{SinkExt, StreamExt};
use loco_devkit::{EndpointsBuilder, StubCluster};
use loco_kernel::config::StaticInstanceConf;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Envoie un bloc binaire et attend exactement autant d'octets en retour
async fn echo_round_trip(ws: &mut WsClient, data: &[u8]) -> Vec<u8> {
    ws.send(Message::binary(data.to_vec())).await.unwrap();
    let mut received = Vec::new();
    while received.len() < data.len() {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("tunnel stalled")
            .expect("tunnel closed early")
            .unwrap();
        if let Message::Binary(chunk) = msg {
            received.extend_from_slice(&chunk);
        }
    }
    received
}

async fn recv_text(ws: &mut WsClient) -> Option<Value> {
    loop {
        match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn signaling_client(url: &str, id: &str) -> WsClient {
    let (mut ws, _) = connect_async(url).await.unwrap();
    ws.send(Message::text(json!({ "type": "register", "id": id }).to_string())).await.unwrap();
    let ack = recv_text(&mut ws).await.expect("registration ack");
    assert_eq!(ack, json!({ "type": "registered", "id": id }));
    ws
}

/// Attend une close frame du serveur et la renvoie (code, raison)
async fn expect_close(ws: &mut WsClient, within: Duration) -> (u16, String) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("no close frame in time")
            .expect("stream ended without close frame")
            .expect("ws error");
        if let Message::Close(Some(frame)) = msg {
            return (u16::from(frame.code), frame.reason.as_str().to_string());
        }
    }
}

#[tokio::test]
async fn test_signal_routed_to_target_only() {
    let kernel = start_kernel(test_config()).await;
    let url = kernel.ws_url("/ws/signaling");
    let mut a = signaling_client(&url, "client-a").await;
    let mut b = signaling_client(&url, "instance-1").await;
    let mut c = signaling_client(&url, "client-c").await;

    let payload = r#"{"sdp":"v=0\r\no=- 46117 2 IN IP4 127.0.0.1","kind":"offer"}"#;
    let msg = format!(r#"{{"type":"signal","target":"instance-1","payload":{payload}}}"#);
    a.send(Message::text(msg)).await.unwrap();

    let received = recv_text(&mut b).await.expect("signal delivered to target");
    assert_eq!(received["type"], "signal");
    assert_eq!(received["from"], "client-a");
    assert_eq!(received["payload"], serde_json::from_str::<Value>(payload).unwrap());
    assert!(recv_text(&mut c).await.is_none());
    assert!(recv_text(&mut a).await.is_none());

    // cible inconnue : abandonné, l'émetteur continue
    a.send(Message::text(json!({ "type": "signal", "target": "ghost", "payload": {} }).to_string()))
        .await
        .unwrap();
    a.send(Message::text(json!({ "type": "signal", "target": "client-c", "payload": [1, 2] }).to_string()))
        .await
        .unwrap();
    assert_eq!(recv_text(&mut c).await.unwrap()["payload"], json!([1, 2]));
}

#[tokio::test]
async fn test_last_registration_wins() {
    let kernel = start_kernel(test_config()).await;
    let url = kernel.ws_url("/ws/signaling");
    let mut sender = signaling_client(&url, "client-a").await;
    let mut old = signaling_client(&url, "instance-0").await;
    let mut new = signaling_client(&url, "instance-0").await;

    sender
        .send(Message::text(json!({ "type": "signal", "target": "instance-0", "payload": "ice" }).to_string()))
        .await
        .unwrap();
    assert_eq!(recv_text(&mut new).await.unwrap()["payload"], "ice");
    assert!(recv_text(&mut old).await.is_none());

    // la fermeture de l'ancienne connexion ne retire pas la nouvelle
    old.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(kernel.state.signaling.registered(), vec!["client-a", "instance-0"]);
}

#[tokio::test]
async fn test_tunnel_preserves_multi_megabyte_stream() {
    let backend = loco_devkit::spawn_echo_backend().await.unwrap();
    let mut cfg = test_config();
    cfg.discovery.static_instances = vec![local_instance(backend.port(), 8080, 9090)];
    let kernel = start_kernel(cfg).await;

    let (ws, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-0")).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        for chunk in payload.chunks(48 * 1024) {
            tx.send(Message::binary(chunk.to_vec())).await.unwrap();
        }
        tx
    });

    let mut received = Vec::with_capacity(expected.len());
    while received.len() < expected.len() {
        let msg = tokio::time::timeout(Duration::from_secs(10), rx.next())
            .await
            .expect("tunnel stalled")
            .expect("tunnel closed early")
            .unwrap();
        if let Message::Binary(data) = msg {
            received.extend_from_slice(&data);
        }
    }
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "echoed bytes differ");
    assert_eq!(kernel.state.tunnel.active_sessions(), 1);

    let mut tx = writer.await.unwrap();
    tx.send(Message::Close(None)).await.unwrap();
    common::eventually(|| {
        let tunnel = kernel.state.tunnel.clone();
        async move { (tunnel.active_sessions() == 0).then_some(()) }
    })
    .await;
}

#[tokio::test]
async fn test_refused_backend_closes_with_reason() {
    let refused = loco_devkit::refused_addr().await.unwrap();
    let mut cfg = test_config();
    cfg.discovery.static_instances = vec![local_instance(refused.port(), 8080, 9090)];
    let kernel = start_kernel(cfg).await;

    let started = Instant::now();
    let (mut ws, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-0")).await.unwrap();
    let (code, reason) = expect_close(&mut ws, Duration::from_secs(3)).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(code, u16::from(CloseCode::Error));
    assert!(reason.contains("unreachable"), "reason: {reason}");
}

#[tokio::test]
async fn test_tunnel_denied_for_unknown_or_not_ready() {
    let backend = loco_devkit::spawn_echo_backend().await.unwrap();
    let mut cfg = test_config();
    cfg.discovery.static_instances = vec![StaticInstanceConf { ready: false, ..local_instance(backend.port(), 8080, 9090) }];
    let kernel = start_kernel(cfg).await;

    let (mut ws, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-0")).await.unwrap();
    let (code, reason) = expect_close(&mut ws, Duration::from_secs(3)).await;
    assert_eq!(code, u16::from(CloseCode::Policy));
    assert_eq!(reason, "instance instance-0 is not ready");

    let (mut ws, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-7")).await.unwrap();
    let (code, reason) = expect_close(&mut ws, Duration::from_secs(3)).await;
    assert_eq!(code, u16::from(CloseCode::Policy));
    assert_eq!(reason, "unknown instance instance-7");
}

#[tokio::test]
async fn test_open_tunnel_survives_instance_turning_not_ready() {
    let backend = loco_devkit::spawn_echo_backend().await.unwrap();
    let cluster = StubCluster::start().await.unwrap();
    let endpoints = |ready: bool| {
        let builder = EndpointsBuilder::new("loco", "loco-loco-emulator");
        let builder = if ready {
            builder.ready("loco-loco-emulator-0", "127.0.0.1")
        } else {
            builder.not_ready("loco-loco-emulator-0", "127.0.0.1")
        };
        builder.port("vnc", backend.port()).build()
    };
    cluster.set_endpoints(endpoints(true));
    let mut cfg = test_config();
    cfg.discovery.api_url = Some(cluster.url());
    let kernel = start_kernel(cfg).await;

    let (mut ws, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-0")).await.unwrap();
    assert_eq!(echo_round_trip(&mut ws, b"RFB 003.008\n").await, b"RFB 003.008\n");

    cluster.set_endpoints(endpoints(false));
    let snapshot = kernel.state.discovery.discover().await;
    assert!(!snapshot.get("instance-0").unwrap().is_ready());

    // la session déjà ouverte continue ; seules les nouvelles sont refusées
    assert_eq!(echo_round_trip(&mut ws, b"still flowing").await, b"still flowing");
    assert_eq!(kernel.state.tunnel.active_sessions(), 1);

    let (mut refused, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-0")).await.unwrap();
    let (code, _) = expect_close(&mut refused, Duration::from_secs(3)).await;
    assert_eq!(code, u16::from(CloseCode::Policy));
}

#[tokio::test]
async fn test_backend_close_closes_client() {
    let backend = loco_devkit::spawn_one_shot_backend().await.unwrap();
    let mut cfg = test_config();
    cfg.discovery.static_instances = vec![local_instance(backend.port(), 8080, 9090)];
    let kernel = start_kernel(cfg).await;

    let (mut ws, _) = connect_async(kernel.ws_url("/ws/tunnel/instance-0")).await.unwrap();
    assert_eq!(echo_round_trip(&mut ws, b"hello").await, b"hello");

    let (code, reason) = expect_close(&mut ws, Duration::from_secs(2)).await;
    assert_eq!(code, u16::from(CloseCode::Normal));
    assert_eq!(reason, "backend closed");
    common::eventually(|| {
        let tunnel = kernel.state.tunnel.clone();
        async move { (tunnel.active_sessions() == 0).then_some(()) }
    })
    .await;
}
