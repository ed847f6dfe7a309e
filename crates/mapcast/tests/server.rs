//! Integration tests for the instance: HTTP routing, upgrades, events,
//! broadcast, and shutdown over real sockets.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use mapcast::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<TcpStream>,
>;

// =========================================================================
// Helpers
// =========================================================================

fn local_config(name: &str) -> ServerConfig {
    ServerConfig::new(name).host("127.0.0.1").port(0)
}

async fn start(config: ServerConfig) -> (ServerInstance, SocketAddr) {
    let instance = ServerInstance::start(config).await.expect("should start");
    let addr = instance.local_addr().expect("should be bound");
    (instance, addr)
}

/// Subscribes a channel to every event of `instance`.
fn collect_events(instance: &ServerInstance) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    instance.on_event(move |event: &ServerEvent| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event should arrive")
        .expect("channel open")
}

/// Sends a raw HTTP request and returns the status code and body.
async fn http_get(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut raw))
        .await
        .expect("response should arrive")
        .unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a head");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, raw[split + 4..].to_vec())
}

async fn connect(
    addr: SocketAddr,
    protocol: Option<&'static str>,
) -> Result<ClientWs, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}/").into_client_request()?;
    if let Some(protocol) = protocol {
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(ws, _)| ws)
}

async fn recv_text(client: &mut ClientWs) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame should arrive")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

fn text(s: &str) -> Message {
    Message::text(s.to_owned())
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "mapcast-{tag}-{}-{:?}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Disk access where reads of any `slow.png` never complete.
struct StallingFiles(TokioFileAccess);

impl FileAccess for StallingFiles {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Vec<u8>>> {
        if path.ends_with("slow.png") {
            Box::pin(std::future::pending())
        } else {
            self.0.read(path)
        }
    }
}

// =========================================================================
// HTTP
// =========================================================================

#[tokio::test]
async fn test_asset_served_as_png() {
    let dir = temp_dir("assets");
    let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00];
    std::fs::write(dir.join("town.png"), png).unwrap();
    std::fs::write(dir.join("old town.png"), b"spaced").unwrap();

    let (mut instance, addr) = start(local_config("map").assets_dir(&dir)).await;

    let (status, body) = http_get(addr, "/maps/town.png").await;
    assert_eq!(status, 200);
    assert_eq!(body, png);

    let (status, body) = http_get(addr, "/maps/old%20town.png").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"spaced");

    instance.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_missing_asset_is_400() {
    let dir = temp_dir("missing");
    let (mut instance, addr) = start(local_config("map").assets_dir(&dir)).await;

    let (status, body) = http_get(addr, "/maps/nowhere.png").await;

    assert_eq!(status, 400);
    assert_eq!(body, b"No such image");
    instance.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_index_placeholder_and_registered_content() {
    let (mut instance, addr) = start(local_config("map")).await;

    let (status, body) = http_get(addr, "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"index");

    instance.register_file("index.html", FileSource::inline("<html>map</html>"));
    let (status, body) = http_get(addr, "/some/page?x=1").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"<html>map</html>");

    instance.shutdown().await;
}

#[tokio::test]
async fn test_index_from_disk() {
    let dir = temp_dir("index");
    let path = dir.join("index.html");
    std::fs::write(&path, "<html>control</html>").unwrap();

    let (mut instance, addr) = start(local_config("control")).await;
    instance.register_file("index.html", FileSource::on_disk(&path));

    let (_, body) = http_get(addr, "/").await;
    assert_eq!(body, b"<html>control</html>");

    instance.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_slow_file_read_does_not_block_other_requests() {
    let mut instance = ServerInstance::with_file_access(
        local_config("map"),
        Arc::new(StallingFiles(TokioFileAccess)),
    );
    instance.register_file("index.html", FileSource::inline("<html>map</html>"));
    let mut events = collect_events(&instance);
    instance.run_startup().await.unwrap();
    let addr = instance.local_addr().unwrap();

    let mut slow = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /maps/slow.png HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    slow.write_all(request.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (status, body) = http_get(addr, "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"<html>map</html>");

    let mut client = connect(addr, Some(SUBPROTOCOL))
        .await
        .expect("upgrade should not wait on the pending read");
    assert!(matches!(next_event(&mut events).await, ServerEvent::Connected(_)));

    let mut buf = [0u8; 1];
    let pending =
        tokio::time::timeout(Duration::from_millis(100), slow.read(&mut buf)).await;
    assert!(pending.is_err(), "slow request should still be waiting");

    tokio::time::timeout(Duration::from_secs(5), instance.shutdown())
        .await
        .expect("shutdown should cancel the pending read");
    let end = tokio::time::timeout(Duration::from_secs(2), slow.read(&mut buf))
        .await
        .expect("slow socket should be closed");
    assert!(matches!(end, Ok(0) | Err(_)));
    let _ = client.close(None).await;
}

// =========================================================================
// Upgrades and events
// =========================================================================

#[tokio::test]
async fn test_upgrade_without_subprotocol_rejected() {
    let (mut instance, addr) = start(local_config("map")).await;
    let mut events = collect_events(&instance);

    assert!(connect(addr, None).await.is_err());
    assert!(connect(addr, Some("chat")).await.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(instance.connection_count(), 0);
    assert!(events.try_recv().is_err(), "no events for rejected peers");
    instance.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_before_ws_online_rejected() {
    let mut instance = ServerInstance::new(local_config("map"));
    instance.begin();
    instance.start_http().await.unwrap();
    let addr = instance.local_addr().unwrap();

    assert!(connect(addr, Some(SUBPROTOCOL)).await.is_err());
    let (status, _) = http_get(addr, "/").await;
    assert_eq!(status, 200, "plain HTTP already works");

    instance.start_ws();
    let mut client = connect(addr, Some(SUBPROTOCOL)).await.expect("now accepted");
    client.close(None).await.unwrap();
    instance.shutdown().await;
}

#[tokio::test]
async fn test_connected_and_message_events() {
    let (mut instance, addr) = start(local_config("control")).await;
    let mut events = collect_events(&instance);

    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();

    let id = match next_event(&mut events).await {
        ServerEvent::Connected(conn) => conn.id(),
        other => panic!("expected Connected, got {other:?}"),
    };
    assert_eq!(instance.connection_count(), 1);

    client
        .send(text(r#"{"type":"zoom","data":{"level":3}}"#))
        .await
        .unwrap();
    match next_event(&mut events).await {
        ServerEvent::TypedMessageReceived { conn, message } => {
            assert_eq!(conn.id(), id);
            assert_eq!(message.kind(), "zoom");
            assert_eq!(message.data()["level"], 3);
        }
        other => panic!("expected TypedMessageReceived, got {other:?}"),
    }

    client.send(text("hello")).await.unwrap();
    match next_event(&mut events).await {
        ServerEvent::MessageReceived { text, .. } => assert_eq!(text, "hello"),
        other => panic!("expected MessageReceived, got {other:?}"),
    }

    // Binary frames produce no event; the next text frame comes through.
    client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    client
        .send(text(r#"{"type":"x","data":0}"#))
        .await
        .unwrap();
    match next_event(&mut events).await {
        ServerEvent::MessageReceived { text, .. } => {
            assert_eq!(text, r#"{"type":"x","data":0}"#)
        }
        other => panic!("falsy data should be untyped, got {other:?}"),
    }

    instance.shutdown().await;
}

#[tokio::test]
async fn test_reply_from_handler() {
    let (mut instance, addr) = start(local_config("map")).await;
    instance.on_event(|event: &ServerEvent| {
        if let ServerEvent::Connected(conn) = event {
            let _ = conn.send_typed("welcome", "map");
        }
    });

    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();

    assert_eq!(recv_text(&mut client).await, r#"{"type":"welcome","data":"map"}"#);
    instance.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_peer() {
    let (mut instance, addr) = start(local_config("map")).await;
    let mut events = collect_events(&instance);

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(addr, Some(SUBPROTOCOL)).await.unwrap());
        assert!(matches!(next_event(&mut events).await, ServerEvent::Connected(_)));
    }

    let sent = instance
        .broadcast_typed("marker", &serde_json::json!({"x": 1, "y": 2}))
        .unwrap();
    assert_eq!(sent, 3);
    assert_eq!(instance.broadcast("first"), 3);
    assert_eq!(instance.broadcast("second"), 3);

    for client in &mut clients {
        assert_eq!(
            recv_text(client).await,
            r#"{"type":"marker","data":{"x":1,"y":2}}"#
        );
        assert_eq!(recv_text(client).await, "first");
        assert_eq!(recv_text(client).await, "second");
    }
    instance.shutdown().await;
}

#[tokio::test]
async fn test_send_to_one_peer() {
    let (mut instance, addr) = start(local_config("map")).await;
    let mut events = collect_events(&instance);

    let mut a = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    let ServerEvent::Connected(conn_a) = next_event(&mut events).await else {
        panic!("expected Connected");
    };
    let mut b = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    let ServerEvent::Connected(_) = next_event(&mut events).await else {
        panic!("expected Connected");
    };

    instance.send(conn_a.id(), "only a").unwrap();
    instance.broadcast("everyone");

    assert_eq!(recv_text(&mut a).await, "only a");
    assert_eq!(recv_text(&mut a).await, "everyone");
    assert_eq!(recv_text(&mut b).await, "everyone");
    instance.shutdown().await;
}

// =========================================================================
// Close and shutdown
// =========================================================================

#[tokio::test]
async fn test_peer_close_emits_disconnected_once() {
    let (mut instance, addr) = start(local_config("map")).await;
    let mut events = collect_events(&instance);

    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    let ServerEvent::Connected(conn) = next_event(&mut events).await else {
        panic!("expected Connected");
    };

    client.close(None).await.unwrap();
    match next_event(&mut events).await {
        ServerEvent::Disconnected(gone) => assert_eq!(gone.id(), conn.id()),
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert_eq!(instance.connection_count(), 0);
    assert_eq!(instance.broadcast("anyone?"), 0);
    assert!(instance.send(conn.id(), "late").is_err());

    instance.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "no duplicate close");
}

#[tokio::test]
async fn test_close_from_connected_handler_disconnects_once() {
    let (mut instance, addr) = start(local_config("map")).await;
    instance.on_event(|event: &ServerEvent| {
        if let ServerEvent::Connected(conn) = event {
            conn.close();
        }
    });
    let mut events = collect_events(&instance);

    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();

    let ServerEvent::Connected(conn) = next_event(&mut events).await else {
        panic!("expected Connected");
    };
    match next_event(&mut events).await {
        ServerEvent::Disconnected(gone) => assert_eq!(gone.id(), conn.id()),
        other => panic!("expected Disconnected, got {other:?}"),
    }
    let end = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("client should see the close");
    assert!(matches!(end, Some(Ok(Message::Close(_)))), "got {end:?}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "exactly one Disconnected");
    assert_eq!(instance.connection_count(), 0);
    instance.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_events_after_shutdown_during_connect_burst() {
    for _ in 0..30 {
        let (mut instance, addr) = start(local_config("map")).await;
        let returned = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let returned = Arc::clone(&returned);
            instance.on_event(move |event: &ServerEvent| {
                let _ = tx.send((returned.load(Ordering::SeqCst), event.clone()));
            });
        }

        let clients: Vec<_> = (0..40)
            .map(|_| tokio::spawn(connect(addr, Some(SUBPROTOCOL))))
            .collect();
        tokio::time::sleep(Duration::from_millis(2)).await;
        instance.shutdown().await;
        returned.store(true, Ordering::SeqCst);

        for client in clients {
            let _ = tokio::time::timeout(Duration::from_secs(5), client).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (mut connected, mut disconnected) = (0, 0);
        while let Ok((late, event)) = rx.try_recv() {
            assert!(!late, "event after shutdown returned: {event:?}");
            match event {
                ServerEvent::Connected(_) => connected += 1,
                ServerEvent::Disconnected(_) => disconnected += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(connected, disconnected);
        assert_eq!(instance.connection_count(), 0);
    }
}

#[tokio::test]
async fn test_shutdown_closes_peers_and_listener() {
    let (mut instance, addr) = start(local_config("map")).await;
    let mut events = collect_events(&instance);

    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(connect(addr, Some(SUBPROTOCOL)).await.unwrap());
        next_event(&mut events).await;
    }

    instance.shutdown().await;
    instance.shutdown().await;

    let mut disconnected = 0;
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, ServerEvent::Disconnected(_)));
        disconnected += 1;
    }
    assert_eq!(disconnected, 2);
    assert_eq!(instance.connection_count(), 0);

    for client in &mut clients {
        let end = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("client should see the close");
        assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    }

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_reported() {
    let (mut first, addr) = start(local_config("first")).await;

    let err = ServerInstance::start(local_config("second").port(addr.port()))
        .await
        .err()
        .expect("port is taken");
    assert!(err.is_bind_failure());

    let mut second = ServerInstance::new(local_config("second").port(addr.port()));
    second.begin();
    assert!(second.start_http().await.is_err());
    assert_eq!(second.status(), ServerStatus::Starting);

    first.shutdown().await;
}

// =========================================================================
// Two instances
// =========================================================================

#[tokio::test]
async fn test_control_messages_relayed_to_map() {
    let (mut map, map_addr) = start(local_config("map")).await;
    let (mut control, control_addr) = start(local_config("control")).await;
    let mut map_events = collect_events(&map);

    let map_handle = map.handle();
    control.on_event(move |event: &ServerEvent| {
        if let ServerEvent::TypedMessageReceived { message, .. } = event {
            let _ = map_handle.broadcast_typed(message.kind(), message.data());
        }
    });

    let mut viewer = connect(map_addr, Some(SUBPROTOCOL)).await.unwrap();
    next_event(&mut map_events).await;
    let mut operator = connect(control_addr, Some(SUBPROTOCOL)).await.unwrap();

    operator
        .send(text(r#"{"type":"pan","data":{"dx":5}}"#))
        .await
        .unwrap();

    assert_eq!(recv_text(&mut viewer).await, r#"{"type":"pan","data":{"dx":5}}"#);
    assert_eq!(control.connection_count(), 1);

    control.shutdown().await;
    map.shutdown().await;
}
