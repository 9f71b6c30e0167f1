//! Full-pipeline tests over real sockets: a bound proxy, scripted
//! clients, and scripted backends.

use infrared::config::{Config, ServerConfig, StatusOverride};
use infrared::protocol::handshake::{Handshake, NextState};
use infrared::protocol::packet::{read_packet, write_packet, Packet};
use infrared::protocol::status::{ResponseJson, PING_ID, STATUS_REQUEST_ID};
use infrared::protocol::{login, Decoder, Encoder, MAX_PACKET_SIZE};
use infrared::{Proxy, Reply, Topic};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct TestProxy {
    proxy: Arc<Proxy>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    serving: JoinHandle<anyhow::Result<()>>,
}

async fn start_proxy(config: Config) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let proxy = Arc::new(Proxy::new(config));

    let serving = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        let shutdown = shutdown.clone();
        async move { proxy.serve(listener, shutdown).await }
    });

    TestProxy {
        proxy,
        addr,
        shutdown,
        serving,
    }
}

impl TestProxy {
    async fn stop(self) {
        self.shutdown.cancel();
        timeout(Duration::from_secs(5), self.serving)
            .await
            .expect("proxy did not stop in time")
            .unwrap()
            .unwrap();
    }
}

fn test_config(servers: Vec<ServerConfig>) -> Config {
    Config {
        servers,
        client_timeout: Duration::from_secs(2),
        grace_period: Duration::from_millis(200),
        ..Config::default()
    }
}

fn test_server(domains: &[&str], address: &str) -> ServerConfig {
    ServerConfig {
        domains: domains.iter().map(|s| s.to_string()).collect(),
        address: address.to_owned(),
        dial_timeout: Duration::from_secs(1),
        ..ServerConfig::default()
    }
}

fn handshake(address: &str, next_state: NextState) -> Handshake {
    Handshake {
        protocol_version: 762,
        server_address: address.to_owned(),
        server_port: 25565,
        next_state,
    }
}

fn login_start(name: &str) -> Packet {
    let mut data = Vec::new();
    Encoder::new(&mut data).write_string(name);
    Packet::new(login::LOGIN_START_ID, data)
}

fn status_request() -> Packet {
    Packet::new(STATUS_REQUEST_ID, vec![])
}

fn ping(payload: u64) -> Packet {
    Packet::new(PING_ID, payload.to_be_bytes().to_vec())
}

fn disconnect_reason(packet: &Packet) -> String {
    assert_eq!(packet.id, login::DISCONNECT_ID);
    let mut decoder = Decoder::new(&packet.data);
    let chat = decoder.read_string(i16::MAX as usize).unwrap();
    let value: serde_json::Value = serde_json::from_str(chat).unwrap();
    value["text"].as_str().unwrap().to_owned()
}

// Status pass-through: with no override, both initial packets reach the
// backend and its status response and pong come back byte-identical.
#[tokio::test]
async fn status_passes_through_to_backend() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let mut client_bytes = handshake("localhost", NextState::Status)
        .encode()
        .wire_encoding();
    client_bytes.extend(status_request().wire_encoding());

    let response_frame = {
        let mut data = Vec::new();
        Encoder::new(&mut data)
            .write_string(r#"{"version":{"name":"backend","protocol":762},"players":{"max":7,"online":2},"description":{"text":"from the backend"}}"#);
        Packet::new(0x00, data).wire_encoding()
    };

    let backend_task = tokio::spawn({
        let expect = client_bytes.clone();
        let response_frame = response_frame.clone();
        async move {
            let (stream, _) = backend.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            let mut seen = Vec::new();
            let first = infrared::protocol::packet::read_packet_recorded(
                &mut reader,
                MAX_PACKET_SIZE,
                &mut seen,
            )
            .await
            .unwrap();
            assert_eq!(first.id, 0x00);
            infrared::protocol::packet::read_packet_recorded(
                &mut reader,
                MAX_PACKET_SIZE,
                &mut seen,
            )
            .await
            .unwrap();
            assert_eq!(seen, expect);

            writer.write_all(&response_frame).await.unwrap();

            let ping = read_packet(&mut reader, MAX_PACKET_SIZE).await.unwrap();
            assert_eq!(ping.id, PING_ID);
            write_packet(&mut writer, &infrared::protocol::status::pong(&ping))
                .await
                .unwrap();
        }
    });

    let proxy = start_proxy(test_config(vec![test_server(
        &["localhost"],
        &backend_addr.to_string(),
    )]))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&client_bytes).await.unwrap();

    let mut relayed = vec![0u8; response_frame.len()];
    client.read_exact(&mut relayed).await.unwrap();
    assert_eq!(relayed, response_frame);

    write_packet(&mut client, &ping(42)).await.unwrap();
    let pong = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(pong.id, PING_ID);
    assert_eq!(pong.data, 42u64.to_be_bytes());

    backend_task.await.unwrap();
    proxy.stop().await;
}

// Status synthesised: a plain override answers locally and the backend is
// never contacted.
#[tokio::test]
async fn status_override_synthesizes_without_dialing() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let dialed = Arc::new(AtomicBool::new(false));

    tokio::spawn({
        let dialed = Arc::clone(&dialed);
        async move {
            if backend.accept().await.is_ok() {
                dialed.store(true, Ordering::SeqCst);
            }
        }
    });

    let mut server = test_server(&["localhost"], &backend_addr.to_string());
    server.status_override = Some(StatusOverride {
        motd: Some("hi".to_owned()),
        player_count: Some(3),
        ..StatusOverride::default()
    });
    let proxy = start_proxy(test_config(vec![server])).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("localhost", NextState::Status).encode())
        .await
        .unwrap();
    write_packet(&mut client, &status_request()).await.unwrap();

    let packet = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    let response = ResponseJson::decode(&packet).unwrap();
    assert_eq!(response.description.text, "hi");
    assert_eq!(response.players.online, 3);
    assert_eq!(response.version.protocol, 762);

    write_packet(&mut client, &ping(7)).await.unwrap();
    let pong = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(pong.data, 7u64.to_be_bytes());

    assert!(!dialed.load(Ordering::SeqCst));
    proxy.stop().await;
}

// A status client that hangs up after the response, without pinging,
// closed normally; the proxy keeps serving.
#[tokio::test]
async fn status_client_may_skip_ping() {
    let mut server = test_server(&["localhost"], "127.0.0.1:1");
    server.status_override = Some(StatusOverride {
        motd: Some("hi".to_owned()),
        ..StatusOverride::default()
    });
    let proxy = start_proxy(test_config(vec![server])).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("localhost", NextState::Status).encode())
        .await
        .unwrap();
    write_packet(&mut client, &status_request()).await.unwrap();
    let packet = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(ResponseJson::decode(&packet).unwrap().description.text, "hi");
    drop(client);

    // A second, complete exchange still goes through.
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("localhost", NextState::Status).encode())
        .await
        .unwrap();
    write_packet(&mut client, &status_request()).await.unwrap();
    read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    write_packet(&mut client, &ping(9)).await.unwrap();
    let pong = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(pong.data, 9u64.to_be_bytes());

    proxy.stop().await;
}

// Login routed: the two initial packets replay to the backend and the
// session pumps both directions until a side closes.
#[tokio::test]
async fn login_routes_and_pumps() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let backend_task = tokio::spawn(async move {
        let (stream, _) = backend.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let first = read_packet(&mut reader, MAX_PACKET_SIZE).await.unwrap();
        let hs = Handshake::decode(&first).unwrap();
        assert_eq!(hs.server_address, "mc.example.net");
        assert_eq!(hs.next_state, NextState::Login);

        let second = read_packet(&mut reader, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(
            login::LoginStart::decode(&second).unwrap().name,
            "Steve"
        );

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"upstream");
        writer.write_all(b"downstream").await.unwrap();

        // Wait for the client to hang up.
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    });

    let proxy = start_proxy(test_config(vec![test_server(
        &["mc.example.net"],
        &backend_addr.to_string(),
    )]))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("mc.example.net", NextState::Login).encode())
        .await
        .unwrap();
    write_packet(&mut client, &login_start("Steve")).await.unwrap();

    client.write_all(b"upstream").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"downstream");

    drop(client);
    timeout(Duration::from_secs(2), backend_task)
        .await
        .unwrap()
        .unwrap();
    proxy.stop().await;
}

// No match on login: the client gets the configured kick text.
#[tokio::test]
async fn login_without_match_is_kicked() {
    let proxy = start_proxy(test_config(vec![test_server(
        &["mc.example.net"],
        "127.0.0.1:1",
    )]))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("unknown", NextState::Login).encode())
        .await
        .unwrap();
    write_packet(&mut client, &login_start("Steve")).await.unwrap();

    let packet = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(disconnect_reason(&packet), "No server matches this address.");

    // The proxy closes after the disconnect.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    proxy.stop().await;
}

// Backend down on login: the offline kick message, not a hang.
#[tokio::test]
async fn login_dial_failure_disconnects() {
    // Bind-then-drop guarantees nothing listens on the port.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let proxy = start_proxy(test_config(vec![test_server(
        &["mc.example.net"],
        &dead_addr.to_string(),
    )]))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("mc.example.net", NextState::Login).encode())
        .await
        .unwrap();
    write_packet(&mut client, &login_start("Steve")).await.unwrap();

    let packet = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(disconnect_reason(&packet), "Server is offline.");
    proxy.stop().await;
}

// PROXY protocol in, Real-IP out: the header's source address ends up in
// the rewritten handshake the backend sees.
#[tokio::test]
async fn proxy_protocol_and_real_ip_rewrite() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let backend_task = tokio::spawn(async move {
        let (stream, _) = backend.accept().await.unwrap();
        let (reader, _writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let first = read_packet(&mut reader, MAX_PACKET_SIZE).await.unwrap();
        let hs = Handshake::decode(&first).unwrap();
        assert_eq!(hs.server_address, "addr\0203.0.113.9:54321");

        let second = read_packet(&mut reader, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(login::LoginStart::decode(&second).unwrap().name, "Steve");
    });

    let mut config = test_config(vec![ServerConfig {
        send_real_ip: true,
        ..test_server(&["addr"], &backend_addr.to_string())
    }]);
    config.proxy_protocol = true;
    let proxy = start_proxy(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let header = infrared::proxy_protocol::encode_v2(
        "203.0.113.9:54321".parse().unwrap(),
        "10.0.0.1:25565".parse().unwrap(),
    );
    client.write_all(&header).await.unwrap();
    write_packet(&mut client, &handshake("addr", NextState::Login).encode())
        .await
        .unwrap();
    write_packet(&mut client, &login_start("Steve")).await.unwrap();

    timeout(Duration::from_secs(2), backend_task)
        .await
        .unwrap()
        .unwrap();
    proxy.stop().await;
}

// A deny reply on PrePlayerJoin rejects the connection with the
// handler's message.
#[tokio::test]
async fn pre_player_join_deny_kicks() {
    let proxy = start_proxy(test_config(vec![test_server(
        &["mc.example.net"],
        "127.0.0.1:1",
    )]))
    .await;
    proxy.proxy.bus().handle_sync(&[Topic::PrePlayerJoin], |_| Reply::Deny {
        message: "banned, {{username}}".to_owned(),
    });

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("mc.example.net", NextState::Login).encode())
        .await
        .unwrap();
    write_packet(&mut client, &login_start("Steve")).await.unwrap();

    let packet = read_packet(&mut client, MAX_PACKET_SIZE).await.unwrap();
    assert_eq!(disconnect_reason(&packet), "banned, Steve");
    proxy.stop().await;
}

// Shutdown closes the listener at once and aborts live sessions after the
// grace period.
#[tokio::test]
async fn shutdown_drains_live_sessions() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    // Backend that accepts and then sits on open sessions.
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = backend.accept().await {
            held.push(stream);
        }
    });

    let proxy = start_proxy(test_config(vec![test_server(
        &["mc.example.net"],
        &backend_addr.to_string(),
    )]))
    .await;

    let mut sessions = Vec::new();
    for i in 0..3 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        write_packet(&mut client, &handshake("mc.example.net", NextState::Login).encode())
            .await
            .unwrap();
        write_packet(&mut client, &login_start(&format!("Steve{i}")))
            .await
            .unwrap();
        sessions.push(client);
    }

    // Give the pipeline a moment to route all three into live pumps.
    tokio::time::sleep(Duration::from_millis(100)).await;

    proxy.shutdown.cancel();
    timeout(Duration::from_secs(2), proxy.serving)
        .await
        .expect("shutdown exceeded the grace period")
        .unwrap()
        .unwrap();

    // Aborted pumps drop the client sockets.
    for mut client in sessions {
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("client socket left dangling");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}

// Swapping the server table reroutes new connections without a restart.
#[tokio::test]
async fn swap_servers_applies_to_new_connections() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let backend_task = tokio::spawn(async move {
        let (stream, _) = backend.accept().await.unwrap();
        let (reader, _writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let first = read_packet(&mut reader, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(
            Handshake::decode(&first).unwrap().server_address,
            "new.example.net"
        );
    });

    let proxy = start_proxy(test_config(vec![])).await;
    proxy
        .proxy
        .swap_servers(vec![test_server(&["new.example.net"], &backend_addr.to_string())]);

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    write_packet(&mut client, &handshake("new.example.net", NextState::Login).encode())
        .await
        .unwrap();
    write_packet(&mut client, &login_start("Steve")).await.unwrap();

    timeout(Duration::from_secs(2), backend_task)
        .await
        .unwrap()
        .unwrap();
    proxy.stop().await;
}
