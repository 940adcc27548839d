//! Wire-level protocol scenarios against a TCP-bound server.

mod common;

use std::time::{Duration, Instant};

use tether::ServerConfig;
use tether_proto::{MessageType, PacketType};

use common::{TestClient, start_echo_server};

#[test]
fn handshake_then_echo_round_trip() {
    let (_server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());

    let sid = client.handshake(None);
    assert!(!sid.is_empty());
    client.ack();

    client.request(7, "m.echo", "{\"msg\":\"hi\"}");

    // The handler pushes on `chat` first, then responds with id 7; the
    // single per-connection writer preserves that order.
    let push = client.recv_message();
    assert_eq!(push.kind, MessageType::Push);
    assert_eq!(push.route, "chat");
    let body: serde_json::Value = serde_json::from_slice(&push.data).unwrap();
    assert_eq!(body["msg"], "welcome");

    let response = client.recv_message();
    assert_eq!(response.kind, MessageType::Response);
    assert_eq!(response.id, 7);
    assert_eq!(response.route, "");
    let body: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(body["msg"], "hi");

    handle.shutdown();
}

#[test]
fn unknown_route_is_dropped_and_connection_survives() {
    let (_server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());
    client.attach(None);

    client.request(1, "nope", "{}");

    // A later valid request still succeeds on the same connection.
    client.request(2, "m.echo", "{\"msg\":\"still here\"}");
    let push = client.recv_message();
    assert_eq!(push.kind, MessageType::Push);
    let response = client.recv_message();
    assert_eq!(response.id, 2);

    handle.shutdown();
}

#[test]
fn oversized_packet_terminates_the_connection() {
    let (_server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());
    client.attach(None);

    // Header declaring a 65_537-byte body; no body needed, the header
    // alone is fatal.
    client.send_raw(&[PacketType::Data as u8, 0x01, 0x00, 0x01]);
    client.expect_disconnect();

    handle.shutdown();
}

#[test]
fn data_before_handshake_ack_is_fatal() {
    let (_server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());

    client.handshake(None);
    // No ack: Data in Handshake status violates the state machine.
    client.request(1, "m.echo", "{\"msg\":\"too soon\"}");
    client.expect_disconnect();

    handle.shutdown();
}

#[test]
fn handshake_twice_is_fatal() {
    let (_server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());

    client.handshake(None);
    client.send_packet(PacketType::Handshake, b"{}");
    client.expect_disconnect();

    handle.shutdown();
}

#[test]
fn malformed_handshake_json_is_fatal() {
    let (_server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());

    client.send_packet(PacketType::Handshake, b"not json");
    client.expect_disconnect();

    handle.shutdown();
}

#[test]
fn server_emits_heartbeats() {
    let config = ServerConfig {
        heartbeat_secs: 1,
        ..ServerConfig::default()
    };
    let (_server, handle) = start_echo_server(config);
    let mut client = TestClient::connect(handle.local_addr());
    client.attach(None);

    let deadline = Instant::now() + Duration::from_secs(4);
    loop {
        let packet = client.recv_any_packet();
        if packet.kind == PacketType::Heartbeat {
            assert!(packet.data.is_empty());
            break;
        }
        assert!(Instant::now() < deadline, "no heartbeat within 4s");
    }

    // Echoing the heartbeat back is a server-side noop; the connection
    // keeps serving requests.
    client.send_packet(PacketType::Heartbeat, &[]);
    client.request(3, "m.echo", "{\"msg\":\"after beat\"}");
    let push = client.recv_message();
    assert_eq!(push.kind, MessageType::Push);
    let response = client.recv_message();
    assert_eq!(response.id, 3);

    handle.shutdown();
}

#[test]
fn client_close_packet_closes_the_session() {
    let (server, handle) = start_echo_server(ServerConfig::default());
    let mut client = TestClient::connect(handle.local_addr());
    let sid = client.attach(None);

    client.send_packet(PacketType::Close, &[]);
    client.expect_disconnect();

    let deadline = Instant::now() + Duration::from_secs(3);
    while server.sessions().get(&sid).is_some() {
        assert!(Instant::now() < deadline, "session not removed after close");
        std::thread::sleep(Duration::from_millis(10));
    }

    handle.shutdown();
}
