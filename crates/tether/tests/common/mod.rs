//! Shared wire-level client for the integration suite.

// Each test binary uses a different subset of the helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use tether::route::RequestMeta;
use tether::{Router, Server, ServerConfig, Session};
use tether_proto::{Message, MessageType, Packet, PacketDecoder, PacketType};

/// The request payload served by the echo route in this suite.
#[derive(Debug, Default, Deserialize)]
pub struct EchoReq {
    #[serde(skip)]
    pub msg_id: u64,
    pub msg: String,
}

impl RequestMeta for EchoReq {
    fn set_msg_id(&mut self, id: u64) {
        self.msg_id = id;
    }

    fn msg_id(&self) -> u64 {
        self.msg_id
    }
}

/// An echo service matching the S1 scenario: push on `chat`, then respond
/// with the request payload.
pub fn echo_router() -> Router {
    let mut router = Router::new();
    router
        .scope("m")
        .request("echo", |session: &Arc<Session>, req: EchoReq| {
            session
                .push("chat", &serde_json::json!({ "msg": "welcome" }))
                .unwrap();
            session
                .respond(&req, &serde_json::json!({ "msg": req.msg }))
                .unwrap();
        })
        .unwrap();
    router
}

pub fn start_echo_server(config: ServerConfig) -> (Arc<Server>, tether::ServerHandle) {
    let server = Server::new(echo_router(), config).unwrap();
    let handle = server.bind("127.0.0.1:0").unwrap();
    (server, handle)
}

/// Raw packet-protocol client over TCP.
pub struct TestClient {
    stream: TcpStream,
    decoder: PacketDecoder,
    inbox: VecDeque<Packet>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            decoder: PacketDecoder::default(),
            inbox: VecDeque::new(),
        }
    }

    pub fn send_packet(&mut self, kind: PacketType, body: &[u8]) {
        let frame = Packet::new(kind, body.to_vec()).encode().unwrap();
        self.stream.write_all(&frame).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Next packet of any type, heartbeats included.
    pub fn recv_any_packet(&mut self) -> Packet {
        loop {
            if let Some(packet) = self.inbox.pop_front() {
                return packet;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed the stream");
            self.inbox.extend(self.decoder.feed(&buf[..n]).unwrap());
        }
    }

    /// Next packet that is not a heartbeat.
    pub fn recv_packet(&mut self) -> Packet {
        loop {
            let packet = self.recv_any_packet();
            if packet.kind != PacketType::Heartbeat {
                return packet;
            }
        }
    }

    /// Next Data packet, decoded.
    pub fn recv_message(&mut self) -> Message {
        let packet = self.recv_packet();
        assert_eq!(packet.kind, PacketType::Data, "expected data packet");
        Message::decode(packet.data).unwrap()
    }

    /// Handshake and return the session id from the reply.
    pub fn handshake(&mut self, sid: Option<&str>) -> String {
        let body = match sid {
            Some(sid) => format!("{{\"sid\":\"{sid}\"}}"),
            None => "{}".to_string(),
        };
        self.send_packet(PacketType::Handshake, body.as_bytes());

        let reply = self.recv_packet();
        assert_eq!(reply.kind, PacketType::Handshake);
        let reply: serde_json::Value = serde_json::from_slice(&reply.data).unwrap();
        assert_eq!(reply["code"], 200);
        assert!(reply["hb"].as_u64().unwrap() > 0);
        reply["sid"].as_str().unwrap().to_string()
    }

    pub fn ack(&mut self) {
        self.send_packet(PacketType::HandshakeAck, &[]);
    }

    /// Handshake + ack in one go; returns the session id.
    pub fn attach(&mut self, sid: Option<&str>) -> String {
        let sid = self.handshake(sid);
        self.ack();
        sid
    }

    pub fn request(&mut self, id: u64, route: &str, body: &str) {
        let msg = Message::new(MessageType::Request, id, route, body.as_bytes().to_vec());
        self.send_packet(PacketType::Data, &msg.encode().unwrap());
    }

    /// Assert the server tears the connection down: we must observe a
    /// Close packet or a clean EOF before the read timeout.
    pub fn expect_disconnect(&mut self) {
        loop {
            if let Some(packet) = self.inbox.pop_front() {
                if packet.kind == PacketType::Close {
                    return;
                }
                continue;
            }
            let mut buf = [0u8; 4096];
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => match self.decoder.feed(&buf[..n]) {
                    Ok(packets) => self.inbox.extend(packets),
                    // The server may abort mid-frame; any tail garbage
                    // still counts as a disconnect.
                    Err(_) => return,
                },
                Err(err)
                    if err.kind() == ErrorKind::ConnectionReset
                        || err.kind() == ErrorKind::BrokenPipe =>
                {
                    return;
                }
                Err(err) => panic!("expected disconnect, got read error {err}"),
            }
        }
    }
}
