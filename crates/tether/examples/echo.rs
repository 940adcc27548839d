//! Echo service over plain TCP.
//!
//! Registers one request handler under `m.echo`: it pushes a greeting on
//! route `chat`, then responds with the request payload. Speak the tether
//! packet protocol to 127.0.0.1:4590 to try it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tether::route::RequestMeta;
use tether::{Router, Server, ServerConfig, Session};

#[derive(Debug, Default, Deserialize)]
struct EchoReq {
    #[serde(skip)]
    msg_id: u64,
    msg: String,
}

impl RequestMeta for EchoReq {
    fn set_msg_id(&mut self, id: u64) {
        self.msg_id = id;
    }

    fn msg_id(&self) -> u64 {
        self.msg_id
    }
}

#[derive(Serialize)]
struct ChatPush<'a> {
    msg: &'a str,
}

#[derive(Serialize)]
struct EchoReply {
    msg: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tether::telemetry::init(2);

    let mut router = Router::new();
    router
        .scope("m")
        .request("echo", |session: &Arc<Session>, req: EchoReq| {
            tracing::info!(session = %session.id(), msg = %req.msg, "echo request");
            if let Err(err) = session.push("chat", &ChatPush { msg: "welcome" }) {
                tracing::warn!(%err, "push failed");
            }
            if let Err(err) = session.respond(&req, &EchoReply { msg: req.msg.clone() }) {
                tracing::warn!(%err, "respond failed");
            }
        })?;

    let server = Server::new(router, ServerConfig::default())?;
    let handle = server.bind("127.0.0.1:4590")?;
    tracing::info!(addr = %handle.local_addr(), "echo server running");

    loop {
        std::thread::park();
    }
}
