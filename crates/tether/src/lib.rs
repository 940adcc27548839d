//! tether: session-oriented message server core.
//!
//! Clients open an ordered byte stream, handshake to establish or resume a
//! named session, then exchange framed messages (requests, notifications,
//! responses, server pushes) while the server drives liveness with
//! heartbeats. Sessions outlive individual connections: a reconnecting
//! client resumes its session by id and receives, in order, any pushes
//! buffered while it was away.
//!
//! The crate is transport-agnostic: anything implementing
//! [`Transport`] (plain TCP out of the box) can carry the protocol. Wire
//! codecs live in [`tether_proto`], re-exported here as [`proto`].

#![forbid(unsafe_code)]

pub use tether_proto as proto;

pub mod config;
pub mod conn;
pub mod manager;
pub mod route;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::{ConfigError, ServerConfig};
pub use conn::{Conn, ConnError, ConnStatus};
pub use manager::{SessionManager, SweeperHandle};
pub use route::{RequestMeta, RouteError, Router, Scope};
pub use server::{Server, ServerError, ServerHandle};
pub use session::{Session, SessionCloseHook, SessionError};
pub use transport::Transport;
