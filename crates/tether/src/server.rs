//! Server facade: accepts transports and wires connection engines to the
//! session manager and route table.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, ServerConfig};
use crate::conn::Conn;
use crate::manager::{SessionManager, SweeperHandle};
use crate::route::Router;
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Holds the route table, the session manager and the connection-id
/// counter. Route registration happens before construction; the server is
/// immutable afterwards and shared behind an `Arc`.
pub struct Server {
    config: ServerConfig,
    router: Router,
    sessions: Arc<SessionManager>,
    next_conn_id: AtomicU32,
}

impl Server {
    pub fn new(router: Router, config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        let sessions = SessionManager::new(&config);
        Ok(Arc::new(Self {
            config,
            router,
            sessions,
            next_conn_id: AtomicU32::new(0),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn next_conn_id(&self) -> u32 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drive one accepted transport to completion.
    ///
    /// Blocks until the connection finishes; embedders (a WebSocket
    /// upgrade layer, the TCP listener below) call this once per accepted
    /// stream, each on its own thread.
    pub fn serve(self: &Arc<Self>, transport: Box<dyn Transport>) {
        let conn = match Conn::new(Arc::clone(self), transport) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(%err, "transport setup failed");
                return;
            }
        };
        tracing::debug!(conn = conn.id(), peer = %conn.peer(), "connection accepted");
        conn.handle();
    }

    /// Bind a plain-TCP listener, start the expiry sweeper, and accept
    /// connections on a background thread until the handle is shut down.
    pub fn bind(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let sweeper = self.sessions.spawn_sweeper();

        let server = Arc::clone(self);
        let accept_shutdown = Arc::clone(&shutdown);
        let join = thread::Builder::new()
            .name("tether-accept".to_string())
            .spawn(move || run_accept_loop(&listener, &server, &accept_shutdown))?;

        tracing::info!(%local_addr, "server listening");
        Ok(ServerHandle {
            shutdown,
            join,
            sweeper,
            local_addr,
        })
    }
}

/// Owns the accept loop and the sweeper started by [`Server::bind`].
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    sweeper: SweeperHandle,
    local_addr: SocketAddr,
}

impl ServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and stop the sweeper. Connections already
    /// established keep running until their transports finish.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
        self.sweeper.shutdown();
    }
}

fn run_accept_loop(listener: &TcpListener, server: &Arc<Server>, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    tracing::warn!(%err, "accepted stream failed to set blocking");
                    continue;
                }
                let server = Arc::clone(server);
                let spawned = thread::Builder::new()
                    .name("tether-conn".to_string())
                    .spawn(move || server.serve(Box::new(stream)));
                if let Err(err) = spawned {
                    tracing::error!(%err, "connection thread spawn failed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}
