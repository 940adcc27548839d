//! Per-transport connection engine: state machine, read and write
//! workers, heartbeat tick.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded, tick};
use crossbeam::select;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tether_proto::{Message, MessageError, Packet, PacketDecoder, PacketError, PacketType};

use crate::server::Server;
use crate::session::Session;
use crate::transport::Transport;

/// Scratch buffer for each transport read.
const READ_BUF_LEN: usize = 2048;

/// Pre-encoded body-less frames: type byte plus a zero 24-bit length.
const HEARTBEAT_FRAME: [u8; 4] = [PacketType::Heartbeat as u8, 0, 0, 0];
const CLOSE_FRAME: [u8; 4] = [PacketType::Close as u8, 0, 0, 0];

/// Progresses monotonically; Closed is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnStatus {
    Created,
    Handshake,
    Working,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection is not in working status")]
    InvalidStatus,
    #[error("write queue is full")]
    QueueFull,
    #[error("unexpected {packet:?} packet in {status:?} status")]
    UnexpectedPacket {
        packet: PacketType,
        status: ConnStatus,
    },
    #[error("invalid handshake payload: {0}")]
    HandshakeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeRequest {
    #[serde(default)]
    sid: String,
}

#[derive(Debug, Serialize)]
struct HandshakeReply<'a> {
    code: u16,
    hb: u64,
    sid: &'a str,
}

/// One accepted transport.
///
/// The connection is the ephemeral half of the session/connection pair:
/// it owns the wire, the session owns the identity. Three activities
/// cooperate per connection: a read worker (runs the state machine and
/// dispatches), a write worker (drains the bounded frame queue), and the
/// heartbeat tick multiplexed into the write worker.
pub struct Conn {
    id: u32,
    peer: String,
    server: Arc<Server>,
    status: Mutex<ConnStatus>,
    session: Mutex<Option<Arc<Session>>>,
    write_tx: Sender<Vec<u8>>,
    write_rx: Mutex<Option<Receiver<Vec<u8>>>>,
    reader: Mutex<Option<Box<dyn Transport>>>,
    writer: Mutex<Option<Box<dyn Transport>>>,
    cancel_read: AtomicBool,
}

impl Conn {
    pub(crate) fn new(server: Arc<Server>, transport: Box<dyn Transport>) -> std::io::Result<Arc<Self>> {
        let reader = transport.try_clone()?;
        let (write_tx, write_rx) = bounded(server.config().write_queue_capacity);
        Ok(Arc::new(Self {
            id: server.next_conn_id(),
            peer: transport.peer_addr(),
            server,
            status: Mutex::new(ConnStatus::Created),
            session: Mutex::new(None),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(transport)),
            cancel_read: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn status(&self) -> ConnStatus {
        *self.lock_status()
    }

    fn lock_status(&self) -> MutexGuard<'_, ConnStatus> {
        self.status.lock().expect("conn status poisoned")
    }

    /// Move to `next` unless the connection already closed.
    fn advance_status(&self, next: ConnStatus) -> bool {
        let mut status = self.lock_status();
        if *status == ConnStatus::Closed {
            return false;
        }
        *status = next;
        true
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().expect("conn session poisoned").clone()
    }

    pub(crate) fn clear_session(&self) {
        self.session.lock().expect("conn session poisoned").take();
    }

    /// Encode `msg` and enqueue one pre-framed Data packet. Never blocks:
    /// a full queue is surfaced as [`ConnError::QueueFull`].
    pub fn write_msg(&self, msg: &Message) -> Result<(), ConnError> {
        if self.status() != ConnStatus::Working {
            return Err(ConnError::InvalidStatus);
        }
        let payload = msg.encode()?;
        let frame = Packet::new(PacketType::Data, payload).encode()?;
        self.send_frame(frame)
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnError> {
        match self.write_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ConnError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ConnError::InvalidStatus),
        }
    }

    /// Idempotent transition to Closed: detaches the session, cancels the
    /// read worker, and queues a Close notice for the peer if the queue
    /// has room. The transport itself is released by [`Conn::handle`]
    /// after both workers exit.
    pub fn close(&self, reason: &str) {
        {
            let mut status = self.lock_status();
            if *status == ConnStatus::Closed {
                tracing::debug!(conn = self.id, reason, "close on closed connection");
                return;
            }
            *status = ConnStatus::Closed;
        }
        tracing::debug!(conn = self.id, peer = %self.peer, reason, "connection closed");

        if let Some(session) = self.session.lock().expect("conn session poisoned").take() {
            session.lost_conn(self);
        }

        self.cancel_read.store(true, Ordering::Release);
        let _ = self.write_tx.try_send(CLOSE_FRAME.to_vec());
    }

    /// Run the connection to completion: spawn the write worker, run the
    /// read worker on the calling thread, then finalize: idempotent
    /// close, single transport release.
    pub fn handle(self: &Arc<Self>) {
        let reader = self.reader.lock().expect("conn reader poisoned").take();
        let writer = self.writer.lock().expect("conn writer poisoned").take();
        let write_rx = self.write_rx.lock().expect("conn write rx poisoned").take();
        let (Some(reader), Some(writer), Some(write_rx)) = (reader, writer, write_rx) else {
            tracing::warn!(conn = self.id, "handle called twice");
            return;
        };

        let ticker = tick(self.server.config().heartbeat_interval());
        let conn = Arc::clone(self);
        let write_worker = thread::Builder::new()
            .name(format!("tether-write-{}", self.id))
            .spawn(move || conn.write_worker(writer, &write_rx, &ticker));
        let write_worker = match write_worker {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(conn = self.id, %err, "write worker spawn failed");
                self.close("write worker spawn failed");
                return;
            }
        };

        self.read_worker(reader);
        if self.status() != ConnStatus::Closed {
            self.close("read worker exited");
        }

        if let Ok(transport) = write_worker.join() {
            transport.shutdown();
        }
        tracing::debug!(conn = self.id, "connection finalized");
    }

    /// Drains the frame queue into the transport; multiplexes the
    /// heartbeat tick into the same queue. Returns the transport so the
    /// finalizer can release it exactly once.
    fn write_worker(
        &self,
        mut transport: Box<dyn Transport>,
        write_rx: &Receiver<Vec<u8>>,
        ticker: &Receiver<std::time::Instant>,
    ) -> Box<dyn Transport> {
        loop {
            select! {
                recv(ticker) -> _ => {
                    // A saturated queue already has traffic pending; the
                    // beat is skipped rather than blocked on.
                    let _ = self.write_tx.try_send(HEARTBEAT_FRAME.to_vec());
                }
                recv(write_rx) -> frame => {
                    let Ok(frame) = frame else {
                        return transport;
                    };
                    if let Err(err) = transport.write_all(&frame) {
                        tracing::debug!(conn = self.id, %err, "transport write failed");
                        return transport;
                    }
                    if self.status() == ConnStatus::Closed && write_rx.is_empty() {
                        return transport;
                    }
                }
            }
        }
    }

    /// Reads transport chunks, feeds the streaming decoder, and runs each
    /// packet through the state machine. Any decode error or protocol
    /// violation terminates the worker, which in turn closes the
    /// connection.
    fn read_worker(self: &Arc<Self>, mut transport: Box<dyn Transport>) {
        let mut decoder = PacketDecoder::new(self.server.config().packet_max_size);
        let mut buf = [0u8; READ_BUF_LEN];
        loop {
            if self.cancel_read.load(Ordering::Acquire) {
                return;
            }
            let n = match transport.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(conn = self.id, "transport closed by peer");
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(conn = self.id, %err, "transport read failed");
                    return;
                }
            };
            let packets = match decoder.feed(&buf[..n]) {
                Ok(packets) => packets,
                Err(err) => {
                    tracing::error!(conn = self.id, %err, "packet decode failed");
                    return;
                }
            };
            for packet in &packets {
                if let Err(err) = self.process_packet(packet) {
                    tracing::error!(conn = self.id, %err, "packet rejected");
                    return;
                }
            }
        }
    }

    fn process_packet(self: &Arc<Self>, packet: &Packet) -> Result<(), ConnError> {
        let status = self.status();
        if status == ConnStatus::Closed {
            return Ok(());
        }
        match packet.kind {
            PacketType::Handshake => self.on_handshake(status, packet),
            PacketType::HandshakeAck => self.on_handshake_ack(status),
            PacketType::Data => self.on_data(status, packet),
            // Clients echo our heartbeats; receipt carries no information.
            PacketType::Heartbeat => Ok(()),
            PacketType::Close => {
                match self.current_session() {
                    Some(session) => session.close("closed by client"),
                    None => self.close("close packet from peer"),
                }
                Ok(())
            }
        }
    }

    /// Created → Handshake: resolve the session (resume by id when the
    /// handshake names a live one, create otherwise) and queue the reply.
    /// The session is only referenced here; attachment happens on ack.
    fn on_handshake(&self, status: ConnStatus, packet: &Packet) -> Result<(), ConnError> {
        if status != ConnStatus::Created {
            return Err(ConnError::UnexpectedPacket {
                packet: PacketType::Handshake,
                status,
            });
        }

        let mut session = None;
        if !packet.data.is_empty() {
            let head: HandshakeRequest = serde_json::from_slice(&packet.data)?;
            if !head.sid.is_empty() {
                session = self.server.sessions().get(&head.sid);
            }
        }
        let session = match session {
            Some(session) => {
                tracing::debug!(conn = self.id, session = %session.short_id(), "resuming session");
                session
            }
            None => {
                let session = self.server.sessions().create();
                tracing::debug!(conn = self.id, session = %session.short_id(), "new session");
                session
            }
        };

        let reply = HandshakeReply {
            code: 200,
            hb: self.server.config().heartbeat_secs,
            sid: session.id(),
        };
        let body = serde_json::to_vec(&reply)?;
        let frame = Packet::new(PacketType::Handshake, body).encode()?;
        self.send_frame(frame)?;

        *self.session.lock().expect("conn session poisoned") = Some(session);
        self.advance_status(ConnStatus::Handshake);
        Ok(())
    }

    /// Handshake → Working: commit the attachment. This is the point
    /// where a resumed session displaces its previous connection and
    /// flushes buffered pushes.
    fn on_handshake_ack(self: &Arc<Self>, status: ConnStatus) -> Result<(), ConnError> {
        match status {
            ConnStatus::Handshake => {
                // Working first: the delayed-message flush inside set_conn
                // goes through write_msg, which requires it.
                self.advance_status(ConnStatus::Working);
                if let Some(session) = self.current_session() {
                    session.set_conn(self);
                }
                Ok(())
            }
            ConnStatus::Working => Ok(()),
            _ => Err(ConnError::UnexpectedPacket {
                packet: PacketType::HandshakeAck,
                status,
            }),
        }
    }

    fn on_data(&self, status: ConnStatus, packet: &Packet) -> Result<(), ConnError> {
        if status != ConnStatus::Working {
            return Err(ConnError::UnexpectedPacket {
                packet: PacketType::Data,
                status,
            });
        }
        let msg = Message::decode(packet.data.clone())?;
        tracing::debug!(
            conn = self.id,
            kind = ?msg.kind,
            id = msg.id,
            route = %msg.route,
            "message received"
        );
        if let Some(session) = self.current_session() {
            self.server.router().dispatch(&session, &msg);
        }
        Ok(())
    }
}
