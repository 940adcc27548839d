//! Session: the durable identity that outlives any single connection.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use tether_proto::{Message, MessageType};

use crate::conn::Conn;
use crate::manager::SessionManager;
use crate::route::RequestMeta;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("delay buffer full: {max} messages already buffered")]
    DelayBufferFull { max: usize },
    #[error("payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Conn(#[from] crate::conn::ConnError),
}

/// Close notification for values attached to a session.
///
/// Values that need to observe the session's end are stored with
/// [`Session::set_with_close_hook`]; plain [`Session::set`] values are
/// released silently.
pub trait SessionCloseHook: Send + Sync {
    fn on_session_close(&self, session: &Session);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionStatus {
    Normal,
    Closed,
}

struct SessionState {
    status: SessionStatus,
    conn: Option<Arc<Conn>>,
    /// Set whenever no connection is attached; the sweeper expires
    /// sessions whose disconnection outlives the configured window.
    lost_at: Option<Instant>,
    delayed: Vec<Message>,
}

/// A logical client identity addressed by a v4 UUID.
///
/// At most one connection is attached at a time. While detached, writes
/// buffer into a bounded delay queue that is flushed in order when a
/// reconnecting client resumes the session.
pub struct Session {
    id: String,
    manager: Weak<SessionManager>,
    max_delay_msgs: usize,
    state: Mutex<SessionState>,
    data: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    close_hooks: Mutex<Vec<Arc<dyn SessionCloseHook>>>,
}

impl Session {
    /// A new session starts detached: `lost_at` is set so a client that
    /// handshakes but never acks cannot park the session forever.
    pub(crate) fn new(manager: &Arc<SessionManager>, max_delay_msgs: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            manager: Arc::downgrade(manager),
            max_delay_msgs,
            state: Mutex::new(SessionState {
                status: SessionStatus::Normal,
                conn: None,
                lost_at: Some(Instant::now()),
                delayed: Vec::new(),
            }),
            data: RwLock::new(HashMap::new()),
            close_hooks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Leading id fragment used in log lines.
    pub(crate) fn short_id(&self) -> &str {
        &self.id[..8]
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().status == SessionStatus::Closed
    }

    /// Whether a connection is currently attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.lock_state().conn.is_some()
    }

    pub(crate) fn lost_at(&self) -> Option<Instant> {
        self.lock_state().lost_at
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }

    /// Queue a push on `route`, JSON-encoding `value`.
    pub fn push<T: Serialize + ?Sized>(&self, route: &str, value: &T) -> Result<(), SessionError> {
        self.write(
            MessageType::Push,
            0,
            route,
            Bytes::from(serde_json::to_vec(value)?),
        )
    }

    /// Queue a push carrying `data` untouched.
    pub fn push_raw(&self, route: &str, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.write(MessageType::Push, 0, route, data.into())
    }

    /// Reply to a request previously decoded through a msg-id sink.
    pub fn respond<T: Serialize + ?Sized>(
        &self,
        req: &impl RequestMeta,
        value: &T,
    ) -> Result<(), SessionError> {
        self.write(
            MessageType::Response,
            req.msg_id(),
            "",
            Bytes::from(serde_json::to_vec(value)?),
        )
    }

    /// Reply to a request with `data` untouched.
    pub fn respond_raw(
        &self,
        req: &impl RequestMeta,
        data: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        self.write(MessageType::Response, req.msg_id(), "", data.into())
    }

    /// Send through the attached connection, or buffer while detached.
    ///
    /// A full delay buffer drops this one message; it does not disconnect
    /// or close anything.
    pub fn write(
        &self,
        kind: MessageType,
        id: u64,
        route: &str,
        data: Bytes,
    ) -> Result<(), SessionError> {
        let msg = Message::new(kind, id, route, data);
        let mut state = self.lock_state();
        if state.status == SessionStatus::Closed {
            return Err(SessionError::Closed);
        }
        if let Some(conn) = state.conn.clone() {
            return Ok(conn.write_msg(&msg)?);
        }
        if state.delayed.len() >= self.max_delay_msgs {
            return Err(SessionError::DelayBufferFull {
                max: self.max_delay_msgs,
            });
        }
        state.delayed.push(msg);
        Ok(())
    }

    /// Attach `conn`, displacing and closing any previously attached
    /// connection, then flush the delay buffer in order (best effort).
    pub(crate) fn set_conn(&self, conn: &Arc<Conn>) {
        let mut state = self.lock_state();
        if state.status != SessionStatus::Normal {
            tracing::warn!(session = %self.short_id(), conn = conn.id(), "attach to closed session ignored");
            return;
        }
        if let Some(current) = &state.conn {
            if Arc::ptr_eq(current, conn) {
                tracing::warn!(session = %self.short_id(), conn = conn.id(), "connection already attached");
                return;
            }
        }
        if let Some(old) = state.conn.take() {
            // Drop the back-reference first so the close below does not
            // re-enter lost_conn on this session.
            old.clear_session();
            old.close("replaced by new connection");
        }

        tracing::debug!(session = %self.short_id(), conn = conn.id(), "connection attached");
        state.conn = Some(Arc::clone(conn));
        state.lost_at = None;

        if !state.delayed.is_empty() {
            tracing::debug!(
                session = %self.short_id(),
                count = state.delayed.len(),
                "flushing delayed messages"
            );
            for msg in state.delayed.drain(..) {
                if let Err(err) = conn.write_msg(&msg) {
                    tracing::warn!(session = %self.short_id(), %err, "delayed message dropped");
                }
            }
        }
    }

    /// Detach `from` if it is still the attached connection and start the
    /// expiry clock.
    pub(crate) fn lost_conn(&self, from: &Conn) {
        let mut state = self.lock_state();
        let Some(current) = &state.conn else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(current), std::ptr::from_ref(from)) {
            return;
        }
        state.conn = None;
        state.lost_at = Some(Instant::now());
        tracing::debug!(session = %self.short_id(), conn = from.id(), "connection lost");
    }

    /// Close the session exactly once: closes the attached connection,
    /// runs close hooks, releases attached data, and removes the session
    /// from its manager. All later writes fail.
    pub fn close(self: &Arc<Self>, reason: &str) {
        let conn = {
            let mut state = self.lock_state();
            if state.status == SessionStatus::Closed {
                return;
            }
            state.status = SessionStatus::Closed;
            state.lost_at = None;
            state.delayed.clear();
            state.conn.take()
        };

        tracing::debug!(session = %self.short_id(), reason, "session closed");

        if let Some(conn) = conn {
            conn.clear_session();
            conn.close("session closed");
        }

        let hooks = std::mem::take(&mut *self.close_hooks.lock().expect("close hooks poisoned"));
        for hook in hooks {
            hook.on_session_close(self);
        }

        self.data.write().expect("session data poisoned").clear();

        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self);
        }
    }

    /// Attach an arbitrary value under `key`.
    pub fn set(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.data
            .write()
            .expect("session data poisoned")
            .insert(key.into(), Arc::new(value));
    }

    /// Attach a value under `key` and register it for close notification.
    pub fn set_with_close_hook<T>(&self, key: impl Into<String>, value: Arc<T>)
    where
        T: SessionCloseHook + Any + Send + Sync,
    {
        self.close_hooks
            .lock()
            .expect("close hooks poisoned")
            .push(Arc::clone(&value) as Arc<dyn SessionCloseHook>);
        self.data
            .write()
            .expect("session data poisoned")
            .insert(key.into(), value as Arc<dyn Any + Send + Sync>);
    }

    /// Fetch the value under `key`, if present and of type `T`.
    #[must_use]
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let data = self.data.read().expect("session data poisoned");
        data.get(key).cloned()?.downcast::<T>().ok()
    }

    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.data
            .read()
            .expect("session data poisoned")
            .contains_key(key)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
