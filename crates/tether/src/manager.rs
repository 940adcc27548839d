//! Session pool: creation, lookup by id, expiry sweeping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::config::ServerConfig;
use crate::session::Session;

/// Fixed cadence of the expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Owns every live session, indexed by id.
pub struct SessionManager {
    pool: RwLock<HashMap<String, Arc<Session>>>,
    max_delay_msgs: usize,
    expiry_after_disconnect: Duration,
}

impl SessionManager {
    pub(crate) fn new(config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            pool: RwLock::new(HashMap::new()),
            max_delay_msgs: config.max_delay_msgs,
            expiry_after_disconnect: config.expiry_after_disconnect(),
        })
    }

    /// Look up a live session. Closed sessions are removed from the pool
    /// and never returned.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.pool
            .read()
            .expect("session pool poisoned")
            .get(id)
            .cloned()
    }

    /// Create and index a fresh session.
    pub fn create(self: &Arc<Self>) -> Arc<Session> {
        let session = Session::new(self, self.max_delay_msgs);
        self.pool
            .write()
            .expect("session pool poisoned")
            .insert(session.id().to_string(), Arc::clone(&session));
        tracing::debug!(session = %session.short_id(), "session created");
        session
    }

    pub(crate) fn remove(&self, session: &Session) {
        self.pool
            .write()
            .expect("session pool poisoned")
            .remove(session.id());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.read().expect("session pool poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the background sweeper. Dropping or shutting down the
    /// returned handle stops it.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let manager = Arc::clone(self);
        let join = thread::spawn(move || manager.run_sweeper(&shutdown_rx));
        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    fn run_sweeper(&self, shutdown: &Receiver<()>) {
        loop {
            match shutdown.recv_timeout(SWEEP_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => self.sweep(),
            }
        }
    }

    /// Close every session disconnected longer than the expiry window.
    ///
    /// Snapshot first: closing mutates the pool, so the candidates are
    /// collected under the read lock and closed outside it.
    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let pool = self.pool.read().expect("session pool poisoned");
            pool.values()
                .filter(|session| {
                    session
                        .lost_at()
                        .is_some_and(|lost| now.duration_since(lost) >= self.expiry_after_disconnect)
                })
                .cloned()
                .collect()
        };
        for session in expired {
            session.close("lost connection and expired");
        }
    }
}

/// Stops the sweeper thread when shut down (or dropped).
pub struct SweeperHandle {
    shutdown: Sender<()>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn shutdown(self) {
        // Disconnecting the channel wakes the sweeper immediately.
        drop(self.shutdown);
        let _ = self.join.join();
    }
}
