//! # Session Registry
//!
//! Thread-safe table of the active receiver sessions, keyed by an opaque
//! handle. Handles come from a process-wide counter and are never reused,
//! so "is this handle still live" is exactly a table lookup; there is no
//! self-reference or generation field to validate.
//!
//! A single mutex serializes every mutation; `find`/`add`/`remove` never
//! observe a partially-registered session because sessions are registered
//! before their task starts and deregister as the last step of teardown.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::session::Session;

/// Opaque identifier of one active (or past) transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Allocate the next handle. Handles are unique for the life of the
    /// process.
    pub fn next() -> SessionHandle {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionHandle(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The table of active sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionHandle, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        Default::default()
    }

    /// Register a session under its handle.
    pub fn add(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.handle(), session);
    }

    /// Deregister `handle`. Removing an unknown handle is a no-op.
    pub fn remove(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&handle)
    }

    /// Look up a live session.
    pub fn find(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&handle).cloned()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Tear down every registered session, one at a time, notifying each
    /// sender and deleting each partial file.
    ///
    /// The table lock is not held across the teardowns: sessions are
    /// collected first, then stopped, so a session's own deregistration
    /// never contends with the iteration.
    pub fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let table = self.sessions.lock().unwrap();
            table.values().cloned().collect()
        };
        for session in sessions {
            session.stop();
        }
    }
}
