//! # Transfer Status Observer
//!
//! Sessions report their lifecycle to whatever shell is watching (console,
//! GUI, test harness) through a plain message channel: session tasks hold
//! the sending half, a single UI-owning task drains the receiving half.
//! Sessions never share mutable state with the UI.

use std::net::SocketAddr;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::registry::SessionHandle;

/// One status event from a session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A session began executing.
    SessionStarted {
        handle: SessionHandle,
        peer: SocketAddr,
        filename: String,
    },
    /// A new block was stored.
    Progress {
        handle: SessionHandle,
        blocks_received: usize,
        blocks_total: usize,
    },
    /// The session finished (any terminal state) and released its resources.
    SessionEnded { handle: SessionHandle },
    /// Free-text operator-visible diagnostic line.
    Log { line: String },
}

/// The sending half handed to sessions. Cheap to clone; sends never block
/// and are silently dropped once the observer side is gone.
#[derive(Debug, Clone)]
pub struct Observer {
    tx: Sender<TransferEvent>,
}

impl Observer {
    pub fn session_started(&self, handle: SessionHandle, peer: SocketAddr, filename: &str) {
        let _ = self.tx.send(TransferEvent::SessionStarted {
            handle,
            peer,
            filename: filename.to_string(),
        });
    }

    pub fn progress(&self, handle: SessionHandle, blocks_received: usize, blocks_total: usize) {
        let _ = self.tx.send(TransferEvent::Progress {
            handle,
            blocks_received,
            blocks_total,
        });
    }

    pub fn session_ended(&self, handle: SessionHandle) {
        let _ = self.tx.send(TransferEvent::SessionEnded { handle });
    }

    pub fn log(&self, line: impl Into<String>) {
        let _ = self.tx.send(TransferEvent::Log { line: line.into() });
    }
}

/// Create the observer channel: the `Observer` goes to the engine and its
/// sessions, the `Receiver` to the task that owns the display.
pub fn channel() -> (Observer, Receiver<TransferEvent>) {
    let (tx, rx) = unbounded();
    (Observer { tx }, rx)
}
