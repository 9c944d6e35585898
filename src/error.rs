//! # Session Error Taxonomy
//!
//! Fatal conditions a receiver session can end with. Every variant funnels
//! into the single teardown path; the `(send_exit, delete_file)` policy for
//! each one lives in [`SessionError::teardown_policy`].
//!
//! Recoverable conditions are deliberately *not* here: a malformed datagram
//! ([`crate::message::WireError`]) is logged and dropped, and an
//! out-of-range block sequence is logged and answered with an immediate
//! status report. Neither ends the session.

use std::io;

use thiserror::Error;

use crate::storage::StorageError;

/// A fatal session condition.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The download request was rejected before a session was created.
    #[error("invalid download request: {0}")]
    InvalidRequest(String),

    /// The target host name did not resolve to any usable address.
    #[error("unknown destination '{0}'")]
    UnknownDestination(String),

    /// The control-channel connection to the sender could not be opened.
    #[error("could not connect to sender: {0}")]
    Connect(#[source] io::Error),

    /// The sender did not answer the handshake within the acknowledgment
    /// timeout.
    #[error("timed out waiting for the sender's handshake reply")]
    HandshakeTimeout,

    /// The handshake reply was short, unreadable or carried invalid fields.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The sender answered with a negative client id: it does not serve the
    /// requested file. Reported to the operator, not treated as a transport
    /// fault.
    #[error("sender does not have the requested file{}", reason_suffix(.reason))]
    FileNotFoundOnSender { reason: String },

    /// The multicast data channel could not be created or the group could
    /// not be joined.
    #[error("could not join the multicast group: {0}")]
    GroupJoin(#[source] io::Error),

    /// The output file (or its directory) could not be prepared.
    #[error(transparent)]
    FileOpen(#[from] StorageError),

    /// The sender closed or signaled on the control channel mid-transfer.
    #[error("sender closed the control channel")]
    SenderClosed,

    /// A send or receive on an established channel failed, or the output
    /// file could not be written.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    /// The session was stopped from outside before it finished.
    #[error("download stopped by request")]
    Cancelled,
}

impl SessionError {
    /// The `(send_exit, delete_file)` flags teardown runs with when the
    /// session fails with this error.
    ///
    /// Failures before the data channel and output file exist leave nothing
    /// to announce or delete; everything later notifies the sender and
    /// removes the partial file.
    pub fn teardown_policy(&self) -> (bool, bool) {
        match self {
            SessionError::InvalidRequest(_)
            | SessionError::UnknownDestination(_)
            | SessionError::Connect(_)
            | SessionError::HandshakeTimeout
            | SessionError::HandshakeFailed(_)
            | SessionError::FileNotFoundOnSender { .. } => (false, false),
            SessionError::GroupJoin(_) => (true, true),
            SessionError::FileOpen(_) => (true, false),
            SessionError::SenderClosed
            | SessionError::Transport(_)
            | SessionError::Cancelled => (true, true),
        }
    }
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {}", reason)
    }
}
