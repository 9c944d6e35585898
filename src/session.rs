//! # Receiver Session
//!
//! This module implements the state machine driving one file download. Each
//! session runs in its own thread and owns every resource of its transfer:
//! the control connection, the multicast data channel, the output file and
//! the block arrival bitmask.
//!
//! ## Session Lifecycle
//!
//! ```text
//! CONNECTING -> HANDSHAKING -> JOINING_GROUP -> RECEIVING -> COMPLETED
//!                                                         -> STOPPED
//!     (any)  ------------------------------------------- -> FAILED
//! ```
//!
//! 1. **Connecting**: open the control connection to the sender, IPv4 or
//!    IPv6 following how the target address resolved
//! 2. **Handshaking**: send the requested filename, read the reply header
//!    (ids, block geometry, file hash, multicast group) under the
//!    acknowledgment timeout
//! 3. **Joining**: bind the shared multicast port, join the group, size the
//!    bitmask, open the output file, acknowledge with `OK`
//! 4. **Receiving**: loop over the data channel, writing new blocks at
//!    `sequence * block_size` and reporting gaps to the sender
//! 5. **Teardown**: one idempotent exit path releases everything, whatever
//!    ended the transfer
//!
//! ## Receive Loop
//!
//! The loop waits on the data channel with the report interval as its read
//! timeout and polls the control channel without blocking once per
//! iteration. Any control-channel readability during the transfer,
//! orderly close included, is treated as a fatal sender-side signal.
//! An idle interval with at least one block already received produces an
//! SRR carrying the current bitmask; every second newly-written block
//! produces one proactively, which bounds how stale the sender's view of
//! this receiver can get between idle timeouts.
//!
//! ## Stop Race
//!
//! An external stop and the session thread both funnel into
//! [`Session::teardown`]. The session lock serializes them: the first
//! caller swaps the resources out and releases them, the loser observes a
//! terminal lifecycle and returns without touching anything. A thread
//! blocked in the bounded wait notices within one report interval.

use std::fs;
use std::fs::File;
use std::io;
use std::io::{Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};

use crate::bitmask::BlockBitmask;
use crate::engine::Config;
use crate::error::SessionError;
use crate::handshake::{self, HandshakeError, HandshakeOutcome, HandshakeReply};
use crate::message::{deserialize_packet, Packet, MAX_DATAGRAM_LEN};
use crate::observer::Observer;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::storage;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Handshaking,
    JoiningGroup,
    Receiving,
    Completed,
    Stopped,
    Failed,
}

impl Lifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Stopped | Lifecycle::Failed
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Connecting => "connecting",
            Lifecycle::Handshaking => "handshaking",
            Lifecycle::JoiningGroup => "joining group",
            Lifecycle::Receiving => "receiving",
            Lifecycle::Completed => "completed",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed => "failed",
        }
    }
}

/// How a transfer ended; selects the terminal lifecycle teardown records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Stopped,
    Failed,
}

impl Disposition {
    fn terminal(self) -> Lifecycle {
        match self {
            Disposition::Completed => Lifecycle::Completed,
            Disposition::Stopped => Lifecycle::Stopped,
            Disposition::Failed => Lifecycle::Failed,
        }
    }
}

/// Why the receive loop returned without an error.
enum LoopEnd {
    /// Every block arrived; the file is complete.
    Completed,
    /// The sender broadcast a STOP for this session.
    SenderStopped,
}

/// Snapshot of a session for display.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub peer: SocketAddr,
    pub filename: String,
    pub state: &'static str,
    pub blocks_received: usize,
    pub blocks_total: usize,
}

/// Everything teardown has to release, plus the negotiated parameters.
/// Guarded by the session lock; the session thread performs its blocking
/// waits on cloned descriptors so these canonical handles stay reachable
/// for an external stop.
struct SessionState {
    lifecycle: Lifecycle,
    control: Option<TcpStream>,
    data: Option<UdpSocket>,
    output: Option<File>,
    output_path: Option<PathBuf>,
    /// The sender's data-channel address, learned from the first inbound
    /// datagram; destination for SRR and EXIT.
    sender_addr: Option<SocketAddr>,
    reply: Option<HandshakeReply>,
    bitmask: Option<BlockBitmask>,
}

/// Decides when the receive loop owes the sender a proactive status
/// report: counts newly-written blocks and trips once the threshold is
/// reached, then rearms. Duplicates never advance the count.
struct Reporter {
    threshold: u32,
    newly_written: u32,
}

impl Reporter {
    fn new(threshold: u32) -> Reporter {
        Reporter {
            threshold,
            newly_written: 0,
        }
    }

    fn on_block_written(&mut self) {
        self.newly_written = self.newly_written.saturating_add(1);
    }

    /// Whether a proactive report is due; consumes the accumulated count.
    fn take_due(&mut self) -> bool {
        if self.threshold > 0 && self.newly_written >= self.threshold {
            self.newly_written = 0;
            true
        } else {
            false
        }
    }
}

/// One in-progress file download.
pub struct Session {
    handle: SessionHandle,
    filename: String,
    /// Resolved sender endpoint; its family decides the session's transport.
    target: SocketAddr,
    config: Config,
    registry: Arc<SessionRegistry>,
    observer: Observer,
    state: Mutex<SessionState>,
    /// Log prefix, like `RCV(3)>`.
    tag: String,
}

impl Session {
    /// Build a session descriptor. The caller registers it and starts its
    /// thread; nothing touches the network until [`Session::run`].
    pub fn new(
        handle: SessionHandle,
        filename: String,
        target: SocketAddr,
        config: Config,
        registry: Arc<SessionRegistry>,
        observer: Observer,
    ) -> Arc<Session> {
        Arc::new(Session {
            tag: format!("RCV({})>", handle),
            handle,
            filename,
            target,
            config,
            registry,
            observer,
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Connecting,
                control: None,
                data: None,
                output: None,
                output_path: None,
                sender_addr: None,
                reply: None,
                bitmask: None,
            }),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    #[allow(dead_code)]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().unwrap().lifecycle
    }

    /// Snapshot for UI display.
    pub fn info(&self) -> SessionInfo {
        let st = self.state.lock().unwrap();
        SessionInfo {
            handle: self.handle,
            peer: self.target,
            filename: self.filename.clone(),
            state: st.lifecycle.name(),
            blocks_received: st.bitmask.as_ref().map(BlockBitmask::count).unwrap_or(0),
            blocks_total: st.bitmask.as_ref().map(BlockBitmask::bit_count).unwrap_or(0),
        }
    }

    /// Externally requested stop: tear down with exit+delete semantics.
    /// Returns whether this call performed the teardown (false when the
    /// session had already reached a terminal state).
    pub fn stop(&self) -> bool {
        let performed = self.teardown(Disposition::Stopped, true, true);
        if performed {
            info!("{} stopped by request", self.tag);
        }
        performed
    }

    /// The session thread body: drive the transfer, then route whatever
    /// ended it into the single teardown path. Never panics out and never
    /// leaves without reaching teardown.
    pub fn run(&self) {
        self.observer
            .session_started(self.handle, self.target, &self.filename);
        info!(
            "{} started receiver task (file='{}', sender={})",
            self.tag, self.filename, self.target
        );
        let started = Instant::now();

        match self.transfer() {
            Ok(LoopEnd::Completed) => {
                self.observer
                    .log(format!("{} all blocks received", self.tag));
                self.teardown(Disposition::Completed, true, false);
                self.verify_download(started);
            }
            Ok(LoopEnd::SenderStopped) => {
                self.observer
                    .log(format!("{} sender stopped the transfer", self.tag));
                self.teardown(Disposition::Stopped, true, true);
            }
            Err(SessionError::Cancelled) => {
                // The stop request already ran teardown; this call observes
                // the terminal state and returns harmlessly.
                self.teardown(Disposition::Stopped, true, true);
            }
            Err(err) => {
                self.observer.log(format!("{} {}", self.tag, err));
                warn!("{} transfer failed: {}", self.tag, err);
                let (send_exit, delete_file) = err.teardown_policy();
                self.teardown(Disposition::Failed, send_exit, delete_file);
            }
        }
    }

    /// Connect, handshake, join the group and run the receive loop.
    fn transfer(&self) -> Result<LoopEnd, SessionError> {
        // Open the control connection; the target's family (fixed at
        // resolution, IPv6 preferred) decides the transport everywhere.
        let control = TcpStream::connect_timeout(&self.target, self.config.connect_timeout)
            .map_err(SessionError::Connect)?;
        let mut control_local = control.try_clone().map_err(SessionError::Transport)?;
        self.advance(Lifecycle::Handshaking, move |st| st.control = Some(control))?;
        info!("{} connected to {}", self.tag, self.target);

        // Request the file and read the reply header under the
        // acknowledgment timeout.
        control_local
            .write_all(&handshake::serialize_request(&self.filename))
            .map_err(|e| SessionError::HandshakeFailed(format!("could not send request: {}", e)))?;
        control_local
            .set_read_timeout(Some(self.config.handshake_timeout))
            .map_err(SessionError::Transport)?;
        let reply = match handshake::read_reply(&mut control_local, self.target.is_ipv4()) {
            Ok(HandshakeOutcome::Accepted(reply)) => reply,
            Ok(HandshakeOutcome::Rejected { client_id, reason }) => {
                debug!("{} sender rejected request (CID={})", self.tag, client_id);
                return Err(SessionError::FileNotFoundOnSender { reason });
            }
            Err(HandshakeError::Timeout) => return Err(SessionError::HandshakeTimeout),
            Err(err) => return Err(SessionError::HandshakeFailed(err.to_string())),
        };
        debug!(
            "{} handshake reply (CID={}, SID={}, BL_S={}, N_BL={}, F_LEN={}, HASH={:#010x}, group={}:{})",
            self.tag,
            reply.client_id,
            reply.session_id,
            reply.block_size,
            reply.block_count,
            reply.file_length,
            reply.file_hash,
            reply.group_addr,
            reply.group_port
        );

        // Bind the shared multicast port and join the group.
        self.advance(Lifecycle::JoiningGroup, |_| {})?;
        let data = open_data_channel(reply.group_addr, reply.group_port)
            .map_err(SessionError::GroupJoin)?;
        data.set_read_timeout(Some(self.config.report_interval))
            .map_err(SessionError::Transport)?;
        let data_local = data.try_clone().map_err(SessionError::Transport)?;

        // Size the bitmask and open the destination file.
        let bitmask = BlockBitmask::create(reply.block_count)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        if let Some(dir) = &self.config.output_dir {
            storage::ensure_directory(dir)?;
        }
        let path = storage::output_path(
            self.config.output_dir.as_deref(),
            self.handle,
            &self.filename,
        );
        let output = storage::open_for_write(&path)?;
        self.observer.log(format!(
            "{} storing data in file '{}'",
            self.tag,
            path.display()
        ));

        self.advance(Lifecycle::Receiving, move |st| {
            st.data = Some(data);
            st.output = Some(output);
            st.output_path = Some(path);
            st.reply = Some(reply);
            st.bitmask = Some(bitmask);
        })?;

        // Tell the sender we are ready for data.
        control_local
            .write_all(b"OK")
            .map_err(SessionError::Transport)?;
        debug!("{} sent OK acknowledgment", self.tag);

        self.receive_loop(&control_local, &data_local)
    }

    /// The RECEIVING loop: a bounded wait on the data channel (timeout =
    /// report interval) with a non-blocking control-channel poll each
    /// iteration.
    fn receive_loop(
        &self,
        control: &TcpStream,
        data: &UdpSocket,
    ) -> Result<LoopEnd, SessionError> {
        control
            .set_nonblocking(true)
            .map_err(SessionError::Transport)?;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut reporter = Reporter::new(self.config.report_block_threshold);
        debug!(
            "{} entering receive loop (report interval {:?})",
            self.tag, self.config.report_interval
        );

        loop {
            if !self.is_receiving() {
                return Err(SessionError::Cancelled);
            }

            // Any control-channel readability mid-transfer is a fatal
            // sender-side signal, orderly close included.
            let mut probe = [0u8; 1];
            match control.peek(&mut probe) {
                Ok(_) => return Err(SessionError::SenderClosed),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(SessionError::Transport(e)),
            }

            match data.recv_from(&mut buf) {
                Ok((len, src)) => {
                    self.note_sender(src);
                    match deserialize_packet(&buf[..len]) {
                        Ok(packet) => {
                            if let Some(end) = self.handle_packet(packet, &mut reporter)? {
                                return Ok(end);
                            }
                        }
                        Err(err) => {
                            warn!(
                                "{} dropping malformed datagram from {}: {}",
                                self.tag, src, err
                            );
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    // Idle interval. Report the gaps, but only once at least
                    // one block has arrived; before that the sender's
                    // address is not known yet.
                    let pending = {
                        let st = self.state.lock().unwrap();
                        st.bitmask.as_ref().is_some_and(|m| !m.is_empty())
                    };
                    if pending {
                        debug!("{} report interval expired - sending SRR", self.tag);
                        self.send_report().map_err(SessionError::Transport)?;
                    }
                }
                Err(e) => return Err(SessionError::Transport(e)),
            }
        }
    }

    /// Dispatch one decoded datagram.
    fn handle_packet(
        &self,
        packet: Packet,
        reporter: &mut Reporter,
    ) -> Result<Option<LoopEnd>, SessionError> {
        match packet {
            Packet::Data {
                session_id,
                sequence,
                payload,
            } => self.handle_data(session_id, sequence, &payload, reporter),
            Packet::Stop { session_id } => {
                if self.matches_session(session_id) {
                    info!("{} received STOP (SID={})", self.tag, session_id);
                    Ok(Some(LoopEnd::SenderStopped))
                } else {
                    debug!("{} ignoring STOP for foreign session {}", self.tag, session_id);
                    Ok(None)
                }
            }
            // Other receivers' reports and exits share the group; not ours
            // to act on.
            Packet::StatusReport { .. } | Packet::Exit { .. } => Ok(None),
        }
    }

    /// Process one DATA block: write it at `sequence * block_size` if new,
    /// update the bitmask, report progress, and honor the report cadence.
    fn handle_data(
        &self,
        session_id: i16,
        sequence: i32,
        payload: &[u8],
        reporter: &mut Reporter,
    ) -> Result<Option<LoopEnd>, SessionError> {
        // Decisions are made under the session lock; sends and observer
        // traffic happen after it is released.
        let mut out_of_range = false;
        let mut progress = None;
        let mut completed = false;
        {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            if st.lifecycle != Lifecycle::Receiving {
                return Err(SessionError::Cancelled);
            }
            let (Some(reply), Some(bitmask), Some(output)) =
                (st.reply.as_ref(), st.bitmask.as_mut(), st.output.as_mut())
            else {
                return Err(SessionError::Cancelled);
            };

            if session_id != reply.session_id {
                debug!(
                    "{} ignoring DATA for foreign session {} (seq={})",
                    self.tag, session_id, sequence
                );
                return Ok(None);
            }

            match bitmask.is_set(sequence as i64) {
                Err(_) => out_of_range = true,
                Ok(true) => {
                    debug!("{} duplicate block {}", self.tag, sequence);
                }
                Ok(false) => {
                    let offset = sequence as u64 * reply.block_size as u64;
                    output
                        .seek(SeekFrom::Start(offset))
                        .map_err(SessionError::Transport)?;
                    output.write_all(payload).map_err(SessionError::Transport)?;
                    bitmask
                        .set(sequence as i64)
                        .expect("sequence verified in range");
                    reporter.on_block_written();
                    progress = Some((bitmask.count(), bitmask.bit_count()));
                    completed = bitmask.is_complete();
                }
            }
        }

        if out_of_range {
            // Recoverable: tell the sender where we actually are and keep
            // listening.
            warn!("{} invalid block sequence {}", self.tag, sequence);
            self.observer.log(format!(
                "{} invalid block sequence {} - reporting",
                self.tag, sequence
            ));
            if let Err(e) = self.send_report() {
                warn!("{} could not send SRR: {}", self.tag, e);
            }
            return Ok(None);
        }

        if let Some((received, total)) = progress {
            self.observer.progress(self.handle, received, total);
        }

        if completed {
            return Ok(Some(LoopEnd::Completed));
        }

        // Proactive cadence: an SRR after every threshold of new blocks
        // bounds the staleness of the sender's view. Best-effort, like the
        // out-of-range report; only the idle-timeout report is load-bearing.
        if progress.is_some() && reporter.take_due() {
            if let Err(e) = self.send_report() {
                warn!("{} could not send SRR: {}", self.tag, e);
            }
        }

        Ok(None)
    }

    /// Send the current bitmask to the sender's learned address.
    fn send_report(&self) -> io::Result<()> {
        let st = self.state.lock().unwrap();
        let (Some(data), Some(addr), Some(reply), Some(bitmask)) = (
            st.data.as_ref(),
            st.sender_addr,
            st.reply.as_ref(),
            st.bitmask.as_ref(),
        ) else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "sender address not yet known",
            ));
        };

        let bytes = Packet::StatusReport {
            session_id: reply.session_id,
            client_id: reply.client_id,
            mask: bitmask.to_wire_bytes(),
        }
        .serialize();
        let sent = data.send_to(&bytes, addr)?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short SRR datagram write",
            ));
        }
        info!(
            "{} sent SRR(SID={}, CID={}, M={}) to {}",
            self.tag,
            reply.session_id,
            reply.client_id,
            bitmask.summary(),
            addr
        );
        Ok(())
    }

    /// The single exit path. Marks the terminal state, optionally notifies
    /// the sender, releases every resource, deregisters, and reports the
    /// end to the observer. Returns whether this call performed the work;
    /// a second call (the stop race's loser) observes the terminal state
    /// and returns `false` without touching anything.
    pub fn teardown(&self, disposition: Disposition, send_exit: bool, delete_file: bool) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.lifecycle.is_terminal() {
            return false;
        }
        st.lifecycle = disposition.terminal();
        debug!(
            "{} teardown({}, send_exit={}, delete_file={})",
            self.tag,
            st.lifecycle.name(),
            send_exit,
            delete_file
        );

        if send_exit {
            self.send_exit_locked(&st);
        }

        // Control channel, with the END marker when we announced our exit.
        if let Some(mut control) = st.control.take() {
            if send_exit {
                let _ = control.write_all(b"END\0");
            }
            let _ = control.shutdown(Shutdown::Both);
        }

        // Output file, removed from disk unless the transfer completed.
        if let Some(output) = st.output.take() {
            drop(output);
            if delete_file {
                if let Some(path) = st.output_path.take() {
                    match fs::remove_file(&path) {
                        Ok(()) => info!("{} removed partial file '{}'", self.tag, path.display()),
                        Err(e) => debug!(
                            "{} could not remove '{}': {}",
                            self.tag,
                            path.display(),
                            e
                        ),
                    }
                }
            }
        }

        st.data = None;
        st.bitmask = None;
        drop(st);

        // Deregister before announcing the end: anyone reacting to the
        // event must no longer find the session.
        self.registry.remove(self.handle);
        self.observer.session_ended(self.handle);
        true
    }

    /// Best-effort EXIT datagram to the sender; a session that never
    /// learned the sender's address has nobody to notify.
    fn send_exit_locked(&self, st: &SessionState) {
        let (Some(data), Some(addr), Some(reply)) =
            (st.data.as_ref(), st.sender_addr, st.reply.as_ref())
        else {
            return;
        };
        let bytes = Packet::Exit {
            session_id: reply.session_id,
            client_id: reply.client_id,
        }
        .serialize();
        match data.send_to(&bytes, addr) {
            Ok(_) => info!(
                "{} sent EXIT(SID={}, CID={}) to {}",
                self.tag, reply.session_id, reply.client_id, addr
            ),
            Err(e) => warn!("{} could not send EXIT: {}", self.tag, e),
        }
    }

    /// After a completed teardown: recompute the file hash and log the
    /// outcome with the transfer duration.
    fn verify_download(&self, started: Instant) {
        let (path, expected) = {
            let st = self.state.lock().unwrap();
            (
                st.output_path.clone(),
                st.reply.as_ref().map(|r| r.file_hash),
            )
        };
        let (Some(path), Some(expected)) = (path, expected) else {
            return;
        };
        let elapsed = started.elapsed();
        match storage::file_hash(&path) {
            Ok(actual) if actual == expected => {
                self.observer.log(format!(
                    "{} transfer complete in {:.1}s, hash {:#010x} verified",
                    self.tag,
                    elapsed.as_secs_f64(),
                    actual
                ));
            }
            Ok(actual) => {
                warn!(
                    "{} hash mismatch: sender reported {:#010x}, file has {:#010x}",
                    self.tag, expected, actual
                );
                self.observer.log(format!(
                    "{} transfer complete in {:.1}s, but hash mismatch (expected {:#010x}, computed {:#010x})",
                    self.tag,
                    elapsed.as_secs_f64(),
                    expected,
                    actual
                ));
            }
            Err(e) => warn!("{} could not verify file hash: {}", self.tag, e),
        }
    }

    /// Move to `next` after applying `apply`, unless an external stop
    /// already made the session terminal.
    fn advance(
        &self,
        next: Lifecycle,
        apply: impl FnOnce(&mut SessionState),
    ) -> Result<(), SessionError> {
        let mut st = self.state.lock().unwrap();
        if st.lifecycle.is_terminal() {
            return Err(SessionError::Cancelled);
        }
        apply(&mut st);
        st.lifecycle = next;
        debug!("{} -> {}", self.tag, next.name());
        Ok(())
    }

    fn is_receiving(&self) -> bool {
        self.state.lock().unwrap().lifecycle == Lifecycle::Receiving
    }

    fn matches_session(&self, session_id: i16) -> bool {
        let st = self.state.lock().unwrap();
        st.reply
            .as_ref()
            .is_some_and(|r| r.session_id == session_id)
    }

    /// Record the sender's address from the first inbound datagram.
    fn note_sender(&self, src: SocketAddr) {
        let mut st = self.state.lock().unwrap();
        if st.sender_addr.is_none() {
            info!("{} learned sender data address {}", self.tag, src);
            st.sender_addr = Some(src);
        }
    }
}

/// Bind the wildcard address of the group's family on the shared multicast
/// port and join the group. A non-multicast group address is accepted
/// without a membership call: datagrams addressed to the bound port still
/// arrive.
fn open_data_channel(group: IpAddr, port: u16) -> io::Result<UdpSocket> {
    let domain = match group {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    // Receivers on one host share the multicast port
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = match group {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, port).into(),
    };
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();

    match group {
        IpAddr::V4(addr) if addr.is_multicast() => {
            socket.join_multicast_v4(&addr, &Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(addr) if addr.is_multicast() => {
            socket.join_multicast_v6(&addr, 0)?;
        }
        other => {
            debug!("group address {} is not multicast; skipping membership", other);
        }
    }
    Ok(socket)
}
