//! # Transfer Engine
//!
//! The control surface a shell (CLI, GUI, tests) drives: start a download,
//! stop one, stop everything, look one up for display. The engine owns the
//! session registry and hands every session the sending half of the
//! observer channel.
//!
//! ## Concurrency
//!
//! Each download runs in its own thread, fully independent of the others.
//! `start_download` registers the session before its thread starts, so a
//! handle returned here is immediately valid for `stop_session` and
//! `lookup_session`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::SessionError;
use crate::observer;
use crate::observer::{Observer, TransferEvent};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{Session, SessionInfo};

/// Tuning knobs for the receiver, with the protocol's stock values as
/// defaults. The timeouts are fixed configuration, not adaptive.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where received files are stored; `None` falls back to names
    /// relative to the working directory.
    pub output_dir: Option<PathBuf>,
    /// Bound on opening the control connection.
    pub connect_timeout: Duration,
    /// Bound on waiting for the handshake reply (request-acknowledgment
    /// timeout).
    pub handshake_timeout: Duration,
    /// Idle bound of the receive loop; an interval without traffic
    /// produces a status report.
    pub report_interval: Duration,
    /// Newly-written blocks per proactive status report.
    pub report_block_threshold: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            output_dir: None,
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(1),
            report_interval: Duration::from_secs(2),
            report_block_threshold: 2,
        }
    }
}

/// Coordinates all receiver sessions of this process.
pub struct Engine {
    config: Config,
    registry: Arc<SessionRegistry>,
    observer: Observer,
}

impl Engine {
    /// Build an engine and the receiving half of its observer channel.
    /// Whatever task owns the receiver is the single owner of the display.
    pub fn new(config: Config) -> (Engine, Receiver<TransferEvent>) {
        let (observer, events) = observer::channel();
        let engine = Engine {
            config,
            registry: Arc::new(SessionRegistry::new()),
            observer,
        };
        (engine, events)
    }

    /// Start downloading `filename` from `host:port`.
    ///
    /// The filename must be a bare name (no path separators) and the port
    /// positive; the host may be a name or literal address, and IPv6 is
    /// preferred when both families resolve. Returns the new session's
    /// handle; the transfer itself proceeds on its own thread and reports
    /// through the observer channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidRequest`] for a bad filename or
    /// port, and [`SessionError::UnknownDestination`] when the host does
    /// not resolve.
    pub fn start_download(
        &self,
        filename: &str,
        host: &str,
        port: u16,
    ) -> Result<SessionHandle, SessionError> {
        if port == 0 {
            return Err(SessionError::InvalidRequest(
                "port must be positive".to_string(),
            ));
        }
        if filename.is_empty() {
            return Err(SessionError::InvalidRequest(
                "filename must not be empty".to_string(),
            ));
        }
        if filename.contains(['/', '\\']) {
            return Err(SessionError::InvalidRequest(format!(
                "filename '{}' must not contain path separators",
                filename
            )));
        }

        let target = resolve_target(host, port)?;
        let handle = SessionHandle::next();
        let session = Session::new(
            handle,
            filename.to_string(),
            target,
            self.config.clone(),
            Arc::clone(&self.registry),
            self.observer.clone(),
        );

        // Registered before the thread starts: the handle is valid for
        // stop/lookup from the moment this returns.
        self.registry.add(Arc::clone(&session));
        let runner = Arc::clone(&session);
        let spawned = thread::Builder::new()
            .name(format!("receiver-{}", handle))
            .spawn(move || runner.run());
        if let Err(e) = spawned {
            self.registry.remove(handle);
            return Err(SessionError::Transport(e));
        }

        info!(
            "session {} downloading '{}' from {} ({})",
            handle, filename, host, target
        );
        Ok(handle)
    }

    /// Stop one session with exit+delete semantics. Returns whether a live
    /// session was actually stopped; stopping an unknown or already-ended
    /// handle is a no-op, not an error.
    pub fn stop_session(&self, handle: SessionHandle) -> bool {
        match self.registry.find(handle) {
            Some(session) => session.stop(),
            None => false,
        }
    }

    /// Stop every active session, one at a time.
    pub fn stop_all(&self) {
        self.registry.stop_all();
    }

    /// Snapshot of a live session for display; `None` once it ended.
    pub fn lookup_session(&self, handle: SessionHandle) -> Option<SessionInfo> {
        self.registry.find(handle).map(|s| s.info())
    }

    /// Number of sessions still registered.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }
}

/// Resolve `host:port`, preferring an IPv6 endpoint and falling back to
/// IPv4 when only that family resolves.
fn resolve_target(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| SessionError::UnknownDestination(host.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv6())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| SessionError::UnknownDestination(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::testutil::{encode_rejection, encode_reply};
    use crate::handshake::HandshakeReply;
    use crate::message::{deserialize_packet, Packet};

    use std::fs;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn scratch_dir(name: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "starling-engine-{}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed),
            name
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            output_dir: Some(dir.to_path_buf()),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(2),
            report_interval: Duration::from_millis(200),
            report_block_threshold: 2,
        }
    }

    /// XOR hash over little-endian u32 words, zero-padded; mirrors what the
    /// sender advertises.
    fn xor_hash(data: &[u8]) -> u32 {
        data.chunks(4).fold(0, |acc, chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            acc ^ u32::from_le_bytes(word)
        })
    }

    fn free_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// A scripted sender on loopback: a control listener plus a data
    /// socket. The advertised "group" is 127.0.0.1, so the receiver binds
    /// the port without a multicast membership and everything stays
    /// hermetic.
    struct SenderFixture {
        listener: TcpListener,
        udp: UdpSocket,
        reply: HandshakeReply,
    }

    impl SenderFixture {
        fn new(block_size: i32, block_count: i32, file_hash: u32) -> SenderFixture {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
            udp.set_read_timeout(Some(WAIT)).unwrap();
            let reply = HandshakeReply {
                client_id: 2,
                session_id: 11,
                file_length: (block_size as u64) * (block_count as u64),
                block_size,
                block_count,
                file_hash,
                group_addr: "127.0.0.1".parse().unwrap(),
                group_port: free_udp_port(),
            };
            SenderFixture {
                listener,
                udp,
                reply,
            }
        }

        fn control_port(&self) -> u16 {
            self.listener.local_addr().unwrap().port()
        }

        /// Accept the receiver's connection, check the requested name,
        /// send the reply header and wait for the OK acknowledgment.
        fn accept_and_greet(&self, expected_name: &str) -> TcpStream {
            let (mut stream, _) = self.listener.accept().unwrap();
            stream.set_read_timeout(Some(WAIT)).unwrap();

            let mut name = vec![];
            let mut byte = [0u8; 1];
            loop {
                stream.read_exact(&mut byte).unwrap();
                if byte[0] == 0 {
                    break;
                }
                name.push(byte[0]);
            }
            assert_eq!(String::from_utf8(name).unwrap(), expected_name);

            stream.write_all(&encode_reply(&self.reply)).unwrap();

            let mut ok = [0u8; 2];
            stream.read_exact(&mut ok).unwrap();
            assert_eq!(&ok, b"OK");
            stream
        }

        fn send_block(&self, sequence: i32, payload: &[u8]) {
            let bytes = Packet::Data {
                session_id: self.reply.session_id,
                sequence,
                payload: payload.to_vec(),
            }
            .serialize();
            self.udp
                .send_to(&bytes, ("127.0.0.1", self.reply.group_port))
                .unwrap();
        }

        fn send_stop(&self, session_id: i16) {
            let bytes = Packet::Stop { session_id }.serialize();
            self.udp
                .send_to(&bytes, ("127.0.0.1", self.reply.group_port))
                .unwrap();
        }

        fn recv_packet(&self) -> Packet {
            let mut buf = [0u8; 9000];
            let (n, _) = self.udp.recv_from(&mut buf).unwrap();
            deserialize_packet(&buf[..n]).unwrap()
        }

        /// Skip interleaved status reports until the receiver's EXIT.
        fn recv_until_exit(&self) -> Packet {
            loop {
                match self.recv_packet() {
                    Packet::StatusReport { .. } => continue,
                    exit @ Packet::Exit { .. } => return exit,
                    other => panic!("unexpected packet from receiver: {:?}", other),
                }
            }
        }
    }

    /// Drain events until the session ends; panics after the global wait.
    fn wait_for_ended(
        rx: &Receiver<TransferEvent>,
        handle: SessionHandle,
    ) -> Vec<TransferEvent> {
        let deadline = Instant::now() + WAIT;
        let mut events = vec![];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for session end");
            let event = rx
                .recv_timeout(remaining)
                .expect("timed out waiting for session end");
            let ended = matches!(&event, TransferEvent::SessionEnded { handle: h } if *h == handle);
            events.push(event);
            if ended {
                return events;
            }
        }
    }

    fn has_progress(events: &[TransferEvent], received: usize, total: usize) -> bool {
        events.iter().any(|e| {
            matches!(e, TransferEvent::Progress { blocks_received, blocks_total, .. }
                if *blocks_received == received && *blocks_total == total)
        })
    }

    #[test]
    fn request_validation_rejects_bad_input() {
        let (engine, _events) = Engine::new(Config::default());
        assert!(matches!(
            engine.start_download("data.bin", "127.0.0.1", 0),
            Err(SessionError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.start_download("", "127.0.0.1", 4000),
            Err(SessionError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.start_download("../secret", "127.0.0.1", 4000),
            Err(SessionError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.start_download("dir\\name", "127.0.0.1", 4000),
            Err(SessionError::InvalidRequest(_))
        ));
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn stopping_an_unknown_handle_is_a_noop() {
        let (engine, _events) = Engine::new(Config::default());
        assert!(!engine.stop_session(SessionHandle::next()));
    }

    #[test]
    fn transfer_completes_and_keeps_the_file() {
        let dir = scratch_dir("complete");
        let blocks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![b'a' + i; 1000]).collect();
        let content: Vec<u8> = blocks.concat();
        let fixture = SenderFixture::new(1000, 4, xor_hash(&content));

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("data.bin", "127.0.0.1", fixture.control_port())
            .unwrap();

        let mut control = fixture.accept_and_greet("data.bin");
        for (i, block) in blocks.iter().enumerate() {
            fixture.send_block(i as i32, block);
        }

        let seen = wait_for_ended(&events, handle);
        assert!(has_progress(&seen, 4, 4));

        // The finished file is kept, blocks at their offsets
        let path = dir.join(format!("{}.data.bin", handle));
        assert_eq!(fs::read(&path).unwrap(), content);

        // The receiver announced its exit on both channels
        match fixture.recv_until_exit() {
            Packet::Exit {
                session_id,
                client_id,
            } => {
                assert_eq!(session_id, fixture.reply.session_id);
                assert_eq!(client_id, fixture.reply.client_id);
            }
            _ => unreachable!(),
        }
        let mut end = [0u8; 4];
        control.read_exact(&mut end).unwrap();
        assert_eq!(&end, b"END\0");

        assert_eq!(engine.active_sessions(), 0);
        assert!(engine.lookup_session(handle).is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn idle_interval_reports_the_current_bitmask() {
        let dir = scratch_dir("idle-srr");
        let fixture = SenderFixture::new(100, 4, 0);

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("idle.bin", "127.0.0.1", fixture.control_port())
            .unwrap();
        let _control = fixture.accept_and_greet("idle.bin");

        // One block, then silence: the idle timeout must produce an SRR
        // carrying the current mask.
        fixture.send_block(0, &[7u8; 100]);
        match fixture.recv_packet() {
            Packet::StatusReport {
                session_id,
                client_id,
                mask,
            } => {
                assert_eq!(session_id, fixture.reply.session_id);
                assert_eq!(client_id, fixture.reply.client_id);
                assert_eq!(mask, vec![0b0000_0001]);
            }
            other => panic!("expected an SRR, got {:?}", other),
        }

        // Stop by handle: exit+delete semantics, and a second stop is a
        // no-op.
        assert!(engine.stop_session(handle));
        assert!(!engine.stop_session(handle));

        let _ = wait_for_ended(&events, handle);
        fixture.recv_until_exit();
        assert!(!dir.join(format!("{}.idle.bin", handle)).exists());
        assert!(engine.lookup_session(handle).is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sender_stop_tears_down_and_deletes_the_file() {
        let dir = scratch_dir("stop");
        let fixture = SenderFixture::new(100, 4, 0);

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("stop.bin", "127.0.0.1", fixture.control_port())
            .unwrap();
        let _control = fixture.accept_and_greet("stop.bin");

        // A STOP for some other session must be ignored...
        fixture.send_stop(fixture.reply.session_id + 1);
        fixture.send_block(0, &[1u8; 100]);
        fixture.send_block(1, &[2u8; 100]);

        // ...so the transfer is still alive and making progress, until the
        // sender stops its own session.
        fixture.send_stop(fixture.reply.session_id);
        let seen = wait_for_ended(&events, handle);
        assert!(has_progress(&seen, 2, 4));

        fixture.recv_until_exit();
        assert!(!dir.join(format!("{}.stop.bin", handle)).exists());
        assert_eq!(engine.active_sessions(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn out_of_range_sequence_reports_and_continues() {
        let dir = scratch_dir("oor");
        let payload_a = vec![0x11u8; 50];
        let payload_b = vec![0x22u8; 50];
        let content: Vec<u8> = [payload_a.clone(), payload_b.clone()].concat();
        let fixture = SenderFixture::new(50, 2, xor_hash(&content));

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("oor.bin", "127.0.0.1", fixture.control_port())
            .unwrap();
        let _control = fixture.accept_and_greet("oor.bin");

        fixture.send_block(0, &payload_a);
        // Out of range both ways: seq == block_count and seq < 0. Neither
        // may kill the loop or touch the file.
        fixture.send_block(2, &[0xEEu8; 50]);
        fixture.send_block(-1, &[0xEEu8; 50]);
        // An immediate report answers the bad sequence; the bad sequences
        // themselves never reach the mask.
        match fixture.recv_packet() {
            Packet::StatusReport { mask, .. } => {
                assert_eq!(mask.len(), 1);
                assert_eq!(mask[0] & 0b0000_0001, 1);
            }
            other => panic!("expected an SRR, got {:?}", other),
        }

        fixture.send_block(1, &payload_b);
        let seen = wait_for_ended(&events, handle);
        assert!(has_progress(&seen, 2, 2));

        let path = dir.join(format!("{}.oor.bin", handle));
        assert_eq!(fs::read(&path).unwrap(), content);
        fixture.recv_until_exit();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejected_request_fails_without_data_channel_or_file() {
        let dir = scratch_dir("rejected");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("missing.bin", "127.0.0.1", port)
            .unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).unwrap();
            if byte[0] == 0 {
                break;
            }
        }
        stream
            .write_all(&encode_rejection(-1, "file not found"))
            .unwrap();

        let seen = wait_for_ended(&events, handle);
        // The failure is reported to the operator with the sender's reason
        assert!(seen.iter().any(|e| {
            matches!(e, TransferEvent::Log { line } if line.contains("file not found"))
        }));
        // No progress, no data channel traffic, no file
        assert!(!seen
            .iter()
            .any(|e| matches!(e, TransferEvent::Progress { .. })));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert!(engine.lookup_session(handle).is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn silent_sender_times_out_the_handshake() {
        let dir = scratch_dir("timeout");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = test_config(&dir);
        config.handshake_timeout = Duration::from_millis(300);
        let (engine, events) = Engine::new(config);
        let handle = engine
            .start_download("slow.bin", "127.0.0.1", port)
            .unwrap();

        // Accept and say nothing
        let (_stream, _) = listener.accept().unwrap();
        let seen = wait_for_ended(&events, handle);
        assert!(seen.iter().any(|e| {
            matches!(e, TransferEvent::Log { line } if line.contains("timed out"))
        }));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn refused_connection_fails_the_session() {
        let dir = scratch_dir("refused");
        // Grab a port with nothing listening on it
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("nobody.bin", "127.0.0.1", port)
            .unwrap();
        let seen = wait_for_ended(&events, handle);
        assert!(seen.iter().any(|e| {
            matches!(e, TransferEvent::Log { line } if line.contains("could not connect"))
        }));
        assert_eq!(engine.active_sessions(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stop_all_ends_every_session() {
        let dir = scratch_dir("stop-all");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = test_config(&dir);
        config.handshake_timeout = Duration::from_secs(5);
        let (engine, events) = Engine::new(config);

        // Two sessions parked in their handshake against a mute sender
        let first = engine.start_download("one.bin", "127.0.0.1", port).unwrap();
        let second = engine.start_download("two.bin", "127.0.0.1", port).unwrap();
        let (_a, _) = listener.accept().unwrap();
        let (_b, _) = listener.accept().unwrap();
        assert_eq!(engine.active_sessions(), 2);

        engine.stop_all();
        assert_eq!(engine.active_sessions(), 0);

        let mut ended = vec![];
        let deadline = Instant::now() + WAIT;
        while ended.len() < 2 {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for sessions to end");
            if let Ok(TransferEvent::SessionEnded { handle }) = events.recv_timeout(remaining) {
                ended.push(handle);
            }
        }
        ended.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ended, expected);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lookup_reports_session_progress() {
        let dir = scratch_dir("lookup");
        let fixture = SenderFixture::new(100, 8, 0);

        let (engine, events) = Engine::new(test_config(&dir));
        let handle = engine
            .start_download("look.bin", "127.0.0.1", fixture.control_port())
            .unwrap();
        let _control = fixture.accept_and_greet("look.bin");

        fixture.send_block(0, &[1u8; 100]);
        // Wait until the block is acknowledged as progress
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for progress");
            match events.recv_timeout(remaining) {
                Ok(TransferEvent::Progress {
                    blocks_received: 1, ..
                }) => break,
                Ok(_) => continue,
                Err(e) => panic!("no progress event: {}", e),
            }
        }

        let info = engine.lookup_session(handle).expect("session is live");
        assert_eq!(info.handle, handle);
        assert_eq!(info.filename, "look.bin");
        assert_eq!(info.state, "receiving");
        assert_eq!(info.blocks_received, 1);
        assert_eq!(info.blocks_total, 8);

        engine.stop_session(handle);
        let _ = wait_for_ended(&events, handle);
        let _ = fs::remove_dir_all(&dir);
    }
}
