//! # Download Handshake
//!
//! This module implements the control-channel negotiation that precedes a
//! transfer. The receiver connects, names the file it wants, and the sender
//! answers with the session parameters and the multicast group to listen on.
//!
//! ## Request
//!
//! The request is the filename bytes followed by a single NUL terminator.
//!
//! ## Reply
//!
//! The reply header is read field by field, every read bounded by the
//! acknowledgment timeout armed on the control channel by the caller.
//! Integers are little-endian (see DESIGN.md):
//!
//! ```text
//! client id      i16   negative: file not found, see below
//! session id     i16
//! file length    u64
//! block size     i32
//! block count    i32
//! file hash      u32
//! group address  4 bytes (IPv4 session) or 16 bytes (IPv6 session)
//! group port     u16
//! ```
//!
//! A negative client id means the sender does not serve the requested file.
//! Whatever trailing bytes the sender supplies are drained (bounded, one
//! read) as an operator-visible reason; nothing else follows.

use std::io;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

/// Session parameters returned by the sender for an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Receiver's id within this transfer, assigned by the sender.
    pub client_id: i16,
    /// Transfer session id, shared by every message that follows.
    pub session_id: i16,
    /// Total file length in bytes.
    pub file_length: u64,
    /// Size of every block except possibly the last.
    pub block_size: i32,
    /// Number of blocks the file is split into.
    pub block_count: i32,
    /// 32-bit XOR hash of the file content.
    pub file_hash: u32,
    /// Multicast group the data channel must listen on.
    pub group_addr: IpAddr,
    /// UDP port of the multicast group.
    pub group_port: u16,
}

/// Result of a handshake: accepted with parameters, or rejected by the
/// sender because the file is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted(HandshakeReply),
    Rejected { client_id: i16, reason: String },
}

/// A failed handshake read.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// No reply (or an incomplete reply) within the acknowledgment timeout.
    #[error("timed out waiting for the handshake reply")]
    Timeout,

    /// The control channel closed before the full header arrived.
    #[error("control channel closed during the handshake reply")]
    ShortRead,

    /// A reply field that cannot describe a transfer.
    #[error("invalid handshake reply: {0}")]
    InvalidField(String),

    /// Any other control-channel read failure.
    #[error("control channel read failed: {0}")]
    Io(#[source] io::Error),
}

/// Build the request for `filename`: its bytes plus a NUL terminator.
pub fn serialize_request(filename: &str) -> Vec<u8> {
    let mut out = filename.as_bytes().to_vec();
    out.push(0);
    out
}

/// Read and validate the sender's reply header from the control channel.
///
/// # Arguments
///
/// * `reader` - The control channel, with the acknowledgment timeout armed.
/// * `ipv4` - Whether the session's transport family is IPv4; decides the
///   group address width.
///
/// # Errors
///
/// Returns [`HandshakeError::Timeout`] when any field read times out,
/// [`HandshakeError::ShortRead`] when the channel closes mid-header, and
/// [`HandshakeError::InvalidField`] for a non-positive block size or count.
pub fn read_reply<R: Read>(reader: &mut R, ipv4: bool) -> Result<HandshakeOutcome, HandshakeError> {
    let client_id = reader
        .read_i16::<LittleEndian>()
        .map_err(classify_read_error)?;

    // A negative client id is a rejection; the rest of the header is an
    // optional free-text reason instead of the session parameters.
    if client_id < 0 {
        return Ok(HandshakeOutcome::Rejected {
            client_id,
            reason: drain_reason(reader),
        });
    }

    let session_id = reader
        .read_i16::<LittleEndian>()
        .map_err(classify_read_error)?;
    let file_length = reader
        .read_u64::<LittleEndian>()
        .map_err(classify_read_error)?;
    let block_size = reader
        .read_i32::<LittleEndian>()
        .map_err(classify_read_error)?;
    let block_count = reader
        .read_i32::<LittleEndian>()
        .map_err(classify_read_error)?;
    let file_hash = reader
        .read_u32::<LittleEndian>()
        .map_err(classify_read_error)?;

    let group_addr = if ipv4 {
        let mut octets = [0u8; 4];
        reader
            .read_exact(&mut octets)
            .map_err(classify_read_error)?;
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        reader
            .read_exact(&mut octets)
            .map_err(classify_read_error)?;
        IpAddr::V6(Ipv6Addr::from(octets))
    };

    let group_port = reader
        .read_u16::<LittleEndian>()
        .map_err(classify_read_error)?;

    if block_size <= 0 {
        return Err(HandshakeError::InvalidField(format!(
            "block size {}",
            block_size
        )));
    }
    if block_count <= 0 {
        return Err(HandshakeError::InvalidField(format!(
            "block count {}",
            block_count
        )));
    }

    Ok(HandshakeOutcome::Accepted(HandshakeReply {
        client_id,
        session_id,
        file_length,
        block_size,
        block_count,
        file_hash,
        group_addr,
        group_port,
    }))
}

/// Best-effort read of the rejection reason: one bounded read, lossy UTF-8,
/// NULs and surrounding whitespace stripped. A timeout or error here just
/// yields an empty reason.
fn drain_reason<R: Read>(reader: &mut R) -> String {
    let mut buf = [0u8; 256];
    match reader.read(&mut buf) {
        Ok(n) if n > 0 => String::from_utf8_lossy(&buf[..n])
            .trim_matches(char::from(0))
            .trim()
            .to_string(),
        _ => String::new(),
    }
}

fn classify_read_error(err: io::Error) -> HandshakeError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HandshakeError::Timeout,
        io::ErrorKind::UnexpectedEof => HandshakeError::ShortRead,
        _ => HandshakeError::Io(err),
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{encode_rejection, encode_reply};
    use super::*;
    use std::io::Cursor;

    fn sample_reply_v4() -> HandshakeReply {
        HandshakeReply {
            client_id: 2,
            session_id: 11,
            file_length: 4000,
            block_size: 1000,
            block_count: 4,
            file_hash: 0xDEADBEEF,
            group_addr: IpAddr::V4(Ipv4Addr::new(224, 0, 0, 7)),
            group_port: 5500,
        }
    }

    #[test]
    fn request_is_filename_plus_nul() {
        assert_eq!(serialize_request("data.bin"), b"data.bin\0".to_vec());
    }

    #[test]
    fn accepted_reply_round_trips_ipv4() {
        let reply = sample_reply_v4();
        let mut cursor = Cursor::new(encode_reply(&reply));
        match read_reply(&mut cursor, true).unwrap() {
            HandshakeOutcome::Accepted(decoded) => assert_eq!(decoded, reply),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn accepted_reply_round_trips_ipv6() {
        let reply = HandshakeReply {
            group_addr: IpAddr::V6("ff15::42".parse().unwrap()),
            ..sample_reply_v4()
        };
        let mut cursor = Cursor::new(encode_reply(&reply));
        match read_reply(&mut cursor, false).unwrap() {
            HandshakeOutcome::Accepted(decoded) => assert_eq!(decoded, reply),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn negative_client_id_is_a_rejection_with_reason() {
        let mut cursor = Cursor::new(encode_rejection(-1, "no such file"));
        match read_reply(&mut cursor, true).unwrap() {
            HandshakeOutcome::Rejected { client_id, reason } => {
                assert_eq!(client_id, -1);
                assert_eq!(reason, "no such file");
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn rejection_without_reason_is_accepted() {
        let mut cursor = Cursor::new(encode_rejection(-7, ""));
        match read_reply(&mut cursor, true).unwrap() {
            HandshakeOutcome::Rejected { client_id, reason } => {
                assert_eq!(client_id, -7);
                assert!(reason.is_empty());
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn truncated_header_is_a_short_read() {
        let full = encode_reply(&sample_reply_v4());
        let mut cursor = Cursor::new(full[..10].to_vec());
        assert!(matches!(
            read_reply(&mut cursor, true),
            Err(HandshakeError::ShortRead)
        ));
    }

    #[test]
    fn non_positive_block_fields_are_invalid() {
        let mut reply = sample_reply_v4();
        reply.block_size = 0;
        let mut cursor = Cursor::new(encode_reply(&reply));
        assert!(matches!(
            read_reply(&mut cursor, true),
            Err(HandshakeError::InvalidField(_))
        ));

        let mut reply = sample_reply_v4();
        reply.block_count = -4;
        let mut cursor = Cursor::new(encode_reply(&reply));
        assert!(matches!(
            read_reply(&mut cursor, true),
            Err(HandshakeError::InvalidField(_))
        ));
    }
}
