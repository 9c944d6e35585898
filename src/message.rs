//! # Transfer Wire Messages
//!
//! This module defines the datagram types and serialization for the
//! multicast file-transfer protocol. All traffic on the data channel uses
//! these messages.
//!
//! ## Message Structure
//!
//! Every message starts with a one-byte type tag; multi-byte integers are
//! little-endian (the sender's native order, see DESIGN.md):
//!
//! | Tag | Name | Direction | Layout after the tag |
//! |-----|------|-----------|----------------------|
//! | 1 | DATA | sender → group | session id (i16), block sequence (i32), payload length (i32), payload bytes |
//! | 2 | SRR  | receiver → sender | session id (i16), client id (i16), bitmask wire bytes |
//! | 3 | STOP | sender → group | session id (i16) |
//! | 4 | EXIT | receiver → sender | session id (i16), client id (i16) |
//!
//! A DATA message whose declared payload length reads past the datagram
//! boundary, or a datagram with an unknown tag, decodes to a
//! [`WireError`]. Such datagrams are dropped by the receive loop, never
//! fatal.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

type MessageTag = u8;

pub const PKT_DATA: MessageTag = 1;
pub const PKT_SRR: MessageTag = 2;
pub const PKT_STOP: MessageTag = 3;
pub const PKT_EXIT: MessageTag = 4;

/// Largest datagram the protocol ever produces; receive buffers are sized
/// to this.
pub const MAX_DATAGRAM_LEN: usize = 9000;

/// A malformed datagram.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    /// The datagram ended before the fields its tag requires.
    #[error("datagram truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// A DATA payload length pointing past the end of the datagram.
    #[error("declared payload length {declared} exceeds the {remaining} bytes received")]
    BadPayloadLength { declared: i64, remaining: usize },

    /// The first byte is not a known message tag.
    #[error("unrecognized message tag {0}")]
    UnknownTag(u8),

    /// Empty datagram, no tag to dispatch on.
    #[error("empty datagram")]
    Empty,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// One block of file data, multicast by the sender.
    Data {
        session_id: i16,
        sequence: i32,
        payload: Vec<u8>,
    },
    /// A receiver's status report: its current arrival bitmask.
    StatusReport {
        session_id: i16,
        client_id: i16,
        mask: Vec<u8>,
    },
    /// The sender is abandoning the transfer.
    Stop { session_id: i16 },
    /// A receiver is leaving the transfer.
    Exit { session_id: i16, client_id: i16 },
}

impl Packet {
    /// Serialize the message for transmission.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out: Vec<u8> = vec![];
        match self {
            Packet::Data {
                session_id,
                sequence,
                payload,
            } => {
                out.push(PKT_DATA);
                // Writes into a Vec cannot fail
                out.write_i16::<LittleEndian>(*session_id).unwrap();
                out.write_i32::<LittleEndian>(*sequence).unwrap();
                out.write_i32::<LittleEndian>(payload.len() as i32).unwrap();
                out.extend_from_slice(payload);
            }
            Packet::StatusReport {
                session_id,
                client_id,
                mask,
            } => {
                out.push(PKT_SRR);
                out.write_i16::<LittleEndian>(*session_id).unwrap();
                out.write_i16::<LittleEndian>(*client_id).unwrap();
                out.extend_from_slice(mask);
            }
            Packet::Stop { session_id } => {
                out.push(PKT_STOP);
                out.write_i16::<LittleEndian>(*session_id).unwrap();
            }
            Packet::Exit {
                session_id,
                client_id,
            } => {
                out.push(PKT_EXIT);
                out.write_i16::<LittleEndian>(*session_id).unwrap();
                out.write_i16::<LittleEndian>(*client_id).unwrap();
            }
        }
        out
    }
}

/// Deserialize one received datagram.
///
/// # Arguments
///
/// * `buf` - The datagram exactly as received.
///
/// # Errors
///
/// Returns a [`WireError`] when the datagram is empty, carries an unknown
/// tag, is shorter than its tag's fixed fields, or declares a DATA payload
/// length past the datagram boundary.
pub fn deserialize_packet(buf: &[u8]) -> Result<Packet, WireError> {
    let tag = *buf.first().ok_or(WireError::Empty)?;
    let body = &buf[1..];
    let mut cursor = Cursor::new(body);

    match tag {
        PKT_DATA => {
            let needed = 2 + 4 + 4;
            if body.len() < needed {
                return Err(WireError::Truncated {
                    needed,
                    got: body.len(),
                });
            }
            let session_id = cursor.read_i16::<LittleEndian>().unwrap();
            let sequence = cursor.read_i32::<LittleEndian>().unwrap();
            let length = cursor.read_i32::<LittleEndian>().unwrap();
            let remaining = body.len() - needed;
            if length < 0 || length as usize > remaining {
                return Err(WireError::BadPayloadLength {
                    declared: length as i64,
                    remaining,
                });
            }
            let payload = body[needed..needed + length as usize].to_vec();
            Ok(Packet::Data {
                session_id,
                sequence,
                payload,
            })
        }
        PKT_SRR => {
            let needed = 2 + 2;
            if body.len() < needed {
                return Err(WireError::Truncated {
                    needed,
                    got: body.len(),
                });
            }
            let session_id = cursor.read_i16::<LittleEndian>().unwrap();
            let client_id = cursor.read_i16::<LittleEndian>().unwrap();
            Ok(Packet::StatusReport {
                session_id,
                client_id,
                mask: body[needed..].to_vec(),
            })
        }
        PKT_STOP => {
            if body.len() < 2 {
                return Err(WireError::Truncated {
                    needed: 2,
                    got: body.len(),
                });
            }
            let session_id = cursor.read_i16::<LittleEndian>().unwrap();
            Ok(Packet::Stop { session_id })
        }
        PKT_EXIT => {
            let needed = 2 + 2;
            if body.len() < needed {
                return Err(WireError::Truncated {
                    needed,
                    got: body.len(),
                });
            }
            let session_id = cursor.read_i16::<LittleEndian>().unwrap();
            let client_id = cursor.read_i16::<LittleEndian>().unwrap();
            Ok(Packet::Exit {
                session_id,
                client_id,
            })
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trip() {
        let packet = Packet::Data {
            session_id: 3,
            sequence: 41,
            payload: vec![0xAB; 1000],
        };
        let bytes = packet.serialize();
        assert_eq!(bytes[0], PKT_DATA);
        assert_eq!(bytes.len(), 1 + 2 + 4 + 4 + 1000);
        assert_eq!(deserialize_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn data_layout_is_little_endian() {
        let packet = Packet::Data {
            session_id: 0x0102,
            sequence: 0x0A0B0C0D,
            payload: vec![0xFF, 0xFE],
        };
        let bytes = packet.serialize();
        assert_eq!(
            bytes,
            vec![1, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A, 2, 0, 0, 0, 0xFF, 0xFE]
        );
    }

    #[test]
    fn status_report_carries_mask_bytes() {
        let packet = Packet::StatusReport {
            session_id: -2,
            client_id: 7,
            mask: vec![0b101, 0b1],
        };
        let bytes = packet.serialize();
        assert_eq!(bytes[0], PKT_SRR);
        match deserialize_packet(&bytes).unwrap() {
            Packet::StatusReport {
                session_id,
                client_id,
                mask,
            } => {
                assert_eq!(session_id, -2);
                assert_eq!(client_id, 7);
                assert_eq!(mask, vec![0b101, 0b1]);
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn stop_and_exit_round_trip() {
        let stop = Packet::Stop { session_id: 9 };
        assert_eq!(deserialize_packet(&stop.serialize()).unwrap(), stop);

        let exit = Packet::Exit {
            session_id: 9,
            client_id: 4,
        };
        assert_eq!(deserialize_packet(&exit.serialize()).unwrap(), exit);
    }

    #[test]
    fn payload_length_past_datagram_end_is_malformed() {
        let mut bytes = Packet::Data {
            session_id: 1,
            sequence: 0,
            payload: vec![0x55; 16],
        }
        .serialize();
        // Inflate the declared length past the received bytes
        bytes[7..11].copy_from_slice(&100i32.to_le_bytes());
        assert_eq!(
            deserialize_packet(&bytes),
            Err(WireError::BadPayloadLength {
                declared: 100,
                remaining: 16
            })
        );
    }

    #[test]
    fn negative_payload_length_is_malformed() {
        let mut bytes = Packet::Data {
            session_id: 1,
            sequence: 0,
            payload: vec![],
        }
        .serialize();
        bytes[7..11].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            deserialize_packet(&bytes),
            Err(WireError::BadPayloadLength { declared: -1, .. })
        ));
    }

    #[test]
    fn unknown_tag_and_short_datagrams_are_malformed() {
        assert_eq!(deserialize_packet(&[]), Err(WireError::Empty));
        assert_eq!(deserialize_packet(&[9, 0, 0]), Err(WireError::UnknownTag(9)));
        assert_eq!(
            deserialize_packet(&[PKT_STOP]),
            Err(WireError::Truncated { needed: 2, got: 0 })
        );
        assert_eq!(
            deserialize_packet(&[PKT_DATA, 1, 0, 2]),
            Err(WireError::Truncated { needed: 10, got: 3 })
        );
    }
}
