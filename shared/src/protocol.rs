//! Binary wire codec for the synchronization protocol.
//!
//! Every encoded message starts with a one-byte type tag followed by the
//! variant's fields in declared order. Integers are little-endian and no
//! padding is inserted. Variable-length data (the auth token) is a 4-byte
//! length prefix followed by raw bytes.
//!
//! Over the reliable channel messages are framed as `[u32 length][payload]`;
//! the unreliable channel carries one bare payload per datagram.

use bytes::{Buf, BufMut};
use thiserror::Error;

pub const TAG_PLAYER_INPUT: u8 = 0;
pub const TAG_ADD_GAMEOBJECT: u8 = 1;
pub const TAG_REMOVE_GAMEOBJECT: u8 = 2;
pub const TAG_GAMEOBJECT_POSITION: u8 = 3;
pub const TAG_GAMEOBJECT_PARENT_OBJECT: u8 = 4;
pub const TAG_AUTHENTICATION: u8 = 5;
pub const TAG_UDP_VERIFICATION: u8 = 6;
/// Reserved for a future whole-snapshot blob. Decoding it is an error until
/// a layout is assigned; snapshots are streamed as individual add/position
/// messages instead.
pub const TAG_FULL_GAME_STATE: u8 = 7;
pub const TAG_ADD_RIDABLE_OBJECT: u8 = 8;
pub const TAG_WALK_ON_RIDABLE_OBJECT: u8 = 9;
pub const TAG_RIDE_ON_RIDABLE_OBJECT: u8 = 10;

/// Upper bound on a framed message, applied before reading a frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors produced while decoding a message payload.
///
/// Decoding is total and side-effect-free; a failed decode leaves no state
/// behind and the caller simply drops the offending message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown message type tag {0}")]
    UnknownType(u8),
    #[error("truncated message: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
}

/// A protocol message. One variant per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PlayerInput {
        direction: u8,
        player_id: u32,
    },
    AddGameObject {
        type_id: u8,
        obj_id: u32,
    },
    RemoveGameObject {
        obj_id: u32,
    },
    GameObjectPosition {
        y: i32,
        x: i32,
        obj_id: u32,
    },
    GameObjectParentObject {
        parent_id: u32,
        obj_id: u32,
    },
    Authentication {
        protocol_version: u32,
        client_id: u32,
        udp_port: u16,
        token: Vec<u8>,
    },
    UdpVerification {
        session_id: u32,
        verification_code: u64,
        timestamp: u64,
    },
    AddRidableObject {
        obj_id: u32,
        mesh_id: u32,
        texture_id: u32,
        grid_height: u8,
        grid_width: u8,
    },
    WalkOnRidableObject {
        walker_id: u32,
        direction: u8,
    },
    RideOnRidableObject {
        vehicle_id: u32,
        rider_id: u32,
        ride_at: u8,
    },
}

impl Message {
    /// The wire tag this variant encodes as (always the first byte).
    pub fn tag(&self) -> u8 {
        match self {
            Message::PlayerInput { .. } => TAG_PLAYER_INPUT,
            Message::AddGameObject { .. } => TAG_ADD_GAMEOBJECT,
            Message::RemoveGameObject { .. } => TAG_REMOVE_GAMEOBJECT,
            Message::GameObjectPosition { .. } => TAG_GAMEOBJECT_POSITION,
            Message::GameObjectParentObject { .. } => TAG_GAMEOBJECT_PARENT_OBJECT,
            Message::Authentication { .. } => TAG_AUTHENTICATION,
            Message::UdpVerification { .. } => TAG_UDP_VERIFICATION,
            Message::AddRidableObject { .. } => TAG_ADD_RIDABLE_OBJECT,
            Message::WalkOnRidableObject { .. } => TAG_WALK_ON_RIDABLE_OBJECT,
            Message::RideOnRidableObject { .. } => TAG_RIDE_ON_RIDABLE_OBJECT,
        }
    }

    /// Encodes the message as a bare payload (no channel framing).
    /// Never fails for well-formed in-memory values.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.put_u8(self.tag());

        match self {
            Message::PlayerInput {
                direction,
                player_id,
            } => {
                buf.put_u8(*direction);
                buf.put_u32_le(*player_id);
            }
            Message::AddGameObject { type_id, obj_id } => {
                buf.put_u8(*type_id);
                buf.put_u32_le(*obj_id);
            }
            Message::RemoveGameObject { obj_id } => {
                buf.put_u32_le(*obj_id);
            }
            Message::GameObjectPosition { y, x, obj_id } => {
                buf.put_i32_le(*y);
                buf.put_i32_le(*x);
                buf.put_u32_le(*obj_id);
            }
            Message::GameObjectParentObject { parent_id, obj_id } => {
                buf.put_u32_le(*parent_id);
                buf.put_u32_le(*obj_id);
            }
            Message::Authentication {
                protocol_version,
                client_id,
                udp_port,
                token,
            } => {
                buf.put_u32_le(*protocol_version);
                buf.put_u32_le(*client_id);
                buf.put_u16_le(*udp_port);
                buf.put_u32_le(token.len() as u32);
                buf.put_slice(token);
            }
            Message::UdpVerification {
                session_id,
                verification_code,
                timestamp,
            } => {
                buf.put_u32_le(*session_id);
                buf.put_u64_le(*verification_code);
                buf.put_u64_le(*timestamp);
            }
            Message::AddRidableObject {
                obj_id,
                mesh_id,
                texture_id,
                grid_height,
                grid_width,
            } => {
                buf.put_u32_le(*obj_id);
                buf.put_u32_le(*mesh_id);
                buf.put_u32_le(*texture_id);
                buf.put_u8(*grid_height);
                buf.put_u8(*grid_width);
            }
            Message::WalkOnRidableObject {
                walker_id,
                direction,
            } => {
                buf.put_u32_le(*walker_id);
                buf.put_u8(*direction);
            }
            Message::RideOnRidableObject {
                vehicle_id,
                rider_id,
                ride_at,
            } => {
                buf.put_u32_le(*vehicle_id);
                buf.put_u32_le(*rider_id);
                buf.put_u8(*ride_at);
            }
        }

        buf
    }

    /// Decodes a bare payload. Trailing bytes beyond the variant layout are
    /// ignored so datagram padding is tolerated.
    pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
        let mut buf = bytes;
        let tag = take_u8(&mut buf)?;

        let message = match tag {
            TAG_PLAYER_INPUT => Message::PlayerInput {
                direction: take_u8(&mut buf)?,
                player_id: take_u32(&mut buf)?,
            },
            TAG_ADD_GAMEOBJECT => Message::AddGameObject {
                type_id: take_u8(&mut buf)?,
                obj_id: take_u32(&mut buf)?,
            },
            TAG_REMOVE_GAMEOBJECT => Message::RemoveGameObject {
                obj_id: take_u32(&mut buf)?,
            },
            TAG_GAMEOBJECT_POSITION => Message::GameObjectPosition {
                y: take_i32(&mut buf)?,
                x: take_i32(&mut buf)?,
                obj_id: take_u32(&mut buf)?,
            },
            TAG_GAMEOBJECT_PARENT_OBJECT => Message::GameObjectParentObject {
                parent_id: take_u32(&mut buf)?,
                obj_id: take_u32(&mut buf)?,
            },
            TAG_AUTHENTICATION => {
                let protocol_version = take_u32(&mut buf)?;
                let client_id = take_u32(&mut buf)?;
                let udp_port = take_u16(&mut buf)?;
                let token_len = take_u32(&mut buf)? as usize;
                if buf.remaining() < token_len {
                    return Err(CodecError::Truncated {
                        needed: token_len,
                        got: buf.remaining(),
                    });
                }
                let mut token = vec![0u8; token_len];
                buf.copy_to_slice(&mut token);
                Message::Authentication {
                    protocol_version,
                    client_id,
                    udp_port,
                    token,
                }
            }
            TAG_UDP_VERIFICATION => Message::UdpVerification {
                session_id: take_u32(&mut buf)?,
                verification_code: take_u64(&mut buf)?,
                timestamp: take_u64(&mut buf)?,
            },
            TAG_ADD_RIDABLE_OBJECT => Message::AddRidableObject {
                obj_id: take_u32(&mut buf)?,
                mesh_id: take_u32(&mut buf)?,
                texture_id: take_u32(&mut buf)?,
                grid_height: take_u8(&mut buf)?,
                grid_width: take_u8(&mut buf)?,
            },
            TAG_WALK_ON_RIDABLE_OBJECT => Message::WalkOnRidableObject {
                walker_id: take_u32(&mut buf)?,
                direction: take_u8(&mut buf)?,
            },
            TAG_RIDE_ON_RIDABLE_OBJECT => Message::RideOnRidableObject {
                vehicle_id: take_u32(&mut buf)?,
                rider_id: take_u32(&mut buf)?,
                ride_at: take_u8(&mut buf)?,
            },
            other => return Err(CodecError::UnknownType(other)),
        };

        Ok(message)
    }

    /// Encodes the message with the reliable-channel length prefix.
    pub fn frame(&self) -> Vec<u8> {
        let payload = self.encode();
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.put_u32_le(payload.len() as u32);
        framed.put_slice(&payload);
        framed
    }
}

/// Validates a frame length prefix read off the reliable channel.
pub fn check_frame_len(len: u32) -> Result<usize, CodecError> {
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    Ok(len)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn need(buf: &&[u8], n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::Truncated {
            needed: n,
            got: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Message> {
        vec![
            Message::PlayerInput {
                direction: 1,
                player_id: 7,
            },
            Message::AddGameObject {
                type_id: 2,
                obj_id: 99,
            },
            Message::RemoveGameObject { obj_id: u32::MAX },
            Message::GameObjectPosition {
                y: -3,
                x: i32::MAX,
                obj_id: 12,
            },
            Message::GameObjectParentObject {
                parent_id: 0,
                obj_id: 5,
            },
            Message::Authentication {
                protocol_version: 1,
                client_id: 42,
                udp_port: 9000,
                token: vec![0xDE, 0xAD, 0xBE, 0xEF],
            },
            Message::Authentication {
                protocol_version: u32::MAX,
                client_id: 0,
                udp_port: u16::MAX,
                token: vec![],
            },
            Message::UdpVerification {
                session_id: 77,
                verification_code: u64::MAX,
                timestamp: 123_456_789,
            },
            Message::AddRidableObject {
                obj_id: 3,
                mesh_id: 10,
                texture_id: 20,
                grid_height: 4,
                grid_width: 6,
            },
            Message::WalkOnRidableObject {
                walker_id: 8,
                direction: 3,
            },
            Message::RideOnRidableObject {
                vehicle_id: 3,
                rider_id: 8,
                ride_at: 17,
            },
        ]
    }

    #[test]
    fn roundtrip_every_variant() {
        for message in all_variants() {
            let encoded = message.encode();
            let decoded = Message::decode(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn first_byte_is_always_the_tag() {
        for message in all_variants() {
            assert_eq!(message.encode()[0], message.tag());
        }
    }

    #[test]
    fn exact_layout_player_input() {
        let encoded = Message::PlayerInput {
            direction: 1,
            player_id: 0x0403_0201,
        }
        .encode();
        assert_eq!(encoded, vec![0, 1, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn exact_layout_authentication() {
        let encoded = Message::Authentication {
            protocol_version: 1,
            client_id: 42,
            udp_port: 9000,
            token: vec![0xAB],
        }
        .encode();
        let mut expected = vec![5];
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&42u32.to_le_bytes());
        expected.extend_from_slice(&9000u16.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(0xAB);
        assert_eq!(encoded, expected);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Message::decode(&[200, 0, 0]), Err(CodecError::UnknownType(200)));
    }

    #[test]
    fn reserved_full_game_state_tag_is_rejected() {
        assert_eq!(
            Message::decode(&[TAG_FULL_GAME_STATE]),
            Err(CodecError::UnknownType(TAG_FULL_GAME_STATE))
        );
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        for message in all_variants() {
            let encoded = message.encode();
            for cut in 0..encoded.len() {
                let result = Message::decode(&encoded[..cut]);
                assert!(
                    matches!(result, Err(CodecError::Truncated { .. })) || cut == 0,
                    "cut={cut} should truncate"
                );
                if cut == 0 {
                    assert!(matches!(result, Err(CodecError::Truncated { .. })));
                }
            }
        }
    }

    #[test]
    fn truncated_token_is_rejected() {
        let mut encoded = Message::Authentication {
            protocol_version: 1,
            client_id: 1,
            udp_port: 1,
            token: vec![1, 2, 3, 4],
        }
        .encode();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            Message::decode(&encoded),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut encoded = Message::RemoveGameObject { obj_id: 9 }.encode();
        encoded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(
            Message::decode(&encoded).unwrap(),
            Message::RemoveGameObject { obj_id: 9 }
        );
    }

    #[test]
    fn frame_prefixes_payload_length() {
        let message = Message::RemoveGameObject { obj_id: 9 };
        let framed = message.frame();
        let payload = message.encode();
        assert_eq!(&framed[..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&framed[4..], &payload[..]);
    }

    #[test]
    fn oversized_frame_length_is_rejected() {
        assert!(check_frame_len(16).is_ok());
        assert!(matches!(
            check_frame_len((MAX_FRAME_LEN + 1) as u32),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
