//! Fixed-layout datagram codec for [`DeviceState`]
//!
//! Layout (little-endian, no padding):
//!
//! ```text
//! u8      numeric id
//! u8      client ref id length (n)
//! [u8; n] client ref id, UTF-8
//! u8      controller kind (0 = PS4, 1 = Xbox)
//! u16     button mask
//! i8      left trigger
//! i8      right trigger
//! i16 x4  left x, left y, right x, right y
//! ```
//!
//! The layout carries no version byte; host and client must agree on it
//! byte for byte.

use super::state::{ControllerKind, DeviceState, MAX_CLIENT_REF_LEN};

/// Bytes in a packet besides the client ref id
pub const FIXED_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Client ref id is {0} bytes, limit is 255")]
    ClientRefTooLong(usize),

    #[error("Packet truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Packet has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("Unknown controller kind {0}")]
    UnknownKind(u8),

    #[error("Client ref id is not valid UTF-8")]
    InvalidUtf8,
}

pub fn encoded_len(state: &DeviceState) -> usize {
    FIXED_LEN + state.client_ref_id.len()
}

pub fn encode(state: &DeviceState) -> Result<Vec<u8>, CodecError> {
    let id = state.client_ref_id.as_bytes();
    if id.len() > MAX_CLIENT_REF_LEN {
        return Err(CodecError::ClientRefTooLong(id.len()));
    }

    let mut buffer = Vec::with_capacity(FIXED_LEN + id.len());
    buffer.push(state.numeric_id);
    buffer.push(id.len() as u8);
    buffer.extend_from_slice(id);
    buffer.push(state.kind.wire_value());
    buffer.extend_from_slice(&state.button_mask.to_le_bytes());
    buffer.push(state.trigger_left);
    buffer.push(state.trigger_right);
    for axis in [
        state.stick_left_x,
        state.stick_left_y,
        state.stick_right_x,
        state.stick_right_y,
    ] {
        buffer.extend_from_slice(&axis.to_le_bytes());
    }

    debug_assert_eq!(buffer.len(), FIXED_LEN + id.len());
    Ok(buffer)
}

pub fn decode(bytes: &[u8]) -> Result<DeviceState, CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::Truncated {
            needed: FIXED_LEN,
            actual: bytes.len(),
        });
    }

    let id_len = bytes[1] as usize;
    let needed = FIXED_LEN + id_len;
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    if bytes.len() > needed {
        return Err(CodecError::TrailingBytes(bytes.len() - needed));
    }

    let client_ref_id = std::str::from_utf8(&bytes[2..2 + id_len])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();

    let mut offset = 2 + id_len;
    let kind_byte = bytes[offset];
    let kind = ControllerKind::from_wire(kind_byte).ok_or(CodecError::UnknownKind(kind_byte))?;
    offset += 1;

    let read_u16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
    let read_i16 = |at: usize| i16::from_le_bytes([bytes[at], bytes[at + 1]]);

    let button_mask = read_u16(offset);
    offset += 2;
    let trigger_left = bytes[offset];
    let trigger_right = bytes[offset + 1];
    offset += 2;

    Ok(DeviceState {
        numeric_id: bytes[0],
        client_ref_id,
        kind,
        button_mask,
        trigger_left,
        trigger_right,
        stick_left_x: read_i16(offset),
        stick_left_y: read_i16(offset + 2),
        stick_right_x: read_i16(offset + 4),
        stick_right_y: read_i16(offset + 6),
    })
}
