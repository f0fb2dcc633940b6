//! Bootloader frame codec.
//!
//! On the wire a frame is `[length][type][payload..][checksum]`, where
//! `length` counts the payload plus the type and checksum bytes. The checksum
//! is the XOR of the type and length, each taken as a big-endian 16-bit
//! value, followed by the payload. Only the low byte of the type is sent.

use crate::response::{Response, ResponseRegistry};

/// Bytes counted by `length` on top of the payload (type and checksum)
pub const FRAME_OVERHEAD: usize = 2;

/// Largest payload that fits the single byte length field
pub const MAX_PAYLOAD: usize = 0xff - FRAME_OVERHEAD;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLong(usize),

    #[error("frame length {0} is too short")]
    FrameTooShort(usize),

    #[error("frame length mismatch (declared {expected}, received {actual})")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("response 0x{0:02x} carries no status byte")]
    MissingStatus(u8),

    #[error("invalid payload for response 0x{kind:02x} ({len} bytes)")]
    InvalidPayload { kind: u8, len: usize },

    #[error("duplicate decoder registered for response 0x{0:02x}")]
    DuplicateRegistration(u8),
}

/// Compute a frame checksum
pub fn checksum(kind: u16, length: u16, payload: &[u8]) -> u8 {
    kind.to_be_bytes()
        .iter()
        .chain(length.to_be_bytes().iter())
        .chain(payload.iter())
        .fold(0, |acc, b| acc ^ b)
}

/// Encode a frame for transmission
pub fn encode(kind: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }

    let length = payload.len() + FRAME_OVERHEAD;

    let mut buff = Vec::with_capacity(length + 1);
    buff.push(length as u8);
    buff.push(kind);
    buff.extend_from_slice(payload);
    buff.push(checksum(kind as u16, length as u16, payload));

    Ok(buff)
}

/// Decode a received frame, `raw` being everything after the length byte
///
/// The received checksum is carried through on the response and not checked
/// here, see [`Response::checksum_matches`].
pub fn decode(length: usize, raw: &[u8], registry: &ResponseRegistry) -> Result<Response, FrameError> {
    if raw.len() != length {
        return Err(FrameError::LengthMismatch { expected: length, actual: raw.len() });
    }
    if length < FRAME_OVERHEAD {
        return Err(FrameError::FrameTooShort(length));
    }

    let kind = raw[0];
    let payload = &raw[1..length - 1];
    let checksum = raw[length - 1];

    registry.decode(kind, payload, checksum)
}
