//! Length-prefixed message framing
//!
//! Every message on the wire is `LEN (4 bytes, big-endian) || PAYLOAD (LEN
//! bytes, UTF-8)`. The length is interpreted as a non-negative i32.

use crate::error::CommunicationError;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on the payload length of a received frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prepends the 4-byte big-endian length prefix to a payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Reads the payload length out of a 4-byte prefix.
pub fn parse_length(prefix: &[u8]) -> Result<i32, CommunicationError> {
    let bytes: [u8; LENGTH_PREFIX_SIZE] = prefix
        .try_into()
        .map_err(|_| CommunicationError::protocol("Length prefix must be exactly 4 bytes"))?;
    Ok(i32::from_be_bytes(bytes))
}

/// Extracts the payload from a complete framed message.
///
/// Fails if the buffer is shorter than the prefix, if the encoded length is
/// negative, or if the buffer is not exactly `4 + LEN` bytes.
pub fn unframe(buffer: &[u8]) -> Result<&[u8], CommunicationError> {
    if buffer.len() < LENGTH_PREFIX_SIZE {
        return Err(CommunicationError::protocol("Framed message too short"));
    }

    let length = parse_length(&buffer[..LENGTH_PREFIX_SIZE])?;
    if length < 0 || buffer.len() != LENGTH_PREFIX_SIZE + length as usize {
        return Err(CommunicationError::protocol(format!(
            "Invalid message length: {}",
            length
        )));
    }

    Ok(&buffer[LENGTH_PREFIX_SIZE..])
}

/// Whether `unframe` would succeed on this buffer. Never fails.
pub fn is_valid_frame(buffer: &[u8]) -> bool {
    unframe(buffer).is_ok()
}
