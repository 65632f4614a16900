//! Wire framing for agreement messages.
//!
//! A frame is `[u32 length | u8 tag | bincode body]`, length covering the
//! tag byte and the body. The tag is redundant with the serialized enum
//! discriminant; decode cross-checks the two and rejects frames where they
//! disagree.

use thiserror::Error;

use crate::agreement::message::Message;

/// Hard ceiling on a single frame. Snapshots dominate frame sizes; deflate
/// keeps even large directory stores well under this.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message kind is local-only and has no wire form")]
    LocalOnly,
    #[error("frame truncated: {got} bytes, need {need}")]
    TooShort { got: usize, need: usize },
    #[error("frame length header {header} does not match {actual} bytes present")]
    LengthMismatch { header: usize, actual: usize },
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte ceiling")]
    OversizeFrame(usize),
    #[error("wire tag {tag} does not match decoded message tag {decoded}")]
    TagMismatch { tag: u8, decoded: u8 },
    #[error("frame body: {0}")]
    Body(#[from] bincode::Error),
}

/// Serializes a message into a length-prefixed, tagged frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let tag = msg.wire_tag().ok_or(WireError::LocalOnly)?;
    let body = bincode::serialize(msg)?;
    let len = 1 + body.len();
    if len > MAX_FRAME_BYTES {
        return Err(WireError::OversizeFrame(len));
    }
    let mut frame = Vec::with_capacity(HEADER_BYTES + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.push(tag);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses a complete frame back into a message, verifying the length
/// header and the tag/variant agreement.
pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    if frame.len() < HEADER_BYTES + 1 {
        return Err(WireError::TooShort {
            got: frame.len(),
            need: HEADER_BYTES + 1,
        });
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::OversizeFrame(len));
    }
    if frame.len() - HEADER_BYTES != len {
        return Err(WireError::LengthMismatch {
            header: len,
            actual: frame.len() - HEADER_BYTES,
        });
    }
    let tag = frame[HEADER_BYTES];
    let msg: Message = bincode::deserialize(&frame[HEADER_BYTES + 1..])?;
    match msg.wire_tag() {
        Some(decoded) if decoded == tag => Ok(msg),
        Some(decoded) => Err(WireError::TagMismatch { tag, decoded }),
        None => Err(WireError::LocalOnly),
    }
}
