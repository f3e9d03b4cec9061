//! Framing: length-prefix (4 bytes LE) + body. Packets carry a JSON body, discovery
//! messages a bincode body.

use crate::packet::Packet;
use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

fn frame(body: Vec<u8>) -> Result<Vec<u8>, FrameEncodeError> {
    let len = body.len() as u32;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Split the first frame off `bytes`. Returns the body and the number of bytes consumed.
fn unframe(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Encode a discovery message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    frame(bincode::serialize(msg)?)
}

/// Decode one discovery frame from the front of `bytes`.
/// Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let (body, consumed) = unframe(bytes)?;
    let msg: Message = bincode::deserialize(body)?;
    Ok((msg, consumed))
}

/// Encode a packet into a single frame: 4 bytes LE length + JSON.
/// The payload stream is not part of the frame; only its size and transfer info are.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    frame(packet.to_json()?)
}

/// Decode one packet frame from the front of `bytes`.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (try again after more data).
pub fn decode_packet(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    let (body, consumed) = unframe(bytes)?;
    Ok((Packet::from_json(body)?, consumed))
}

/// Error encoding a frame (serializer or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a frame (need more bytes, too large, or deserializer failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
}
