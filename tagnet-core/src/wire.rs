//! Framing: JSON text, base64 encoded. One request and one response per TCP connection;
//! the frame ends where the writer closes its half of the stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::flag::{FlagHandler, FlagRegistry};
use crate::identity::PeerToken;
use crate::protocol::{Request, Response};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let json = serde_json::to_vec(msg)?;
    let frame = STANDARD.encode(json).into_bytes();
    if frame.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(frame)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameDecodeError> {
    if bytes.is_empty() {
        return Err(FrameDecodeError::Empty);
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let json = STANDARD.decode(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, FrameEncodeError> {
    encode(req)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, FrameDecodeError> {
    decode(bytes)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, FrameEncodeError> {
    encode(resp)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, FrameDecodeError> {
    decode(bytes)
}

/// Does `bytes` already hold a whole request frame? Cheap checks on the last base64 quantum
/// come first so a large frame arriving in chunks is only fully decoded near its end.
pub fn request_complete(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return false;
    }
    let closes_object = STANDARD
        .decode(&bytes[bytes.len() - 4..])
        .is_ok_and(|tail| tail.trim_ascii_end().ends_with(b"}"));
    closes_object && decode_request(bytes).is_ok()
}

/// Push a locally produced value through the same encode/decode path a remote result takes,
/// so local and remote calls observe identical values.
pub fn round_trip(peer: &PeerToken, value: Value) -> Result<Value, WireError> {
    let frame = encode_response(&Response::from_value(peer.clone(), value))?;
    match decode_response(&frame)? {
        Response::Value { value, .. } => Ok(Value::Object(value)),
        Response::Raw { raw, .. } => Ok(raw),
        Response::Error { .. } => Err(WireError::Decode(FrameDecodeError::Discriminant)),
    }
}

/// A response frame after the sentinel check.
pub enum Inbound<C> {
    Flag {
        name: String,
        handler: FlagHandler<C>,
    },
    Response(Response),
}

/// Classify a response frame. Sentinels are matched byte-for-byte before any decoding is attempted.
pub fn inspect<C>(bytes: &[u8], flags: &FlagRegistry<C>) -> Result<Inbound<C>, FrameDecodeError> {
    if let Some((name, handler)) = flags.matching(bytes) {
        return Ok(Inbound::Flag { name, handler });
    }
    decode_response(bytes).map(Inbound::Response)
}

/// Error encoding a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame too large")]
    TooLarge,
    #[error("frame is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload kind")]
    Discriminant,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
}
