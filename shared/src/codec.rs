//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes of UTF-8 JSON. The same framing is used in both directions and on
//! both the game and admin channels.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::MAX_FRAME_LENGTH;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Transport failure, truncated stream or oversized frame.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Raw frame codec with the given frame size limit.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Serializes a message into a frame payload (without the length prefix).
///
/// Used when one payload is sent to many connections, so the JSON is
/// produced once per fan-out.
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decodes frames into `D` and encodes `E` into frames.
///
/// A server reading client messages uses `MessageCodec<ClientMessage, ServerMessage>`,
/// a client the reverse.
pub struct MessageCodec<D, E> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

impl<D, E> MessageCodec<D, E> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            frames: frame_codec(max_frame_length),
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for MessageCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for MessageCodec<D, E> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for MessageCodec<D, E> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = encode_payload(&item)?;
        self.frames.encode(payload, dst)?;
        Ok(())
    }
}
