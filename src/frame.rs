//! Framed message transport.
//!
//! Messages travel as length-prefixed JSON: a 4-byte big-endian length
//! header followed by the serialized body. Encoding produces the header and
//! body in one contiguous buffer so a reply can go out in a single write;
//! decoding runs through `LengthDelimitedCodec`, which reassembles whole
//! frames from an arbitrarily fragmented byte stream.

use crate::error::{Result, SockdError};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

/// Frames larger than this are rejected on both sides.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Streaming decoder over any async byte source.
pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Wrap a byte stream in the framed decoder.
pub fn reader<R: AsyncRead>(io: R) -> FrameReader<R> {
    FramedRead::new(io, codec())
}

/// Encode one message as header + body in a single contiguous buffer.
pub fn encode(msg: &Value) -> Result<Bytes> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| SockdError::json_error("Failed to encode message", e))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SockdError::other(format!(
            "Message of {} bytes exceeds frame limit ({MAX_FRAME_LEN})",
            body.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN above
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Read the next whole message.
///
/// `None` is end-of-stream. A frame whose body is not valid JSON surfaces as
/// an `InvalidData` error: during the liveness handshake that distinguishes
/// a protocol-mismatched peer from a silent one.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Option<std::io::Result<Value>> {
    let frame = match reader.next().await? {
        Ok(frame) => frame,
        Err(e) => return Some(Err(e)),
    };
    Some(
        serde_json::from_slice(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
    )
}
