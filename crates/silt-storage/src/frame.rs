//! Length-prefixed record framing shared by every blob format.
//!
//! A frame is a little-endian `u32` byte length followed by the bincode
//! encoding of one item. Blobs are plain concatenations of frames, so any
//! frame boundary is a valid place to start reading.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult};

const LEN_BYTES: usize = 4;

/// Append one frame to `buf`, returning the number of bytes written.
pub fn encode_frame<T: Serialize>(buf: &mut Vec<u8>, item: &T) -> StorageResult<usize> {
    let body = bincode::serialize(item)?;
    let len = u32::try_from(body.len()).map_err(|_| StorageError::Serialization {
        reason: format!("frame of {} bytes exceeds u32", body.len()),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(LEN_BYTES + body.len())
}

/// Encode a whole sequence of items as concatenated frames.
pub fn encode_frames<'a, T, I>(items: I) -> StorageResult<Vec<u8>>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut buf = Vec::new();
    for item in items {
        encode_frame(&mut buf, item)?;
    }
    Ok(buf)
}

/// Byte length of the frame at the start of `buf`, or `None` while it is
/// still incomplete. Used when frames arrive in arbitrary chunks.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < LEN_BYTES {
        return None;
    }
    let mut len_bytes = [0u8; LEN_BYTES];
    len_bytes.copy_from_slice(&buf[..LEN_BYTES]);
    let end = LEN_BYTES + u32::from_le_bytes(len_bytes) as usize;
    (buf.len() >= end).then_some(end)
}

/// Incremental decoder over a byte slice of frames.
pub struct FrameDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameDecoder<'a> {
    /// Start decoding at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Byte offset of the next frame.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode the next frame, or `None` at a clean end of input.
    pub fn next_item<T: DeserializeOwned>(&mut self) -> StorageResult<Option<T>> {
        let rest = &self.buf[self.pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.len() < LEN_BYTES {
            return Err(truncated(self.pos));
        }
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(&rest[..LEN_BYTES]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let end = LEN_BYTES + len;
        if rest.len() < end {
            return Err(truncated(self.pos));
        }
        let item = bincode::deserialize(&rest[LEN_BYTES..end])?;
        self.pos += end;
        Ok(Some(item))
    }
}

fn truncated(at: usize) -> StorageError {
    StorageError::Serialization {
        reason: format!("truncated frame at byte {}", at),
    }
}

/// Decode every frame in `buf`.
pub fn decode_frames<T: DeserializeOwned>(buf: &[u8]) -> StorageResult<Vec<T>> {
    let mut decoder = FrameDecoder::new(buf);
    let mut out = Vec::new();
    while let Some(item) = decoder.next_item()? {
        out.push(item);
    }
    Ok(out)
}
