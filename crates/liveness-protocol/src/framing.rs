//! Length-prefixed framing for [`WireMessage`]s.
//!
//! Every message on the socket looks like:
//!
//! ```text
//! ┌──────────────┬─────────┬──────────────────────────┐
//! │ length: u32  │ tag: u8 │ payload (length - 1)     │
//! └──────────────┴─────────┴──────────────────────────┘
//! ```
//!
//! `length` counts the tag and payload, big-endian. Payloads per tag:
//!
//! | tag  | message           | payload                                  |
//! |------|-------------------|------------------------------------------|
//! | 0x01 | FrameRequest      | `seq: u64`, frame                        |
//! | 0x02 | FrameResponse     | `seq: u64`, `present: u8`, frame if 1    |
//! | 0x03 | TextNotification  | UTF-8 text                               |
//! | 0x04 | AliveNotification | `u8` bool                                |
//! | 0x05 | CapturePrompt     | `u8` bool                                |
//! | 0x06 | ControlCommand    | `kind: u8`, UTF-8 text                   |
//!
//! [`encode`] / [`decode`] work on complete messages. [`WireCodec`] plugs
//! the same format into `tokio_util::codec` for streaming use; it reads
//! exactly `length` bytes before looking at the tag, so a bad payload never
//! desynchronizes the stream.

use bytes::{Buf, BufMut, BytesMut};
use liveness_core::{decode_frame, encode_frame_into};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FramingError, WireError};
use crate::message::{ControlKind, MessageTag, WireMessage};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest accepted `length` value (64 MiB, enough for an uncompressed 4K BGRA frame).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encodes a complete message, length prefix included.
pub fn encode(msg: &WireMessage) -> Vec<u8> {
    let body = encode_body(msg);
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Encodes the tag and payload of a message (no length prefix).
pub fn encode_body(msg: &WireMessage) -> Vec<u8> {
    let mut body = vec![msg.tag() as u8];
    match msg {
        WireMessage::FrameRequest { seq, frame } => {
            body.extend_from_slice(&seq.to_be_bytes());
            encode_frame_into(frame, &mut body);
        }
        WireMessage::FrameResponse { seq, frame } => {
            body.extend_from_slice(&seq.to_be_bytes());
            match frame {
                Some(frame) => {
                    body.push(1);
                    encode_frame_into(frame, &mut body);
                }
                None => body.push(0),
            }
        }
        WireMessage::TextNotification { text } => body.extend_from_slice(text.as_bytes()),
        WireMessage::AliveNotification { alive } => body.push(u8::from(*alive)),
        WireMessage::CapturePrompt { take_picture } => body.push(u8::from(*take_picture)),
        WireMessage::ControlCommand { kind, text } => {
            body.push(kind.as_u8());
            body.extend_from_slice(text.as_bytes());
        }
    }
    body
}

/// Decodes exactly one complete message, length prefix included.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, FramingError> {
    let prefix = bytes
        .get(..LENGTH_PREFIX_SIZE)
        .ok_or(FramingError::Truncated {
            expected: LENGTH_PREFIX_SIZE + 1,
            actual: bytes.len(),
        })?;
    let len = read_len(prefix);

    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let body = bytes.get(LENGTH_PREFIX_SIZE..).unwrap_or_default();
    if body.len() < len || len == 0 {
        return Err(FramingError::Truncated {
            expected: LENGTH_PREFIX_SIZE + len.max(1),
            actual: bytes.len(),
        });
    }
    if body.len() > len {
        return Err(FramingError::InvalidPayload(format!(
            "{} trailing bytes after message",
            body.len() - len
        )));
    }

    decode_body(body)
}

/// Decodes a tag and payload (no length prefix).
pub fn decode_body(body: &[u8]) -> Result<WireMessage, FramingError> {
    let mut cursor = Cursor::new(body);
    let tag_id = cursor.u8()?;
    let tag = MessageTag::from_u8(tag_id).ok_or(FramingError::UnknownTag(tag_id))?;

    let msg = match tag {
        MessageTag::FrameRequest => {
            let seq = cursor.u64()?;
            WireMessage::FrameRequest {
                seq,
                frame: decode_frame(cursor.rest())?,
            }
        }
        MessageTag::FrameResponse => {
            let seq = cursor.u64()?;
            let frame = match cursor.bool()? {
                true => Some(decode_frame(cursor.rest())?),
                false => {
                    cursor.finish()?;
                    None
                }
            };
            WireMessage::FrameResponse { seq, frame }
        }
        MessageTag::TextNotification => WireMessage::TextNotification {
            text: utf8(cursor.rest())?,
        },
        MessageTag::AliveNotification => {
            let alive = cursor.bool()?;
            cursor.finish()?;
            WireMessage::AliveNotification { alive }
        }
        MessageTag::CapturePrompt => {
            let take_picture = cursor.bool()?;
            cursor.finish()?;
            WireMessage::CapturePrompt { take_picture }
        }
        MessageTag::ControlCommand => {
            let kind_id = cursor.u8()?;
            let kind = ControlKind::from_u8(kind_id).ok_or_else(|| {
                FramingError::InvalidPayload(format!("unknown control kind {kind_id:#04x}"))
            })?;
            WireMessage::ControlCommand {
                kind,
                text: utf8(cursor.rest())?,
            }
        }
    };
    Ok(msg)
}

fn read_len(prefix: &[u8]) -> usize {
    let mut raw = [0u8; LENGTH_PREFIX_SIZE];
    for (dst, src) in raw.iter_mut().zip(prefix) {
        *dst = *src;
    }
    u32::from_be_bytes(raw) as usize
}

fn utf8(bytes: &[u8]) -> Result<String, FramingError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| FramingError::InvalidPayload(format!("text is not UTF-8: {e}")))
}

/// Forward-only reader over a message body.
struct Cursor<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, consumed: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        let chunk = self.buf.get(..n).ok_or(FramingError::Truncated {
            expected: self.consumed + n,
            actual: self.consumed + self.buf.len(),
        })?;
        self.buf = self.buf.get(n..).unwrap_or_default();
        self.consumed += n;
        Ok(chunk)
    }

    fn u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?.first().copied().unwrap_or_default())
    }

    fn u64(&mut self) -> Result<u64, FramingError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn bool(&mut self) -> Result<bool, FramingError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FramingError::InvalidPayload(format!(
                "expected boolean 0 or 1, got {other}"
            ))),
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.consumed += rest.len();
        self.buf = &[];
        rest
    }

    fn finish(&self) -> Result<(), FramingError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FramingError::InvalidPayload(format!(
                "{} trailing bytes after payload",
                self.buf.len()
            )))
        }
    }
}

/// Streaming codec for the detector socket.
///
/// Decoded items are `Result`s: a malformed message is yielded as
/// `Some(Err(..))` and the stream continues with the next one. Only
/// unrecoverable conditions (I/O failure, impossible length prefix) are
/// returned as the decoder's error.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_message_size: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Result<WireMessage, FramingError>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(prefix) = src.get(..LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        let len = read_len(prefix);

        if len == 0 {
            return Err(WireError::EmptyFrame);
        }
        if len > self.max_message_size {
            return Err(WireError::Oversized {
                size: len,
                max: self.max_message_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(len);
        Ok(Some(decode_body(&body)))
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&item);
        if body.len() > self.max_message_size {
            return Err(WireError::Oversized {
                size: body.len(),
                max: self.max_message_size,
            });
        }
        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
