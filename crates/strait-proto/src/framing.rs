//! Binary data-channel framing.
//!
//! ```text
//! +-----+----------------+-----------------+------+
//! | tag | len (u16, LE)  | payload (len B) | 0x00 |
//! +-----+----------------+-----------------+------+
//! ```
//!
//! The same frame carries JSON envelopes and raw chunk payloads.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const DEFAULT_CHANNEL_TAG: u8 = 50;
/// Tag byte, two length bytes and the terminator.
pub const FRAME_OVERHEAD: usize = 4;
pub const MAX_FRAME_PAYLOAD: usize = 65532;
pub const MAX_FRAME_LEN: usize = MAX_FRAME_PAYLOAD + FRAME_OVERHEAD;

const TERMINATOR: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(usize),
    #[error("frame shorter than its header: {0} bytes")]
    Truncated(usize),
    #[error("frame length mismatch: header declares {declared} payload bytes, frame holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame missing 0x00 terminator")]
    MissingTerminator,
    #[error("unexpected channel tag {found}, expected {expected}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("frame payload is not UTF-8")]
    InvalidUtf8,
}

/// Borrowed view of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub tag: u8,
    pub payload: &'a [u8],
}

pub fn encode_frame(tag: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
    out.put_u8(tag);
    out.put_u16_le(payload.len() as u16);
    out.extend_from_slice(payload);
    out.put_u8(TERMINATOR);
    Ok(out.freeze())
}

pub fn encode_text(tag: u8, text: &str) -> Result<Bytes, FrameError> {
    encode_frame(tag, text.as_bytes())
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated(bytes.len()));
    }
    let declared = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    let actual = bytes.len() - FRAME_OVERHEAD;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    if bytes[bytes.len() - 1] != TERMINATOR {
        return Err(FrameError::MissingTerminator);
    }
    Ok(Frame {
        tag: bytes[0],
        payload: &bytes[3..3 + declared],
    })
}

/// Decodes a string-carrying frame and checks its tag.
pub fn decode_text(tag: u8, bytes: &[u8]) -> Result<&str, FrameError> {
    let frame = decode_frame(bytes)?;
    if frame.tag != tag {
        return Err(FrameError::UnexpectedTag {
            expected: tag,
            found: frame.tag,
        });
    }
    std::str::from_utf8(frame.payload).map_err(|_| FrameError::InvalidUtf8)
}

/// One data-channel message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON object text carried by this message, if any.
    ///
    /// Plain text messages qualify when they hold a JSON object; binary
    /// messages qualify when they are a frame with `tag` whose payload does.
    pub fn json_text(&self, tag: u8) -> Option<Cow<'_, str>> {
        match self {
            ChannelMessage::Text(text) => looks_like_json(text).then(|| Cow::Borrowed(text.as_str())),
            ChannelMessage::Binary(bytes) => decode_text(tag, bytes)
                .ok()
                .filter(|text| looks_like_json(text))
                .map(|text| Cow::Owned(text.to_string())),
        }
    }

    /// Payload bytes, with framing removed when the message is a `tag` frame.
    pub fn payload(&self, tag: u8) -> Bytes {
        match self {
            ChannelMessage::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            ChannelMessage::Binary(bytes) => match decode_frame(bytes) {
                Ok(frame) if frame.tag == tag => {
                    bytes.slice(3..3 + frame.payload.len())
                }
                _ => bytes.clone(),
            },
        }
    }
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_layout() {
        let frame = encode_text(DEFAULT_CHANNEL_TAG, "hi").unwrap();
        assert_eq!(&frame[..], &[50, 2, 0, b'h', b'i', 0]);
        assert_eq!(decode_text(DEFAULT_CHANNEL_TAG, &frame).unwrap(), "hi");
    }

    #[test]
    fn boundary_lengths_round_trip() {
        for len in [0usize, 1, 255, 256, MAX_FRAME_PAYLOAD] {
            let text: String = std::iter::repeat('x').take(len).collect();
            let frame = encode_text(7, &text).unwrap();
            assert_eq!(frame.len(), len + FRAME_OVERHEAD);
            assert_eq!(decode_text(7, &frame).unwrap(), text);
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert_eq!(
            encode_frame(DEFAULT_CHANNEL_TAG, &payload),
            Err(FrameError::PayloadTooLarge(MAX_FRAME_PAYLOAD + 1))
        );
    }

    #[test]
    fn corrupt_frames_are_rejected() {
        assert_eq!(decode_frame(&[50, 0]), Err(FrameError::Truncated(2)));
        assert_eq!(
            decode_frame(&[50, 3, 0, b'a', 0]),
            Err(FrameError::LengthMismatch {
                declared: 3,
                actual: 1
            })
        );
        assert_eq!(
            decode_frame(&[50, 1, 0, b'a', 1]),
            Err(FrameError::MissingTerminator)
        );
        assert_eq!(
            decode_text(51, &[50, 1, 0, b'a', 0]),
            Err(FrameError::UnexpectedTag {
                expected: 51,
                found: 50
            })
        );
        assert_eq!(
            decode_text(50, &[50, 1, 0, 0xff, 0]),
            Err(FrameError::InvalidUtf8)
        );
    }

    #[test]
    fn json_text_only_matches_objects() {
        let framed = encode_text(DEFAULT_CHANNEL_TAG, r#"{"type":"buffer"}"#).unwrap();
        let message = ChannelMessage::Binary(framed);
        assert_eq!(
            message.json_text(DEFAULT_CHANNEL_TAG).as_deref(),
            Some(r#"{"type":"buffer"}"#)
        );
        assert_eq!(message.payload(DEFAULT_CHANNEL_TAG), Bytes::from_static(br#"{"type":"buffer"}"#));

        let raw = ChannelMessage::Binary(encode_frame(DEFAULT_CHANNEL_TAG, b"AAAA").unwrap());
        assert!(raw.json_text(DEFAULT_CHANNEL_TAG).is_none());
        assert_eq!(raw.payload(DEFAULT_CHANNEL_TAG), Bytes::from_static(b"AAAA"));

        let text = ChannelMessage::Text(" {\"a\":1} ".into());
        assert!(text.json_text(DEFAULT_CHANNEL_TAG).is_some());
        assert!(ChannelMessage::Text("plain".into())
            .json_text(DEFAULT_CHANNEL_TAG)
            .is_none());
    }
}
