use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RTP_VERSION: u8 = 2;
pub const RTP_FIXED_HEADER_LEN: usize = 12;

/// Header-extension profile that marks the bridge extension.
pub const BRIDGE_EXTENSION_PROFILE: u16 = 1667;
/// Profile, length, endpoint id, stream id and metadata.
pub const BRIDGE_EXTENSION_LEN: usize = 12;
/// Default byte offset of the endpoint id: fixed header plus the
/// extension's profile and length words.
pub const DEFAULT_ENDPOINT_ID_OFFSET: usize = RTP_FIXED_HEADER_LEN + 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("rtp packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported rtp version {0}")]
    BadVersion(u8),
    #[error("rtp {0} runs past the end of the packet")]
    Truncated(&'static str),
    #[error("rtp padding length {0} is invalid")]
    BadPadding(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
}

impl Codec {
    pub fn mime_type(self) -> &'static str {
        match self {
            Codec::H264 => "video/H264",
            Codec::H265 => "video/H265",
            Codec::Vp8 => "video/VP8",
            Codec::Vp9 => "video/VP9",
        }
    }

    pub fn clock_rate(self) -> u32 {
        90_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpExtension<'a> {
    pub profile: u16,
    pub data: &'a [u8],
}

/// Read-only view over an RTP packet on the wire.
#[derive(Debug, Clone)]
pub struct RtpPacket<'a> {
    raw: &'a [u8],
    /// End of the CSRC list, where a header extension starts.
    csrc_end: usize,
    sequence: u16,
    timestamp: u32,
    marker: bool,
    payload_type: u8,
    ssrc: u32,
    extension: Option<RtpExtension<'a>>,
    body: Range<usize>,
}

impl<'a> RtpPacket<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, RtpError> {
        if raw.len() < RTP_FIXED_HEADER_LEN {
            return Err(RtpError::TooShort(raw.len()));
        }
        let version = raw[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let has_padding = raw[0] & 0x20 != 0;
        let has_extension = raw[0] & 0x10 != 0;
        let csrc_count = (raw[0] & 0x0f) as usize;

        let csrc_end = RTP_FIXED_HEADER_LEN + csrc_count * 4;
        if raw.len() < csrc_end {
            return Err(RtpError::Truncated("csrc list"));
        }
        let mut offset = csrc_end;

        let extension = if has_extension {
            if raw.len() < offset + 4 {
                return Err(RtpError::Truncated("extension header"));
            }
            let profile = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
            let words = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
            let start = offset + 4;
            let end = start + words * 4;
            if raw.len() < end {
                return Err(RtpError::Truncated("extension body"));
            }
            offset = end;
            Some(RtpExtension {
                profile,
                data: &raw[start..end],
            })
        } else {
            None
        };

        let mut end = raw.len();
        if has_padding {
            let pad = raw[raw.len() - 1];
            if pad == 0 || (pad as usize) > end - offset {
                return Err(RtpError::BadPadding(pad));
            }
            end -= pad as usize;
        }

        Ok(Self {
            raw,
            csrc_end,
            sequence: u16::from_be_bytes([raw[2], raw[3]]),
            timestamp: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            marker: raw[1] & 0x80 != 0,
            payload_type: raw[1] & 0x7f,
            ssrc: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            extension,
            body: offset..end,
        })
    }

    /// Cheap check used to tell media datagrams from JSON ones.
    pub fn looks_like_rtp(datagram: &[u8]) -> bool {
        datagram.len() >= RTP_FIXED_HEADER_LEN && datagram[0] >> 6 == RTP_VERSION
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn extension(&self) -> Option<RtpExtension<'a>> {
        self.extension
    }

    pub fn body(&self) -> &'a [u8] {
        &self.raw[self.body.clone()]
    }

    /// Byte range of the body inside the raw packet.
    pub fn body_range(&self) -> Range<usize> {
        self.body.clone()
    }

    pub fn bridge_extension(&self) -> Option<BridgeExtension> {
        let extension = self.extension?;
        if extension.profile != BRIDGE_EXTENSION_PROFILE {
            return None;
        }
        BridgeExtension::from_body(extension.data)
    }

    /// Byte offset of the endpoint id when the packet carries a bridge
    /// extension.
    pub fn bridge_endpoint_offset(&self) -> Option<usize> {
        self.bridge_extension()?;
        Some(self.csrc_end + 4)
    }
}

/// Extension header used to multiplex bridged media by endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeExtension {
    pub endpoint_id: u16,
    pub stream_id: u16,
    pub metadata: u32,
}

impl BridgeExtension {
    /// Full extension header including profile and length words.
    pub fn encode(&self) -> [u8; BRIDGE_EXTENSION_LEN] {
        let mut out = [0u8; BRIDGE_EXTENSION_LEN];
        out[0..2].copy_from_slice(&BRIDGE_EXTENSION_PROFILE.to_be_bytes());
        out[2..4].copy_from_slice(&2u16.to_be_bytes());
        out[4..6].copy_from_slice(&self.endpoint_id.to_be_bytes());
        out[6..8].copy_from_slice(&self.stream_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.metadata.to_be_bytes());
        out
    }

    fn from_body(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            endpoint_id: u16::from_be_bytes([data[0], data[1]]),
            stream_id: u16::from_be_bytes([data[2], data[3]]),
            metadata: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// Copy of `raw` with `extension` spliced in after the CSRC list and the
/// extension bit set. RTP carries a single header extension, so one that is
/// already present is replaced. Payload and padding are kept byte for byte.
pub fn with_bridge_extension(raw: &[u8], extension: &BridgeExtension) -> Result<Vec<u8>, RtpError> {
    let packet = RtpPacket::parse(raw)?;
    let start = packet.csrc_end;
    let rest = match packet.extension {
        Some(existing) => start + 4 + existing.data.len(),
        None => start,
    };
    let mut out = Vec::with_capacity(raw.len() - rest + start + BRIDGE_EXTENSION_LEN);
    out.extend_from_slice(&raw[..start]);
    out[0] |= 0x10;
    out.extend_from_slice(&extension.encode());
    out.extend_from_slice(&raw[rest..]);
    Ok(out)
}

/// Writes `id` at `offset`. Packets too short to hold a bridge extension
/// past that offset are left untouched and `false` is returned.
pub fn stamp_endpoint_id(packet: &mut [u8], offset: usize, id: u16) -> bool {
    if packet.len() <= offset + 13 {
        return false;
    }
    packet[offset..offset + 2].copy_from_slice(&id.to_be_bytes());
    true
}

pub fn read_endpoint_id(packet: &[u8], offset: usize) -> Option<u16> {
    if packet.len() <= offset + 13 {
        return None;
    }
    Some(u16::from_be_bytes([packet[offset], packet[offset + 1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_extension(sequence: u16, marker: bool, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0x90, 96 | if marker { 0x80 } else { 0 }];
        raw.extend_from_slice(&sequence.to_be_bytes());
        raw.extend_from_slice(&3000u32.to_be_bytes());
        raw.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        raw.extend_from_slice(
            &BridgeExtension {
                endpoint_id: 0,
                stream_id: 1,
                metadata: 7,
            }
            .encode(),
        );
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn parses_header_fields_and_extension() {
        let raw = packet_with_extension(513, true, b"payload");
        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.sequence(), 513);
        assert_eq!(packet.timestamp(), 3000);
        assert!(packet.marker());
        assert_eq!(packet.payload_type(), 96);
        assert_eq!(packet.ssrc(), 0xdead_beef);
        assert_eq!(packet.body(), b"payload");
        let ext = packet.bridge_extension().unwrap();
        assert_eq!((ext.stream_id, ext.metadata), (1, 7));
    }

    #[test]
    fn padding_is_stripped() {
        let mut raw = vec![0xa0, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2];
        raw.extend_from_slice(b"abc");
        raw.extend_from_slice(&[0, 0, 3]);
        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.body(), b"abc");

        let mut bad = raw.clone();
        *bad.last_mut().unwrap() = 40;
        assert_eq!(RtpPacket::parse(&bad).unwrap_err(), RtpError::BadPadding(40));
    }

    #[test]
    fn rejects_short_and_foreign_datagrams() {
        assert_eq!(RtpPacket::parse(&[0x80; 4]).unwrap_err(), RtpError::TooShort(4));
        let json = br#"{"type":"ping","rpc":1}"#;
        assert!(!RtpPacket::looks_like_rtp(json));
        assert!(matches!(RtpPacket::parse(json), Err(RtpError::BadVersion(1))));
    }

    #[test]
    fn endpoint_stamp_lands_in_bridge_extension() {
        let mut raw = packet_with_extension(1, false, b"frame");
        assert!(stamp_endpoint_id(&mut raw, DEFAULT_ENDPOINT_ID_OFFSET, 42));
        assert_eq!(read_endpoint_id(&raw, DEFAULT_ENDPOINT_ID_OFFSET), Some(42));
        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.bridge_extension().unwrap().endpoint_id, 42);

        let mut short = vec![0x80; DEFAULT_ENDPOINT_ID_OFFSET + 13];
        assert!(!stamp_endpoint_id(&mut short, DEFAULT_ENDPOINT_ID_OFFSET, 1));
        assert_eq!(read_endpoint_id(&short, DEFAULT_ENDPOINT_ID_OFFSET), None);
    }

    #[test]
    fn splicing_keeps_the_payload_intact() {
        let mut raw = vec![0x80, 96, 0, 9, 0, 0, 0x0b, 0xb8, 0, 0, 0, 5];
        let body: Vec<u8> = (0..40u8).map(|i| i ^ 0x41).collect();
        raw.extend_from_slice(&body);

        let plain = RtpPacket::parse(&raw).unwrap();
        assert!(plain.bridge_extension().is_none());
        assert_eq!(plain.bridge_endpoint_offset(), None);

        let extension = BridgeExtension {
            endpoint_id: 7,
            ..Default::default()
        };
        let spliced = with_bridge_extension(&raw, &extension).unwrap();
        assert_eq!(spliced.len(), raw.len() + BRIDGE_EXTENSION_LEN);
        let packet = RtpPacket::parse(&spliced).unwrap();
        assert_eq!(packet.sequence(), 9);
        assert_eq!(packet.timestamp(), 3000);
        assert_eq!(packet.body(), body.as_slice());
        assert_eq!(packet.bridge_extension(), Some(extension));
        assert_eq!(packet.bridge_endpoint_offset(), Some(DEFAULT_ENDPOINT_ID_OFFSET));
        assert_eq!(read_endpoint_id(&spliced, DEFAULT_ENDPOINT_ID_OFFSET), Some(7));
    }

    #[test]
    fn splicing_replaces_a_foreign_extension_after_the_csrcs() {
        // One CSRC and a one-byte-header extension (profile 0xbede).
        let mut raw = vec![0x91, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2];
        raw.extend_from_slice(&[0, 0, 0, 3]);
        raw.extend_from_slice(&[0xbe, 0xde, 0, 1, 0x10, 0xff, 0, 0]);
        raw.extend_from_slice(b"frame bytes");

        let extension = BridgeExtension {
            endpoint_id: 300,
            stream_id: 2,
            metadata: 0,
        };
        let spliced = with_bridge_extension(&raw, &extension).unwrap();
        let packet = RtpPacket::parse(&spliced).unwrap();
        assert_eq!(&spliced[12..16], &[0, 0, 0, 3]);
        assert_eq!(packet.body(), b"frame bytes");
        assert_eq!(packet.bridge_extension(), Some(extension));
        assert_eq!(packet.bridge_endpoint_offset(), Some(DEFAULT_ENDPOINT_ID_OFFSET + 4));

        assert_eq!(with_bridge_extension(&raw[..8], &extension), Err(RtpError::TooShort(8)));
    }
}
