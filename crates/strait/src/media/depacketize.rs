//! RTP payload formats for the supported video codecs.
//!
//! Each function takes the RTP bodies of one frame in sequence order and
//! returns the codec bitstream for a decoder: Annex-B for H.264/H.265, raw
//! frame data for VP8/VP9.

use bytes::{BufMut, Bytes, BytesMut};
use strait_proto::Codec;
use thiserror::Error;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DepacketizeError {
    #[error("empty payload")]
    Empty,
    #[error("{0} truncated")]
    Truncated(&'static str),
    #[error("unsupported packetization type {0}")]
    Unsupported(u8),
    #[error("fragment continues a unit that never started")]
    MissingStart,
    #[error("fragmented unit never ended")]
    MissingEnd,
    #[error("first packet does not start a frame")]
    NoFrameStart,
    #[error("last packet does not end a frame")]
    NoFrameEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depacketized {
    pub data: Bytes,
    pub keyframe: bool,
}

pub fn depacketize(codec: Codec, payloads: &[&[u8]]) -> Result<Depacketized, DepacketizeError> {
    if payloads.is_empty() {
        return Err(DepacketizeError::Empty);
    }
    match codec {
        Codec::H264 => h264(payloads),
        Codec::H265 => h265(payloads),
        Codec::Vp8 => vp8(payloads),
        Codec::Vp9 => vp9(payloads),
    }
}

/// Whether `payload` may be the first packet of a frame. Only fragment
/// continuations and descriptors without a start flag are ruled out.
pub fn starts_frame(codec: Codec, payload: &[u8]) -> bool {
    match codec {
        Codec::H264 => match payload {
            [header, fu, ..] if header & 0x1f == 28 => fu & 0x80 != 0,
            [_, ..] => true,
            [] => false,
        },
        Codec::H265 => match payload {
            [header, _, fu, ..] if (header >> 1) & 0x3f == 49 => fu & 0x80 != 0,
            [_, _, ..] => true,
            _ => false,
        },
        Codec::Vp8 => matches!(payload.first(), Some(byte) if byte & 0x10 != 0 && byte & 0x07 == 0),
        Codec::Vp9 => matches!(payload.first(), Some(byte) if byte & 0x08 != 0),
    }
}

/// Reassembles fragmented NAL units across packets.
struct NalWriter {
    out: BytesMut,
    in_fragment: bool,
    keyframe: bool,
}

impl NalWriter {
    fn new() -> Self {
        Self {
            out: BytesMut::new(),
            in_fragment: false,
            keyframe: false,
        }
    }

    fn whole(&mut self, nal: &[u8]) -> Result<(), DepacketizeError> {
        if self.in_fragment {
            return Err(DepacketizeError::MissingEnd);
        }
        self.out.put_slice(&START_CODE);
        self.out.put_slice(nal);
        Ok(())
    }

    fn fragment(
        &mut self,
        start: bool,
        end: bool,
        header: &[u8],
        data: &[u8],
    ) -> Result<(), DepacketizeError> {
        if start {
            if self.in_fragment {
                return Err(DepacketizeError::MissingEnd);
            }
            self.out.put_slice(&START_CODE);
            self.out.put_slice(header);
            self.in_fragment = true;
        } else if !self.in_fragment {
            return Err(DepacketizeError::MissingStart);
        }
        self.out.put_slice(data);
        if end {
            self.in_fragment = false;
        }
        Ok(())
    }

    fn finish(self) -> Result<Depacketized, DepacketizeError> {
        if self.in_fragment {
            return Err(DepacketizeError::MissingEnd);
        }
        Ok(Depacketized {
            data: self.out.freeze(),
            keyframe: self.keyframe,
        })
    }
}

// RFC 6184, non-interleaved mode.
fn h264(payloads: &[&[u8]]) -> Result<Depacketized, DepacketizeError> {
    let mut writer = NalWriter::new();
    for payload in payloads {
        let Some(&header) = payload.first() else {
            return Err(DepacketizeError::Empty);
        };
        match header & 0x1f {
            nal_type @ 1..=23 => {
                writer.keyframe |= nal_type == 5;
                writer.whole(payload)?;
            }
            24 => {
                let mut rest = &payload[1..];
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return Err(DepacketizeError::Truncated("STAP-A size"));
                    }
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    let nal = rest
                        .get(2..2 + size)
                        .ok_or(DepacketizeError::Truncated("STAP-A unit"))?;
                    if let Some(&first) = nal.first() {
                        writer.keyframe |= first & 0x1f == 5;
                        writer.whole(nal)?;
                    }
                    rest = &rest[2 + size..];
                }
            }
            28 => {
                let fu = *payload.get(1).ok_or(DepacketizeError::Truncated("FU-A header"))?;
                let nal_type = fu & 0x1f;
                writer.keyframe |= nal_type == 5;
                let reconstructed = [(header & 0xe0) | nal_type];
                writer.fragment(fu & 0x80 != 0, fu & 0x40 != 0, &reconstructed, &payload[2..])?;
            }
            other => return Err(DepacketizeError::Unsupported(other)),
        }
    }
    writer.finish()
}

fn h265_is_irap(nal_type: u8) -> bool {
    (16..=21).contains(&nal_type)
}

// RFC 7798 without DONL fields.
fn h265(payloads: &[&[u8]]) -> Result<Depacketized, DepacketizeError> {
    let mut writer = NalWriter::new();
    for payload in payloads {
        if payload.len() < 2 {
            return Err(DepacketizeError::Truncated("NAL unit header"));
        }
        let nal_type = (payload[0] >> 1) & 0x3f;
        match nal_type {
            0..=47 => {
                writer.keyframe |= h265_is_irap(nal_type);
                writer.whole(payload)?;
            }
            48 => {
                let mut rest = &payload[2..];
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return Err(DepacketizeError::Truncated("AP size"));
                    }
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    let nal = rest
                        .get(2..2 + size)
                        .ok_or(DepacketizeError::Truncated("AP unit"))?;
                    if nal.len() >= 2 {
                        writer.keyframe |= h265_is_irap((nal[0] >> 1) & 0x3f);
                        writer.whole(nal)?;
                    }
                    rest = &rest[2 + size..];
                }
            }
            49 => {
                let fu = *payload.get(2).ok_or(DepacketizeError::Truncated("FU header"))?;
                let fu_type = fu & 0x3f;
                writer.keyframe |= h265_is_irap(fu_type);
                let reconstructed = [(payload[0] & 0x81) | (fu_type << 1), payload[1]];
                writer.fragment(fu & 0x80 != 0, fu & 0x40 != 0, &reconstructed, &payload[3..])?;
            }
            other => return Err(DepacketizeError::Unsupported(other)),
        }
    }
    writer.finish()
}

struct Vp8Descriptor {
    len: usize,
    start: bool,
    partition: u8,
}

// RFC 7741 section 4.2.
fn vp8_descriptor(payload: &[u8]) -> Result<Vp8Descriptor, DepacketizeError> {
    let first = *payload.first().ok_or(DepacketizeError::Empty)?;
    let mut len = 1;
    if first & 0x80 != 0 {
        let extension = *payload.get(1).ok_or(DepacketizeError::Truncated("VP8 descriptor"))?;
        len += 1;
        if extension & 0x80 != 0 {
            let picture = *payload.get(len).ok_or(DepacketizeError::Truncated("VP8 picture id"))?;
            len += if picture & 0x80 != 0 { 2 } else { 1 };
        }
        if extension & 0x40 != 0 {
            len += 1;
        }
        if extension & 0x30 != 0 {
            len += 1;
        }
    }
    if payload.len() < len {
        return Err(DepacketizeError::Truncated("VP8 descriptor"));
    }
    Ok(Vp8Descriptor {
        len,
        start: first & 0x10 != 0,
        partition: first & 0x07,
    })
}

fn vp8(payloads: &[&[u8]]) -> Result<Depacketized, DepacketizeError> {
    let mut out = BytesMut::new();
    let mut keyframe = false;
    for (index, payload) in payloads.iter().enumerate() {
        let descriptor = vp8_descriptor(payload)?;
        let body = &payload[descriptor.len..];
        if index == 0 {
            if !descriptor.start || descriptor.partition != 0 {
                return Err(DepacketizeError::NoFrameStart);
            }
            // Inverse key frame flag clear plus the key frame start code.
            keyframe = body.len() >= 6 && body[0] & 0x01 == 0 && body[3..6] == [0x9d, 0x01, 0x2a];
        }
        out.put_slice(body);
    }
    Ok(Depacketized {
        data: out.freeze(),
        keyframe,
    })
}

struct Vp9Descriptor {
    len: usize,
    inter_predicted: bool,
    begins: bool,
    ends: bool,
}

// draft-ietf-payload-vp9, section 4.2.
fn vp9_descriptor(payload: &[u8]) -> Result<Vp9Descriptor, DepacketizeError> {
    let first = *payload.first().ok_or(DepacketizeError::Empty)?;
    let has_picture_id = first & 0x80 != 0;
    let inter_predicted = first & 0x40 != 0;
    let has_layers = first & 0x20 != 0;
    let flexible = first & 0x10 != 0;
    let has_ss = first & 0x02 != 0;
    let byte = |at: usize| {
        payload
            .get(at)
            .copied()
            .ok_or(DepacketizeError::Truncated("VP9 descriptor"))
    };

    let mut len = 1;
    if has_picture_id {
        len += if byte(len)? & 0x80 != 0 { 2 } else { 1 };
    }
    if has_layers {
        len += if flexible { 1 } else { 2 };
    }
    if flexible && inter_predicted {
        // Up to three reference indices, each flagging whether another follows.
        for _ in 0..3 {
            let reference = byte(len)?;
            len += 1;
            if reference & 0x01 == 0 {
                break;
            }
        }
    }
    if has_ss {
        let ss = byte(len)?;
        len += 1;
        let spatial_layers = (ss >> 5) as usize + 1;
        if ss & 0x10 != 0 {
            len += spatial_layers * 4;
        }
        if ss & 0x08 != 0 {
            let groups = byte(len)?;
            len += 1;
            for _ in 0..groups {
                let group = byte(len)?;
                len += 1 + ((group >> 2) & 0x03) as usize;
            }
        }
    }
    if payload.len() < len {
        return Err(DepacketizeError::Truncated("VP9 descriptor"));
    }
    Ok(Vp9Descriptor {
        len,
        inter_predicted,
        begins: first & 0x08 != 0,
        ends: first & 0x04 != 0,
    })
}

fn vp9(payloads: &[&[u8]]) -> Result<Depacketized, DepacketizeError> {
    let mut out = BytesMut::new();
    let mut keyframe = false;
    let last = payloads.len() - 1;
    for (index, payload) in payloads.iter().enumerate() {
        let descriptor = vp9_descriptor(payload)?;
        if index == 0 {
            if !descriptor.begins {
                return Err(DepacketizeError::NoFrameStart);
            }
            keyframe = !descriptor.inter_predicted;
        }
        if index == last && !descriptor.ends {
            return Err(DepacketizeError::NoFrameEnd);
        }
        out.put_slice(&payload[descriptor.len..]);
    }
    Ok(Depacketized {
        data: out.freeze(),
        keyframe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_single_stap_and_fu_a_become_annex_b() {
        let sps: [u8; 3] = [0x67, 0x42, 0x00];
        let mut stap: Vec<u8> = vec![0x78];
        stap.extend_from_slice(&[0, 2, 0x68, 0xce]);
        stap.extend_from_slice(&[0, 1, 0x06]);
        let fu_start: [u8; 4] = [0x7c, 0x85, 0xaa, 0xbb];
        let fu_end: [u8; 3] = [0x7c, 0x45, 0xcc];

        let out = depacketize(Codec::H264, &[&sps, &stap, &fu_start, &fu_end]).unwrap();
        assert!(out.keyframe);
        let parts: [&[u8]; 8] = [
            &START_CODE,
            &sps,
            &START_CODE,
            &[0x68, 0xce],
            &START_CODE,
            &[0x06],
            &START_CODE,
            &[0x65, 0xaa, 0xbb, 0xcc],
        ];
        let expected = parts.concat();
        assert_eq!(out.data.as_ref(), expected.as_slice());
    }

    #[test]
    fn h264_fragments_need_start_and_end() {
        let middle: [u8; 3] = [0x7c, 0x05, 0x01];
        let start: [u8; 3] = [0x7c, 0x85, 0x01];
        assert_eq!(
            depacketize(Codec::H264, &[&middle]),
            Err(DepacketizeError::MissingStart)
        );
        assert_eq!(
            depacketize(Codec::H264, &[&start]),
            Err(DepacketizeError::MissingEnd)
        );
        assert_eq!(
            depacketize(Codec::H264, &[&[0x19, 0x00]]),
            Err(DepacketizeError::Unsupported(25))
        );
        assert!(!starts_frame(Codec::H264, &middle));
        assert!(starts_frame(Codec::H264, &start));
    }

    #[test]
    fn h265_aggregation_and_fragments() {
        // AP carrying a VPS (32) and an IDR_W_RADL (19) split over an FU.
        let mut ap: Vec<u8> = vec![48 << 1, 0x01];
        ap.extend_from_slice(&[0, 3, 32 << 1, 0x01, 0xaa]);
        let fu_start: [u8; 4] = [49 << 1, 0x01, 0x80 | 19, 0x10];
        let fu_end: [u8; 4] = [49 << 1, 0x01, 0x40 | 19, 0x20];
        let out = depacketize(Codec::H265, &[&ap, &fu_start, &fu_end]).unwrap();
        assert!(out.keyframe);
        let parts: [&[u8]; 4] = [
            &START_CODE,
            &[32 << 1, 0x01, 0xaa],
            &START_CODE,
            &[19 << 1, 0x01, 0x10, 0x20],
        ];
        let expected = parts.concat();
        assert_eq!(out.data.as_ref(), expected.as_slice());
    }

    #[test]
    fn vp8_descriptor_and_keyframe() {
        // X=1, S=1, PID=0; I=1 with a 15-bit picture id.
        let first: [u8; 10] = [0x90, 0x80, 0x81, 0x23, 0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a];
        let second: [u8; 3] = [0x80, 0x00, 0xee];
        let out = depacketize(Codec::Vp8, &[&first, &second]).unwrap();
        assert!(out.keyframe);
        assert_eq!(out.data.as_ref(), &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0xee]);

        let inter: [u8; 4] = [0x10, 0x01, 0x00, 0x00];
        assert!(!depacketize(Codec::Vp8, &[&inter]).unwrap().keyframe);
        assert_eq!(
            depacketize(Codec::Vp8, &[&second]),
            Err(DepacketizeError::NoFrameStart)
        );
    }

    #[test]
    fn vp9_requires_begin_and_end() {
        // I=1 (7-bit id), B=1 / E=1, with a scalability structure on the first.
        let first: [u8; 8] = [0x8a, 0x05, 0x10, 0x07, 0x80, 0x04, 0x38, 0xaa];
        let last: [u8; 3] = [0x84, 0x05, 0xbb];
        let out = depacketize(Codec::Vp9, &[&first, &last]).unwrap();
        assert!(out.keyframe);
        assert_eq!(out.data.as_ref(), &[0xaa, 0xbb]);

        let inter: [u8; 2] = [0x4c, 0xcc];
        assert!(!depacketize(Codec::Vp9, &[&inter]).unwrap().keyframe);
        assert_eq!(
            depacketize(Codec::Vp9, &[&first]),
            Err(DepacketizeError::NoFrameEnd)
        );
        assert_eq!(
            depacketize(Codec::Vp9, &[&last]),
            Err(DepacketizeError::NoFrameStart)
        );
    }
}
