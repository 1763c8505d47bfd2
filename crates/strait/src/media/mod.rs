//! Receive-side video: RTP packets in, decoded frames out.
//!
//! [`FrameReassembler`] groups packets into codec access units and
//! [`DecodeWorker`] runs a [`FrameDecoder`] over them on its own task queue.
//! [`MediaReceiver`] wires both to a session's media track.

mod decoder;
pub mod depacketize;
mod reassembler;

use bytes::Bytes;
use strait_proto::Codec;
use thiserror::Error;

pub use self::decoder::{DecodeWorker, FrameCallback, MediaReceiver};
pub use self::reassembler::{
    DEFAULT_MAX_BUCKETS, FrameReassembler, PushOutcome, ReassemblerConfig, ReassemblyStats,
    UnitSink,
};

/// One complete encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub codec: Codec,
    /// RTP timestamp shared by every packet of the frame.
    pub timestamp: u32,
    pub keyframe: bool,
    /// Annex-B for H.264/H.265, the raw frame for VP8/VP9.
    pub data: Bytes,
}

/// A decoded picture in planar I420.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub planes: Bytes,
    pub timestamp: u32,
}

impl DecodedFrame {
    /// Byte length of an I420 picture of this size.
    pub fn expected_len(width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
        luma + 2 * chroma
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{codec:?} decoder rejected frame {timestamp}: {reason}")]
    Rejected {
        codec: Codec,
        timestamp: u32,
        reason: String,
    },
    #[error("decoder needs a key frame first")]
    NeedKeyframe,
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
}

/// Opaque video decoder.
///
/// `Ok(None)` means the unit was accepted but produced no picture yet.
pub trait FrameDecoder: Send {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<DecodedFrame>, DecodeError>;
}
