//! Wire definitions shared by every strait component.
//! Kept free of async and transport code so the envelope, framing and RTP
//! layouts can be reused by tools that only need to speak the protocol.

pub mod envelope;
pub mod framing;
pub mod rtp;

pub use envelope::{
    endpoint_id, envelope_type, stamp_endpoint_id, BufferControl, BufferFormat, BufferState,
    CandidatePayload, Envelope, EnvelopeError, RELAY_LEVEL_ID,
};
pub use framing::{
    decode_frame, decode_text, encode_frame, encode_text, ChannelMessage, Frame, FrameError,
    DEFAULT_CHANNEL_TAG, FRAME_OVERHEAD, MAX_FRAME_LEN, MAX_FRAME_PAYLOAD,
};
pub use rtp::{
    read_endpoint_id, stamp_endpoint_id as stamp_rtp_endpoint_id, with_bridge_extension,
    BridgeExtension, Codec, RtpError, RtpExtension, RtpPacket, BRIDGE_EXTENSION_LEN,
    BRIDGE_EXTENSION_PROFILE, DEFAULT_ENDPOINT_ID_OFFSET, RTP_FIXED_HEADER_LEN,
};
