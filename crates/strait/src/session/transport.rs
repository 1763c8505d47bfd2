use std::sync::Arc;

use bytes::Bytes;
use strait_proto::{CandidatePayload, ChannelMessage, Codec, Envelope};

use crate::config::SessionConfig;
use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP blob and whether it is an offer or an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    kind: SdpKind,
    sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn to_envelope(&self) -> Envelope {
        match self.kind {
            SdpKind::Offer => Envelope::Offer {
                sdp: self.sdp.clone(),
            },
            SdpKind::Answer => Envelope::Answer {
                sdp: self.sdp.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    /// May be empty when the sender only knows the m-line index.
    pub mid: String,
    pub mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, mid: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            mid: mid.into(),
            mline_index: None,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::IceCandidate {
            candidate: CandidatePayload {
                candidate: self.candidate.clone(),
                sdp_mid: Some(self.mid.clone()),
                sdp_mline_index: self.mline_index,
            },
        }
    }
}

impl From<CandidatePayload> for IceCandidate {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            mid: payload.sdp_mid.unwrap_or_default(),
            mline_index: payload.sdp_mline_index,
        }
    }
}

/// Connectivity as reported by the peer-connection library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRole {
    Send,
    Receive,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    ChannelOpen,
    ChannelMessage(ChannelMessage),
    ChannelClosed,
    RtpPacket(Bytes),
}

pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Seam over the peer-connection library.
///
/// Methods block the calling thread; `create_offer` and `create_answer`
/// return only once ICE gathering has completed. Events are delivered on the
/// library's own threads through the subscribed handler.
pub trait PeerTransport: Send + Sync {
    fn subscribe(&self, handler: TransportEventHandler);
    fn create_offer(&self) -> Result<SessionDescriptor, ConnectionError>;
    fn create_answer(&self) -> Result<SessionDescriptor, ConnectionError>;
    fn apply_remote(&self, description: &SessionDescriptor) -> Result<(), ConnectionError>;
    fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), ConnectionError>;
    fn send(&self, message: ChannelMessage) -> Result<(), ConnectionError>;
    fn max_message_size(&self) -> usize;
    fn open_media_track(&self, role: TrackRole, codec: Codec) -> Result<(), ConnectionError>;
    fn send_rtp(&self, packet: &[u8]) -> Result<(), ConnectionError>;
    fn request_keyframe(&self) -> Result<(), ConnectionError>;
    fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &SessionConfig) -> Result<Arc<dyn PeerTransport>, ConnectionError>;
}
