use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use strait_proto::{ChannelMessage, Codec, MAX_FRAME_LEN};

use super::transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescriptor, TrackRole, TransportEvent,
    TransportEventHandler, TransportFactory, TransportState,
};
use crate::config::SessionConfig;
use crate::error::ConnectionError;

static NEXT_MOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Builds a minimal but well-formed SDP with one section per mid. The first
/// section is the data channel, the rest are video.
pub fn mock_sdp(session_id: u64, mids: &[&str], bundle: bool) -> String {
    let mut sdp = format!("v=0\r\no=- {session_id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    if bundle && !mids.is_empty() {
        sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
    }
    for (index, mid) in mids.iter().enumerate() {
        if index == 0 {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        } else {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str(&format!("a=mid:{mid}\r\n"));
    }
    sdp
}

/// Everything a [`MockTransport`] was asked to do.
#[derive(Debug, Default, Clone)]
pub struct MockLog {
    pub sent: Vec<ChannelMessage>,
    pub remote_descriptions: Vec<SessionDescriptor>,
    pub remote_candidates: Vec<IceCandidate>,
    pub rtp: Vec<Bytes>,
    pub keyframe_requests: usize,
    pub closed: bool,
}

struct Negotiation {
    local: bool,
    remote: bool,
    track: Option<(TrackRole, Codec)>,
}

struct MockInner {
    id: u64,
    linked: bool,
    max_message_size: usize,
    handler: Mutex<Option<TransportEventHandler>>,
    peer: Mutex<Weak<MockInner>>,
    negotiation: Mutex<Negotiation>,
    log: Mutex<MockLog>,
    announced: AtomicBool,
    closed: AtomicBool,
}

impl MockInner {
    fn emit(&self, event: TransportEvent) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(event),
            None => tracing::trace!(
                target = "strait::session::mock",
                mock = self.id,
                ?event,
                "event dropped; no subscriber"
            ),
        }
    }

    fn peer(&self) -> Option<Arc<MockInner>> {
        self.peer.lock().upgrade()
    }
}

/// In-memory [`PeerTransport`].
///
/// A standalone mock only records calls; tests drive it with [`MockTransport::emit`].
/// A [`MockTransport::linked_pair`] behaves like two connected peers: once both
/// descriptions are in place each side reports `Connected` and an open channel,
/// and `send` / `send_rtp` are delivered to the other side.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::build(false, MAX_FRAME_LEN)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self::build(false, max_message_size)
    }

    pub fn linked_pair() -> (Self, Self) {
        let left = Self::build(true, MAX_FRAME_LEN);
        let right = Self::build(true, MAX_FRAME_LEN);
        *left.inner.peer.lock() = Arc::downgrade(&right.inner);
        *right.inner.peer.lock() = Arc::downgrade(&left.inner);
        (left, right)
    }

    fn build(linked: bool, max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(MockInner {
                id: NEXT_MOCK_ID.fetch_add(1, Ordering::Relaxed),
                linked,
                max_message_size,
                handler: Mutex::new(None),
                peer: Mutex::new(Weak::new()),
                negotiation: Mutex::new(Negotiation {
                    local: false,
                    remote: false,
                    track: None,
                }),
                log: Mutex::new(MockLog::default()),
                announced: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Injects an event as if the peer-connection library raised it.
    pub fn emit(&self, event: TransportEvent) {
        self.inner.emit(event);
    }

    pub fn log(&self) -> MockLog {
        self.inner.log.lock().clone()
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.inner.log.lock().sent.clone()
    }

    pub fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.inner.id,
                40_000 + self.inner.id % 20_000
            ),
            mid: "0".into(),
            mline_index: Some(0),
        }
    }

    fn describe(&self, kind: SdpKind) -> Result<SessionDescriptor, ConnectionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("mock transport closed".into()));
        }
        let has_track = {
            let mut negotiation = self.inner.negotiation.lock();
            negotiation.local = true;
            negotiation.track.is_some()
        };
        let mids: &[&str] = if has_track { &["0", "1"] } else { &["0"] };
        let sdp = mock_sdp(self.inner.id, mids, true);
        if self.inner.linked {
            self.emit(TransportEvent::LocalCandidate(self.host_candidate()));
        }
        self.maybe_connect();
        Ok(match kind {
            SdpKind::Offer => SessionDescriptor::offer(sdp),
            SdpKind::Answer => SessionDescriptor::answer(sdp),
        })
    }

    fn maybe_connect(&self) {
        if !self.inner.linked {
            return;
        }
        let ready = {
            let negotiation = self.inner.negotiation.lock();
            negotiation.local && negotiation.remote
        };
        if ready && !self.inner.announced.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
            self.emit(TransportEvent::ChannelOpen);
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for MockTransport {
    fn subscribe(&self, handler: TransportEventHandler) {
        *self.inner.handler.lock() = Some(handler);
    }

    fn create_offer(&self) -> Result<SessionDescriptor, ConnectionError> {
        self.describe(SdpKind::Offer)
    }

    fn create_answer(&self) -> Result<SessionDescriptor, ConnectionError> {
        if !self.inner.negotiation.lock().remote {
            return Err(ConnectionError::Transport(
                "answer requested before a remote offer".into(),
            ));
        }
        self.describe(SdpKind::Answer)
    }

    fn apply_remote(&self, description: &SessionDescriptor) -> Result<(), ConnectionError> {
        self.inner
            .log
            .lock()
            .remote_descriptions
            .push(description.clone());
        self.inner.negotiation.lock().remote = true;
        self.maybe_connect();
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), ConnectionError> {
        self.inner
            .log
            .lock()
            .remote_candidates
            .push(candidate.clone());
        Ok(())
    }

    fn send(&self, message: ChannelMessage) -> Result<(), ConnectionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        if message.len() > self.inner.max_message_size {
            return Err(ConnectionError::Transport(format!(
                "message of {} bytes exceeds {}",
                message.len(),
                self.inner.max_message_size
            )));
        }
        self.inner.log.lock().sent.push(message.clone());
        if let Some(peer) = self.inner.peer() {
            peer.emit(TransportEvent::ChannelMessage(message));
        }
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    fn open_media_track(&self, role: TrackRole, codec: Codec) -> Result<(), ConnectionError> {
        self.inner.negotiation.lock().track = Some((role, codec));
        Ok(())
    }

    fn send_rtp(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        match self.inner.negotiation.lock().track {
            Some((TrackRole::Send, _)) => {}
            _ => return Err(ConnectionError::NoMediaTrack),
        }
        let packet = Bytes::copy_from_slice(packet);
        self.inner.log.lock().rtp.push(packet.clone());
        if let Some(peer) = self.inner.peer() {
            peer.emit(TransportEvent::RtpPacket(packet));
        }
        Ok(())
    }

    fn request_keyframe(&self) -> Result<(), ConnectionError> {
        match self.inner.negotiation.lock().track {
            Some((TrackRole::Receive, _)) => {
                self.inner.log.lock().keyframe_requests += 1;
                Ok(())
            }
            _ => Err(ConnectionError::NoMediaTrack),
        }
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.log.lock().closed = true;
        }
    }
}

/// Hands out the transports it was seeded with, then unlinked mocks.
#[derive(Default)]
pub struct MockTransportFactory {
    queued: Mutex<Vec<MockTransport>>,
    created: Mutex<Vec<MockTransport>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, transport: MockTransport) {
        self.queued.lock().push(transport);
    }

    /// Every transport handed out so far, in creation order.
    pub fn created(&self) -> Vec<MockTransport> {
        self.created.lock().clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, _config: &SessionConfig) -> Result<Arc<dyn PeerTransport>, ConnectionError> {
        let transport = {
            let mut queued = self.queued.lock();
            if queued.is_empty() {
                MockTransport::new()
            } else {
                queued.remove(0)
            }
        };
        self.created.lock().push(transport.clone());
        Ok(Arc::new(transport))
    }
}
