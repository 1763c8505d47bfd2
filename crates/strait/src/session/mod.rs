//! Peer sessions: one peer connection, one data channel and at most one media
//! track, driven through [`ConnectionState`].
//!
//! Every state mutation happens on the session's own [`TaskQueue`] worker.
//! Signaling events and transport events are forwarded there; the public
//! operations submit a task and wait for it. Sending on an established data
//! channel or media track skips the queue and talks to the transport directly.

pub mod mock;
pub mod rtc;
mod sdp;
mod state;
pub mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use strait_proto::{ChannelMessage, Codec, Envelope, EnvelopeError, encode_frame, encode_text};

use crate::cancel::CancelToken;
use crate::config::SessionConfig;
use crate::error::{ConnectionError, SignalingError};
use crate::signaling::{EnvelopeSink, SignalingChannel, SignalingEvent, SignalingHandler};
use crate::task_queue::TaskQueue;

use self::sdp::MediaSections;
pub use self::state::ConnectionState;
pub use self::transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescriptor, TrackRole, TransportEvent,
    TransportFactory, TransportState,
};

pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// What a [`MessageLayer`] did with an incoming data-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    Consumed,
    Forward,
}

/// Sees incoming data-channel messages before the session callbacks.
///
/// Layers run on the session worker in installation order; the first one to
/// return [`Intercept::Consumed`] ends dispatch. They may send on `session`
/// but must not wait on anything the worker itself would have to deliver.
pub trait MessageLayer: Send + Sync {
    fn intercept(&self, message: &ChannelMessage, session: &PeerSession) -> Intercept;
}

/// Removes its layer from the session when dropped.
#[must_use = "the layer is removed as soon as the guard is dropped"]
pub struct LayerGuard {
    session: Weak<SessionInner>,
    id: u64,
}

impl Drop for LayerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            inner.layers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Default)]
struct Callbacks {
    state: Option<StateCallback>,
    failed: Option<FailureCallback>,
    message: Option<MessageCallback>,
    data: Option<DataCallback>,
    rtp: Option<DataCallback>,
}

struct SessionState {
    connection: ConnectionState,
    offering: bool,
    local: Option<SessionDescriptor>,
    remote: Option<MediaSections>,
    pending_mids: HashSet<String>,
    transport_connected: bool,
    channel_open: bool,
    held_local_candidates: Vec<IceCandidate>,
    early_remote_candidates: Vec<IceCandidate>,
    media: Option<(TrackRole, Codec)>,
    endpoint_id: Option<i64>,
    peer_options: Option<Value>,
    failure_reported: bool,
    shutting_down: bool,
}

struct SessionInner {
    label: String,
    config: SessionConfig,
    transport: Arc<dyn PeerTransport>,
    queue: TaskQueue,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    sink: Mutex<Option<Arc<dyn EnvelopeSink>>>,
    callbacks: Mutex<Callbacks>,
    layers: Mutex<Vec<(u64, Arc<dyn MessageLayer>)>>,
    next_layer: AtomicU64,
    cancel: CancelToken,
}

/// Handle to a peer session. Clones share the same session.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

/// Non-owning handle for callbacks that the session itself keeps alive.
#[derive(Clone)]
pub struct WeakPeerSession {
    inner: Weak<SessionInner>,
}

impl WeakPeerSession {
    pub fn upgrade(&self) -> Option<PeerSession> {
        self.inner.upgrade().map(|inner| PeerSession { inner })
    }
}

impl PeerSession {
    pub fn new(
        label: impl Into<String>,
        config: SessionConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, ConnectionError> {
        let label = label.into();
        let queue = TaskQueue::new("session")
            .map_err(|err| ConnectionError::Transport(format!("failed to start worker: {err}")))?;
        let offering = config.offering;
        let inner = Arc::new(SessionInner {
            label,
            config,
            transport,
            queue,
            state: Mutex::new(SessionState {
                connection: ConnectionState::Startup,
                offering,
                local: None,
                remote: None,
                pending_mids: HashSet::new(),
                transport_connected: false,
                channel_open: false,
                held_local_candidates: Vec::new(),
                early_remote_candidates: Vec::new(),
                media: None,
                endpoint_id: None,
                peer_options: None,
                failure_reported: false,
                shutting_down: false,
            }),
            state_changed: Condvar::new(),
            sink: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            layers: Mutex::new(Vec::new()),
            next_layer: AtomicU64::new(1),
            cancel: CancelToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.subscribe(Arc::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let target = Arc::clone(&inner);
            if inner.queue.submit(move || target.on_transport_event(event)).is_err() {
                tracing::trace!(target = "strait::session", session = %inner.label, "transport event after shutdown");
            }
        }));
        tracing::debug!(target = "strait::session", session = %inner.label, offering, "session created");
        Ok(Self { inner })
    }

    pub fn with_factory(
        label: impl Into<String>,
        config: SessionConfig,
        factory: &dyn TransportFactory,
    ) -> Result<Self, ConnectionError> {
        let transport = factory.create(&config)?;
        Self::new(label, config, transport)
    }

    /// Validates `config`, builds a webrtc-rs transport and connects to the
    /// configured signaling server.
    pub fn connect(label: impl Into<String>, config: SessionConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let url = config.signalling.clone().unwrap_or_default();
        let session = Self::with_factory(label, config, &rtc::RtcTransportFactory)?;
        session.start_signaling(&url)?;
        Ok(session)
    }

    /// Opens a [`SignalingChannel`] to `url` and uses it as the envelope sink.
    ///
    /// The connect runs on the session worker, so the channel's `Open` event
    /// is handled only after the sink is in place.
    pub fn start_signaling(&self, url: &str) -> Result<(), SignalingError> {
        let weak = Arc::downgrade(&self.inner);
        let url = url.to_string();
        self.inner
            .queue
            .run_sync(move || {
                let Some(inner) = weak.upgrade() else {
                    return Err(SignalingError::Closed);
                };
                let handler_target = Arc::downgrade(&inner);
                let handler: SignalingHandler = Arc::new(move |event| {
                    if let Some(inner) = handler_target.upgrade() {
                        let target = Arc::clone(&inner);
                        let _ = inner.queue.submit(move || target.on_signaling_event(event));
                    }
                });
                let channel = SignalingChannel::connect(&url, handler)?;
                *inner.sink.lock() = Some(channel as Arc<dyn EnvelopeSink>);
                Ok(())
            })
            .map_err(|_| SignalingError::Closed)?
    }

    /// Uses `sink` for outgoing envelopes and treats the signaling path as open.
    pub fn attach(&self, sink: Arc<dyn EnvelopeSink>) -> Result<(), ConnectionError> {
        *self.inner.sink.lock() = Some(sink);
        self.handle_signaling_event(SignalingEvent::Open);
        Ok(())
    }

    /// Queues a signaling event for the worker.
    pub fn handle_signaling_event(&self, event: SignalingEvent) {
        let target = Arc::clone(&self.inner);
        if self
            .inner
            .queue
            .submit(move || target.on_signaling_event(event))
            .is_err()
        {
            tracing::trace!(target = "strait::session", session = %self.inner.label, "signaling event after shutdown");
        }
    }

    /// Dispatches one envelope by its `type` and waits for the outcome.
    pub fn handle_envelope(&self, envelope: Value) -> Result<(), ConnectionError> {
        self.run(move |inner| inner.dispatch_envelope(envelope))
    }

    pub fn create_offer(&self) -> Result<(), ConnectionError> {
        self.run(|inner| inner.create_offer())
    }

    pub fn apply_remote(&self, description: SessionDescriptor) -> Result<(), ConnectionError> {
        self.run(move |inner| inner.apply_remote(description))
    }

    pub fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.run(move |inner| inner.add_remote_candidate(candidate))
    }

    /// Must precede the offer or answer so the track is negotiated.
    pub fn open_media_track(&self, role: TrackRole, codec: Codec) -> Result<(), ConnectionError> {
        self.run(move |inner| {
            let state = inner.state.lock().connection;
            if state.is_terminal() {
                return Err(ConnectionError::InvalidState {
                    operation: "open_media_track",
                    state,
                });
            }
            inner.transport.open_media_track(role, codec)?;
            inner.state.lock().media = Some((role, codec));
            Ok(())
        })
    }

    /// Sends `payload` as one tagged binary frame.
    pub fn send_on_data_channel(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.inner.ensure_connected()?;
        let frame = encode_frame(self.inner.config.channel_tag, payload)?;
        self.inner.send_frame(frame)
    }

    pub fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.inner.ensure_connected()?;
        let frame = encode_text(self.inner.config.channel_tag, text)?;
        self.inner.send_frame(frame)
    }

    pub fn send_json(&self, value: &Value) -> Result<(), ConnectionError> {
        self.send_text(&value.to_string())
    }

    pub fn send_rtp(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        self.inner.ensure_connected()?;
        self.inner.transport.send_rtp(packet)
    }

    /// Asks the remote sender for a key frame.
    pub fn request_keyframe(&self) -> Result<(), ConnectionError> {
        self.inner.ensure_connected()?;
        self.inner.transport.request_keyframe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Blocks until the session reaches `target` or a terminal state, or the
    /// timeout passes. Returns the state it saw last.
    pub fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> ConnectionState {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.connection != target && !state.connection.is_terminal() {
            if self
                .inner
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.connection
    }

    pub fn on_state_change(&self, callback: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.inner.callbacks.lock().state = Some(Arc::new(callback));
    }

    /// Called at most once, when the session enters `Error`.
    pub fn on_failed(&self, callback: impl Fn(&ConnectionError) + Send + Sync + 'static) {
        self.inner.callbacks.lock().failed = Some(Arc::new(callback));
    }

    /// Text and JSON data-channel messages, and `control` envelopes.
    pub fn on_message(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.inner.callbacks.lock().message = Some(Arc::new(callback));
    }

    pub fn on_data(&self, callback: impl Fn(Bytes) + Send + Sync + 'static) {
        self.inner.callbacks.lock().data = Some(Arc::new(callback));
    }

    pub fn downgrade(&self) -> WeakPeerSession {
        WeakPeerSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_rtp(&self, callback: impl Fn(Bytes) + Send + Sync + 'static) {
        self.inner.callbacks.lock().rtp = Some(Arc::new(callback));
    }

    pub fn install_layer(&self, layer: Arc<dyn MessageLayer>) -> LayerGuard {
        let id = self.inner.next_layer.fetch_add(1, Ordering::Relaxed);
        self.inner.layers.lock().push((id, layer));
        LayerGuard {
            session: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn channel_tag(&self) -> u8 {
        self.inner.config.channel_tag
    }

    /// Message budget on the data channel, framing included.
    pub fn max_message_size(&self) -> usize {
        self.inner
            .config
            .effective_message_size()
            .min(self.inner.transport.max_message_size())
    }

    pub fn endpoint_id(&self) -> Option<i64> {
        self.inner.state.lock().endpoint_id
    }

    pub fn peer_options(&self) -> Option<Value> {
        self.inner.state.lock().peer_options.clone()
    }

    pub fn is_offering(&self) -> bool {
        self.inner.state.lock().offering
    }

    pub fn local_description(&self) -> Option<SessionDescriptor> {
        self.inner.state.lock().local.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub fn is_worker_thread(&self) -> bool {
        self.inner.queue.is_worker_thread()
    }

    /// Moves to `Closed`, closes the transport and the signaling sink, and
    /// stops the worker. Idempotent.
    pub fn shutdown(&self) {
        let target = Arc::clone(&self.inner);
        if self.inner.queue.run_sync(move || target.close_locally()).is_err() {
            tracing::trace!(target = "strait::session", session = %self.inner.label, "shutdown after worker stopped");
        }
        self.inner.queue.shutdown();
    }

    fn run<T, F>(&self, task: F) -> Result<T, ConnectionError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<SessionInner>) -> Result<T, ConnectionError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run_sync(move || task(&inner))
            .map_err(|_| ConnectionError::WorkerGone)?
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    fn handle(self: &Arc<Self>) -> PeerSession {
        PeerSession {
            inner: Arc::clone(self),
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.state.lock().connection {
            ConnectionState::Connected => Ok(()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), ConnectionError> {
        tracing::trace!(target = "strait::session", session = %self.label, len = frame.len(), "data channel out");
        self.transport.send(ChannelMessage::Binary(frame))
    }

    fn send_signal(&self, envelope: &Envelope) {
        let sink = self.sink.lock().clone();
        let Some(sink) = sink else {
            tracing::warn!(
                target = "strait::session",
                session = %self.label,
                kind = envelope.kind(),
                "no signaling sink; dropping envelope"
            );
            return;
        };
        if let Err(err) = sink.send_envelope(envelope.to_value()) {
            tracing::warn!(
                target = "strait::session",
                session = %self.label,
                kind = envelope.kind(),
                error = %err,
                "failed to send envelope"
            );
        }
    }

    fn advance(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.connection;
            if !previous.can_advance_to(next) {
                return false;
            }
            state.connection = next;
            previous
        };
        self.state_changed.notify_all();
        tracing::debug!(target = "strait::session", session = %self.label, from = ?previous, to = ?next, "state transition");
        let callback = self.callbacks.lock().state.clone();
        if let Some(callback) = callback {
            callback(next);
        }
        true
    }

    fn fail(&self, error: ConnectionError) {
        let first = {
            let mut state = self.state.lock();
            if state.failure_reported || state.connection.is_terminal() {
                false
            } else {
                state.failure_reported = true;
                true
            }
        };
        if !first {
            tracing::debug!(target = "strait::session", session = %self.label, error = %error, "failure after terminal state ignored");
            return;
        }
        tracing::error!(target = "strait::session", session = %self.label, error = %error, "session failed");
        self.advance(ConnectionState::Error);
        let callback = self.callbacks.lock().failed.clone();
        if let Some(callback) = callback {
            callback(&error);
        }
        self.transport.close();
        self.cancel.cancel();
    }

    fn close_locally(&self) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.advance(ConnectionState::Closed);
        self.transport.close();
        if let Some(sink) = self.sink.lock().take() {
            sink.close();
        }
        self.layers.lock().clear();
        self.cancel.cancel();
    }

    fn on_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => self.on_signaling_open(),
            SignalingEvent::Envelope(value) => {
                if let Err(err) = self.dispatch_envelope(value) {
                    tracing::warn!(target = "strait::session", session = %self.label, error = %err, "envelope handling failed");
                }
            }
            SignalingEvent::Closed => {
                tracing::warn!(target = "strait::session", session = %self.label, "signaling channel closed");
                self.sink.lock().take();
            }
            SignalingEvent::Error(message) => {
                tracing::warn!(target = "strait::session", session = %self.label, %message, "signaling error");
            }
        }
    }

    fn on_signaling_open(&self) {
        if !self.advance(ConnectionState::Signup) {
            return;
        }
        let (offering, prepared) = {
            let state = self.state.lock();
            (state.offering, state.local.clone())
        };
        match prepared {
            Some(offer) => {
                self.send_signal(&offer.to_envelope());
                self.enter_offered();
            }
            None if offering => {
                if let Err(err) = self.create_offer() {
                    tracing::warn!(target = "strait::session", session = %self.label, error = %err, "offer on open failed");
                }
            }
            None => {}
        }
    }

    fn create_offer(&self) -> Result<(), ConnectionError> {
        let state = self.state.lock().connection;
        if !matches!(state, ConnectionState::Startup | ConnectionState::Signup) {
            return Err(ConnectionError::InvalidState {
                operation: "create_offer",
                state,
            });
        }
        let offer = match self.transport.create_offer() {
            Ok(offer) => offer,
            Err(err) => {
                let reported = ConnectionError::Transport(err.to_string());
                self.fail(err);
                return Err(reported);
            }
        };
        {
            let mut guard = self.state.lock();
            guard.offering = true;
            guard.local = Some(offer.clone());
        }
        if state == ConnectionState::Signup {
            self.send_signal(&offer.to_envelope());
            self.enter_offered();
        }
        Ok(())
    }

    fn enter_offered(&self) {
        if !self.advance(ConnectionState::Offered) {
            return;
        }
        let held = std::mem::take(&mut self.state.lock().held_local_candidates);
        for candidate in held {
            self.send_signal(&candidate.to_envelope());
        }
        self.try_connect();
    }

    fn apply_remote(&self, description: SessionDescriptor) -> Result<(), ConnectionError> {
        let sections = MediaSections::parse(description.sdp())?;
        let (state, offering, has_remote) = {
            let guard = self.state.lock();
            (guard.connection, guard.offering, guard.remote.is_some())
        };
        let allowed = match description.kind() {
            SdpKind::Offer => state == ConnectionState::Signup && !offering,
            SdpKind::Answer => state == ConnectionState::Offered && offering && !has_remote,
        };
        if !allowed {
            return Err(ConnectionError::InvalidState {
                operation: match description.kind() {
                    SdpKind::Offer => "apply_remote(offer)",
                    SdpKind::Answer => "apply_remote(answer)",
                },
                state,
            });
        }

        if let Err(err) = self.transport.apply_remote(&description) {
            if matches!(err, ConnectionError::MalformedSdp(_)) {
                return Err(err);
            }
            let reported = ConnectionError::Transport(err.to_string());
            self.fail(err);
            return Err(reported);
        }
        let early = {
            let mut guard = self.state.lock();
            guard.pending_mids = sections.mids().iter().cloned().collect();
            guard.remote = Some(sections);
            std::mem::take(&mut guard.early_remote_candidates)
        };
        tracing::debug!(
            target = "strait::session",
            session = %self.label,
            kind = ?description.kind(),
            buffered = early.len(),
            "remote description applied"
        );
        for candidate in early {
            if let Err(err) = self.apply_candidate(&candidate) {
                tracing::warn!(target = "strait::session", session = %self.label, error = %err, "buffered candidate rejected");
            }
        }

        if description.kind() == SdpKind::Offer {
            let answer = match self.transport.create_answer() {
                Ok(answer) => answer,
                Err(err) => {
                    let reported = ConnectionError::Transport(err.to_string());
                    self.fail(err);
                    return Err(reported);
                }
            };
            self.state.lock().local = Some(answer.clone());
            self.send_signal(&answer.to_envelope());
            self.enter_offered();
        } else {
            self.try_connect();
        }
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let state = self.state.lock().connection;
        if state.is_terminal() {
            return Err(ConnectionError::InvalidState {
                operation: "add_remote_candidate",
                state,
            });
        }
        if candidate.candidate.trim().is_empty() {
            tracing::debug!(target = "strait::session", session = %self.label, "end-of-candidates marker");
            return Ok(());
        }
        {
            let mut guard = self.state.lock();
            if guard.remote.is_none() {
                guard.early_remote_candidates.push(candidate);
                return Ok(());
            }
        }
        self.apply_candidate(&candidate)?;
        self.try_connect();
        Ok(())
    }

    fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), ConnectionError> {
        let group = {
            let guard = self.state.lock();
            let Some(sections) = guard.remote.as_ref() else {
                return Ok(());
            };
            match sections.resolve(candidate) {
                Some(mid) => sections.transport_group(mid),
                None => {
                    tracing::warn!(
                        target = "strait::session",
                        session = %self.label,
                        mid = %candidate.mid,
                        mline_index = ?candidate.mline_index,
                        "candidate for unknown mid ignored"
                    );
                    return Ok(());
                }
            }
        };
        self.transport.add_remote_candidate(candidate)?;
        let mut guard = self.state.lock();
        for mid in group {
            guard.pending_mids.remove(&mid);
        }
        tracing::trace!(
            target = "strait::session",
            session = %self.label,
            remaining = guard.pending_mids.len(),
            "remote candidate applied"
        );
        Ok(())
    }

    fn try_connect(&self) {
        let ready = {
            let guard = self.state.lock();
            guard.connection == ConnectionState::Offered
                && guard.remote.is_some()
                && guard.pending_mids.is_empty()
                && guard.transport_connected
                && guard.channel_open
        };
        if ready {
            self.advance(ConnectionState::Connected);
        }
    }

    fn dispatch_envelope(self: &Arc<Self>, value: Value) -> Result<(), ConnectionError> {
        let envelope = match Envelope::from_value(&value) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnknownType(kind)) => {
                tracing::warn!(target = "strait::session", session = %self.label, %kind, "unknown envelope type");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(target = "strait::session", session = %self.label, error = %err, "dropping malformed envelope");
                return Ok(());
            }
        };
        tracing::trace!(target = "strait::session", session = %self.label, kind = envelope.kind(), "envelope in");
        match envelope {
            Envelope::Offer { sdp } => self.apply_remote(SessionDescriptor::offer(sdp)),
            Envelope::Answer { sdp } => self.apply_remote(SessionDescriptor::answer(sdp)),
            Envelope::IceCandidate { candidate } => self.add_remote_candidate(candidate.into()),
            Envelope::Id { id } => {
                self.state.lock().endpoint_id = Some(id);
                Ok(())
            }
            Envelope::Role { role } => {
                if role != "server" {
                    tracing::debug!(target = "strait::session", session = %self.label, %role, "role ignored");
                    return Ok(());
                }
                let state = {
                    let mut guard = self.state.lock();
                    guard.offering = true;
                    guard.connection
                };
                match state {
                    ConnectionState::Signup => self.create_offer(),
                    _ => Ok(()),
                }
            }
            Envelope::Config {
                peer_connection_options,
            } => {
                self.state.lock().peer_options = Some(peer_connection_options);
                Ok(())
            }
            Envelope::Control { message } => {
                let callback = self.callbacks.lock().message.clone();
                match callback {
                    Some(callback) => callback(message),
                    None => tracing::debug!(target = "strait::session", session = %self.label, "control message without callback"),
                }
                Ok(())
            }
            Envelope::PlayerConnected {} => {
                let offer = {
                    let guard = self.state.lock();
                    guard
                        .local
                        .clone()
                        .filter(|local| guard.offering && local.kind() == SdpKind::Offer)
                };
                if let Some(offer) = offer {
                    self.send_signal(&offer.to_envelope());
                }
                Ok(())
            }
            Envelope::PlayerDisconnected {} | Envelope::ServerDisconnected {} => {
                tracing::debug!(target = "strait::session", session = %self.label, "remote party left");
                self.close_locally();
                self.queue.shutdown();
                Ok(())
            }
            Envelope::PlayerCount { count } => {
                tracing::debug!(target = "strait::session", session = %self.label, count, "player count");
                Ok(())
            }
            Envelope::Error { message } => {
                tracing::warn!(target = "strait::session", session = %self.label, %message, "signaling server reported an error");
                Ok(())
            }
            other => {
                tracing::debug!(target = "strait::session", session = %self.label, kind = other.kind(), "envelope not handled by sessions");
                Ok(())
            }
        }
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        if self.state.lock().connection.is_terminal() {
            tracing::trace!(target = "strait::session", session = %self.label, ?event, "event after terminal state");
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let send_now = {
                    let mut guard = self.state.lock();
                    match guard.connection {
                        ConnectionState::Offered | ConnectionState::Connected => true,
                        _ => {
                            guard.held_local_candidates.push(candidate.clone());
                            false
                        }
                    }
                };
                if send_now {
                    self.send_signal(&candidate.to_envelope());
                }
            }
            TransportEvent::StateChanged(state) => match state {
                TransportState::Connected => {
                    self.state.lock().transport_connected = true;
                    self.try_connect();
                }
                TransportState::Failed => self.fail(ConnectionError::Failed),
                TransportState::Closed => {
                    if !self.state.lock().shutting_down {
                        self.fail(ConnectionError::Transport("peer connection closed".into()));
                    }
                }
                TransportState::Disconnected => {
                    tracing::warn!(target = "strait::session", session = %self.label, "transport disconnected");
                }
                TransportState::New | TransportState::Connecting => {}
            },
            TransportEvent::ChannelOpen => {
                self.state.lock().channel_open = true;
                self.try_connect();
            }
            TransportEvent::ChannelClosed => {
                let shutting_down = {
                    let mut guard = self.state.lock();
                    guard.channel_open = false;
                    guard.shutting_down
                };
                if !shutting_down {
                    self.fail(ConnectionError::Transport("data channel closed".into()));
                }
            }
            TransportEvent::ChannelMessage(message) => self.dispatch_channel_message(message),
            TransportEvent::RtpPacket(packet) => {
                let callback = self.callbacks.lock().rtp.clone();
                if let Some(callback) = callback {
                    callback(packet);
                }
            }
        }
    }

    fn dispatch_channel_message(self: &Arc<Self>, message: ChannelMessage) {
        let layers: Vec<Arc<dyn MessageLayer>> = self
            .layers
            .lock()
            .iter()
            .map(|(_, layer)| Arc::clone(layer))
            .collect();
        if !layers.is_empty() {
            let session = self.handle();
            for layer in layers {
                if layer.intercept(&message, &session) == Intercept::Consumed {
                    return;
                }
            }
        }

        let tag = self.config.channel_tag;
        if let Some(text) = message.json_text(tag) {
            let callback = self.callbacks.lock().message.clone();
            if let Some(callback) = callback {
                callback(text.into_owned());
            }
            return;
        }
        match message {
            ChannelMessage::Text(text) => {
                let callback = self.callbacks.lock().message.clone();
                if let Some(callback) = callback {
                    callback(text);
                }
            }
            binary @ ChannelMessage::Binary(_) => {
                let callback = self.callbacks.lock().data.clone();
                if let Some(callback) = callback {
                    callback(binary.payload(tag));
                }
            }
        }
    }
}
