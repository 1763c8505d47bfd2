//! Bridge relay between an external and an internal signaling domain.
//!
//! Two relays, a seeker and a provider, are joined by a pair of UDP sockets.
//! Each relay runs two threads of its own:
//!
//! * the listener reads `In`, answers `ping` and `bridge` requests, hands
//!   replies to waiting callers and forwards RTP;
//! * the bridge thread is a [`TaskQueue`] that runs the role handlers and
//!   every blocking bridge call, in listener read order.
//!
//! Every relayed envelope carries the integer id of the endpoint it belongs
//! to; relay-level messages use [`RELAY_LEVEL_ID`].

pub mod link;
mod role;
mod routing;
mod rpc;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use strait_proto::{
    BridgeExtension, Codec, Envelope, EnvelopeError, RELAY_LEVEL_ID, RtpPacket, endpoint_id,
    envelope_type, stamp_endpoint_id, stamp_rtp_endpoint_id, with_bridge_extension,
};

use crate::cancel::CancelToken;
use crate::config::{BridgeConfig, SessionConfig};
use crate::error::{ConfigError, RelayError};
use crate::session::PeerSession;
use crate::session::rtc::RtcTransportFactory;
use crate::signaling::{EnvelopeSink, SignalingChannel, SignalingEvent, SignalingHandler};
use crate::task_queue::TaskQueue;

use self::link::{Datagram, MAX_DATAGRAM, classify, token_is_ordered, unix_millis};
use self::routing::{Endpoint, RoutingTable};
use self::rpc::{PendingCalls, RPC_FIELD, rpc_id};

pub use self::link::BridgeLink;
pub use self::role::RelayRole;
pub use self::routing::{EndpointFactory, StampedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    Added,
    Removed,
}

/// Depth of an [`BridgeRelay::established_connection`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Sockets open and both relay threads alive.
    Shallow,
    /// A ping answered by the other half within the bridge timeout.
    Deep,
}

pub type RelayFailureCallback = Arc<dyn Fn(&RelayError) + Send + Sync>;
pub type EndpointCallback = Arc<dyn Fn(u32, EndpointEvent) + Send + Sync>;

#[derive(Default)]
struct RelayCallbacks {
    failure: Option<RelayFailureCallback>,
    endpoint: Option<EndpointCallback>,
}

struct RelayInner {
    role: RelayRole,
    config: BridgeConfig,
    endpoints: EndpointFactory,
    link: BridgeLink,
    bridge: TaskQueue,
    routing: Mutex<RoutingTable>,
    calls: PendingCalls,
    next_id: AtomicU32,
    signaling: Mutex<Option<Arc<dyn EnvelopeSink>>>,
    callbacks: Mutex<RelayCallbacks>,
    listener: Mutex<Option<JoinHandle<()>>>,
    peer_port: Mutex<Option<u16>>,
    stop: CancelToken,
    stopped: AtomicBool,
}

/// One half of a bridge. Dropping the handle shuts the relay down.
pub struct BridgeRelay {
    inner: Arc<RelayInner>,
}

impl BridgeRelay {
    /// Validates `config`, binds both sockets and starts the relay threads.
    pub fn bind(
        config: BridgeConfig,
        role: RelayRole,
        endpoints: EndpointFactory,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let link = BridgeLink::open(&config)?;
        Self::with_link(config, role, link, endpoints)
    }

    /// [`BridgeRelay::bind`] with webrtc-rs endpoints negotiating H.264.
    pub fn bind_rtc(config: BridgeConfig, role: RelayRole) -> Result<Self, RelayError> {
        let session = SessionConfig {
            signalling: config.signalling.clone(),
            ..SessionConfig::default()
        };
        let endpoints = EndpointFactory::new(Arc::new(RtcTransportFactory))
            .with_session(session)
            .with_codec(Codec::H264);
        Self::bind(config, role, endpoints)
    }

    /// Starts a relay over an existing link. The address keys of `config`
    /// are not consulted.
    pub fn with_link(
        config: BridgeConfig,
        role: RelayRole,
        link: BridgeLink,
        endpoints: EndpointFactory,
    ) -> Result<Self, RelayError> {
        if config.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "timeout_ms",
                reason: "must be greater than zero".into(),
            }
            .into());
        }
        let bridge = TaskQueue::new("bridge")?;
        let inner = Arc::new(RelayInner {
            role,
            config,
            endpoints,
            link,
            bridge,
            routing: Mutex::new(RoutingTable::default()),
            calls: PendingCalls::new(role.rpc_parity()),
            next_id: AtomicU32::new(1),
            signaling: Mutex::new(None),
            callbacks: Mutex::new(RelayCallbacks::default()),
            listener: Mutex::new(None),
            peer_port: Mutex::new(None),
            stop: CancelToken::new(),
            stopped: AtomicBool::new(false),
        });
        let listener = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("strait-listener".into())
            .spawn(move || listen(listener))?;
        *inner.listener.lock() = Some(handle);
        tracing::debug!(
            target = "strait::relay",
            ?role,
            in_addr = ?inner.link.in_addr().ok(),
            out_addr = ?inner.link.out_addr().ok(),
            "bridge relay started"
        );
        Ok(Self { inner })
    }

    pub fn role(&self) -> RelayRole {
        self.inner.role
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn link(&self) -> &BridgeLink {
        &self.inner.link
    }

    /// `In` port the other half announced in the handshake, either direction.
    pub fn peer_port(&self) -> Option<u16> {
        *self.inner.peer_port.lock()
    }

    /// Connects to the configured signaling server and routes its envelopes
    /// through the role handlers.
    pub fn connect_signaling(&self) -> Result<(), RelayError> {
        let url = self
            .inner
            .config
            .signalling
            .clone()
            .ok_or(ConfigError::Missing("signalling"))?;
        let weak = Arc::downgrade(&self.inner);
        // Connecting on the bridge thread keeps envelopes from reaching a
        // handler before the sink is stored.
        self.inner
            .bridge
            .run_sync(move || {
                let Some(relay) = weak.upgrade() else {
                    return Err(RelayError::Closed);
                };
                let target = Arc::downgrade(&relay);
                let handler: SignalingHandler = Arc::new(move |event| {
                    if let Some(relay) = target.upgrade() {
                        relay.on_signaling_event(event);
                    }
                });
                let channel = SignalingChannel::connect(&url, handler)?;
                *relay.signaling.lock() = Some(channel as Arc<dyn EnvelopeSink>);
                Ok(())
            })
            .map_err(|_| RelayError::Closed)?
    }

    /// Uses `sink` as the signaling channel of this relay's domain.
    pub fn attach_signaling(&self, sink: Arc<dyn EnvelopeSink>) {
        *self.inner.signaling.lock() = Some(sink);
    }

    /// Queues an envelope received from this relay's signaling domain.
    pub fn handle_signaling(&self, envelope: Value) {
        self.inner.on_signaling_event(SignalingEvent::Envelope(envelope));
    }

    /// Handshake with the other half: announces our `In` port with a clock
    /// token and checks the token that comes back. Returns the peer's port.
    pub fn find_bridge(&self) -> Result<u16, RelayError> {
        let relay = &self.inner;
        let sent = unix_millis();
        let port = relay.link.in_addr()?.port();
        let request = json!({"type": "bridge", "port": port, "session": sent, "id": RELAY_LEVEL_ID});
        let reply = relay.call("find_bridge", request, relay.config.timeout_policy)?;
        let remote = reply
            .get("session")
            .and_then(Value::as_u64)
            .ok_or_else(|| RelayError::Handshake("reply carries no session token".into()))?;
        let skew = relay.config.clock_skew();
        let now = unix_millis();
        if !token_is_ordered(sent, remote, now, skew) {
            return Err(RelayError::Handshake(format!(
                "session token {remote} outside [{sent}, {now}] with {skew:?} skew"
            )));
        }
        let peer_port = reply
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| RelayError::Handshake("reply carries no port".into()))?;
        *relay.peer_port.lock() = Some(peer_port);
        tracing::debug!(target = "strait::relay", peer_port, "bridge found");
        Ok(peer_port)
    }

    pub fn established_connection(&self, liveness: Liveness) -> Result<(), RelayError> {
        self.inner.check_alive()?;
        if liveness == Liveness::Shallow {
            return Ok(());
        }
        let reply = self.inner.call(
            "ping",
            json!({"type": "ping", "id": RELAY_LEVEL_ID}),
            self.inner.config.timeout_policy,
        )?;
        match envelope_type(&reply) {
            Some("pong") => Ok(()),
            other => Err(RelayError::Remote(format!(
                "ping answered with `{}`",
                other.unwrap_or("?")
            ))),
        }
    }

    /// Sends `message` to the other half and blocks for its reply.
    ///
    /// The message is stamped with `endpoint`, or the relay-level id. An `ok`
    /// reply completes the call, a `todo` reply additionally hands its
    /// `message` to the endpoint's session and `error` fails it. When the
    /// reply does not come in time the configured [`crate::config::TimeoutPolicy`]
    /// decides; with `fail_if_unresolved` a timeout is reported as
    /// [`RelayError::Unresolved`].
    ///
    /// Must not be called from a relay callback that runs on the listener.
    pub fn bridge_synchronize(
        &self,
        endpoint: Option<u32>,
        message: Value,
        fail_if_unresolved: bool,
    ) -> Result<Value, RelayError> {
        self.inner.synchronize(endpoint, message, fail_if_unresolved)
    }

    /// Sends `message` to the other half without waiting for a reply.
    pub fn notify(&self, endpoint: Option<u32>, mut message: Value) -> Result<(), RelayError> {
        let id = endpoint.map(i64::from).unwrap_or(RELAY_LEVEL_ID);
        if !stamp_endpoint_id(&mut message, id) {
            return Err(EnvelopeError::NotAnObject.into());
        }
        self.inner.link.send_json(&message)
    }

    pub fn endpoints(&self) -> Vec<u32> {
        self.inner.routing.lock().ids()
    }

    pub fn endpoint_session(&self, id: u32) -> Option<PeerSession> {
        self.inner.routing.lock().session(id)
    }

    pub fn on_failure(&self, callback: impl Fn(&RelayError) + Send + Sync + 'static) {
        self.inner.callbacks.lock().failure = Some(Arc::new(callback));
    }

    pub fn on_endpoint(&self, callback: impl Fn(u32, EndpointEvent) + Send + Sync + 'static) {
        self.inner.callbacks.lock().endpoint = Some(Arc::new(callback));
    }

    /// Stops the listener, drains the bridge thread, closes every endpoint
    /// session and fails pending calls. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for BridgeRelay {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for BridgeRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRelay")
            .field("role", &self.inner.role)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

fn listen(relay: Arc<RelayInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !relay.stop.is_cancelled() {
        let len = match relay.link.recv(&mut buf) {
            Ok(Some(len)) => len,
            Ok(None) => continue,
            Err(err) => {
                relay.report(RelayError::Io(err));
                break;
            }
        };
        match classify(&buf[..len]) {
            Some(Datagram::Envelope(value)) => relay.on_bridge_envelope(value),
            Some(Datagram::Rtp(packet)) => relay.role.on_bridge_rtp(&relay, packet),
            None => {
                tracing::warn!(target = "strait::relay", len, "unrecognised datagram dropped");
            }
        }
    }
    tracing::debug!(target = "strait::relay", "listener stopped");
}

impl RelayInner {
    fn check_alive(&self) -> Result<(), RelayError> {
        if self.stop.is_cancelled() || !self.bridge.is_open() {
            return Err(RelayError::Closed);
        }
        let listening = self
            .listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !listening {
            return Err(RelayError::Closed);
        }
        self.link.in_addr()?;
        self.link.out_addr()?;
        Ok(())
    }

    fn call(
        &self,
        operation: &'static str,
        mut request: Value,
        policy: crate::config::TimeoutPolicy,
    ) -> Result<Value, RelayError> {
        if self.stop.is_cancelled() {
            return Err(RelayError::Closed);
        }
        let call = self.calls.register(operation);
        match request.as_object_mut() {
            Some(object) => {
                object.insert(RPC_FIELD.into(), Value::from(call.id));
            }
            None => return Err(EnvelopeError::NotAnObject.into()),
        }
        tracing::trace!(
            target = "strait::relay",
            operation,
            rpc = call.id,
            kind = envelope_type(&request).unwrap_or("?"),
            "bridge call"
        );
        self.link.send_json(&request)?;
        self.calls.wait(call, self.config.timeout(), policy, &self.stop)
    }

    fn synchronize(
        &self,
        endpoint: Option<u32>,
        mut message: Value,
        fail_if_unresolved: bool,
    ) -> Result<Value, RelayError> {
        let id = endpoint.map(i64::from).unwrap_or(RELAY_LEVEL_ID);
        if !stamp_endpoint_id(&mut message, id) {
            return Err(EnvelopeError::NotAnObject.into());
        }
        let operation = envelope_type(&message).unwrap_or("message").to_string();
        let reply = match self.call("bridge_synchronize", message, self.config.timeout_policy) {
            Ok(reply) => reply,
            Err(RelayError::Timeout(cause)) if fail_if_unresolved => {
                tracing::error!(
                    target = "strait::relay",
                    %operation,
                    endpoint = id,
                    error = %cause,
                    "bridge call unresolved"
                );
                return Err(RelayError::Unresolved {
                    operation,
                    endpoint: id,
                    cause,
                });
            }
            Err(err) => return Err(err),
        };
        match envelope_type(&reply) {
            Some("error") => Err(RelayError::Remote(
                reply
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            )),
            Some("todo") => {
                if let (Some(endpoint), Some(information)) = (endpoint, reply.get("message")) {
                    let session = self.routing.lock().session(endpoint);
                    match session {
                        Some(session) => session
                            .handle_signaling_event(SignalingEvent::Envelope(information.clone())),
                        None => tracing::warn!(target = "strait::relay", endpoint, "todo reply for unknown endpoint"),
                    }
                }
                Ok(reply)
            }
            _ => Ok(reply),
        }
    }

    fn on_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => {
                tracing::debug!(target = "strait::relay", role = ?self.role, "signaling open");
            }
            SignalingEvent::Envelope(value) => {
                let relay = Arc::clone(self);
                if self
                    .bridge
                    .submit(move || relay.role.on_signaling(&relay, value))
                    .is_err()
                {
                    tracing::trace!(target = "strait::relay", "signaling envelope after shutdown");
                }
            }
            SignalingEvent::Closed => {
                tracing::warn!(target = "strait::relay", role = ?self.role, "signaling channel closed");
                self.signaling.lock().take();
            }
            SignalingEvent::Error(message) => {
                tracing::warn!(target = "strait::relay", %message, "signaling error");
            }
        }
    }

    /// Runs on the listener; must not block.
    fn on_bridge_envelope(self: &Arc<Self>, value: Value) {
        if let Some(rpc) = rpc_id(&value) {
            if self.calls.is_own(rpc) {
                if !self.calls.resolve(rpc, value) {
                    tracing::debug!(target = "strait::relay", rpc, "late bridge reply dropped");
                }
                return;
            }
        }
        match envelope_type(&value) {
            Some("ping") => self.reply(&value, json!({"type": "pong"})),
            Some("bridge") => self.answer_handshake(&value),
            Some(_) => {
                let relay = Arc::clone(self);
                if self
                    .bridge
                    .submit(move || relay.role.on_bridge_envelope(&relay, value))
                    .is_err()
                {
                    tracing::trace!(target = "strait::relay", "bridge envelope after shutdown");
                }
            }
            None => tracing::warn!(target = "strait::relay", "bridge envelope without type dropped"),
        }
    }

    fn answer_handshake(&self, request: &Value) {
        let port = request
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok());
        if let Some(port) = port {
            *self.peer_port.lock() = Some(port);
        }
        let own_port = match self.link.in_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                tracing::warn!(target = "strait::relay", error = %err, "handshake without a local port");
                return;
            }
        };
        tracing::debug!(target = "strait::relay", peer_port = ?port, "answering bridge handshake");
        self.reply(
            request,
            json!({"type": "bridge", "port": own_port, "session": unix_millis()}),
        );
    }

    /// Answers `request`, echoing its correlation and endpoint ids.
    fn reply(&self, request: &Value, mut reply: Value) {
        if let (Some(rpc), Some(object)) = (rpc_id(request), reply.as_object_mut()) {
            object.insert(RPC_FIELD.into(), Value::from(rpc));
        }
        if let Some(id) = endpoint_id(request) {
            stamp_endpoint_id(&mut reply, id);
        }
        if let Err(err) = self.link.send_json(&reply) {
            tracing::warn!(target = "strait::relay", error = %err, "failed to send bridge reply");
        }
    }

    fn reply_error(&self, request: &Value, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target = "strait::relay", %message, "rejecting bridge request");
        self.reply(request, Envelope::error(message).to_value());
    }

    /// Hooks an endpoint session up to the bridge. Callbacks hold the relay
    /// weakly; the routing table owns the session.
    fn wire_endpoint(self: &Arc<Self>, id: u32, session: &PeerSession) {
        let relay = Arc::downgrade(self);
        session.on_message(move |text| {
            if let Some(relay) = relay.upgrade() {
                relay.relay_control(id, text);
            }
        });
        let relay = Arc::downgrade(self);
        session.on_failed(move |error| {
            tracing::warn!(target = "strait::relay", endpoint = id, error = %error, "endpoint session failed");
            if let Some(relay) = relay.upgrade() {
                let target = Arc::clone(&relay);
                let _ = relay.bridge.submit(move || target.destroy_endpoint(id, true));
            }
        });
        if self.role == RelayRole::Provider {
            let relay = Arc::downgrade(self);
            session.on_rtp(move |packet| {
                if let Some(relay) = relay.upgrade() {
                    relay.forward_rtp(id, packet);
                }
            });
        }
    }

    fn register_endpoint(&self, endpoint: Endpoint) -> Result<(), RelayError> {
        let id = endpoint.id;
        self.routing.lock().insert(endpoint)?;
        tracing::debug!(target = "strait::relay", endpoint = id, role = ?self.role, "endpoint added");
        self.notify_endpoint(id, EndpointEvent::Added);
        Ok(())
    }

    fn destroy_endpoint(&self, id: u32, notify_remote: bool) {
        let Some(endpoint) = self.routing.lock().remove(id) else {
            return;
        };
        endpoint.session.shutdown();
        if notify_remote {
            let notice = json!({"type": "playerDisconnected", "id": id});
            if let Err(err) = self.link.send_json(&notice) {
                tracing::warn!(target = "strait::relay", endpoint = id, error = %err, "failed to notify bridge");
            }
        }
        tracing::debug!(target = "strait::relay", endpoint = id, role = ?self.role, "endpoint removed");
        self.notify_endpoint(id, EndpointEvent::Removed);
    }

    fn endpoint_for(&self, value: &Value) -> Option<(u32, PeerSession)> {
        let id = endpoint_id(value).and_then(|id| u32::try_from(id).ok())?;
        let session = self.routing.lock().session(id)?;
        Some((id, session))
    }

    fn relay_control(&self, id: u32, message: String) {
        let control = json!({"type": "control", "message": message, "id": id});
        if let Err(err) = self.link.send_json(&control) {
            tracing::warn!(target = "strait::relay", endpoint = id, error = %err, "failed to relay control message");
        }
    }

    fn deliver_control(&self, value: &Value) {
        let Some((id, session)) = self.endpoint_for(value) else {
            tracing::warn!(target = "strait::relay", id = ?endpoint_id(value), "control for unknown endpoint dropped");
            return;
        };
        let Some(message) = value.get("message").and_then(Value::as_str) else {
            tracing::warn!(target = "strait::relay", endpoint = id, "control without message dropped");
            return;
        };
        if let Err(err) = session.send_text(message) {
            tracing::warn!(target = "strait::relay", endpoint = id, error = %err, "control not delivered");
        }
    }

    /// Sends a track packet across the bridge with `id` in its bridge
    /// extension. Packets without one get it spliced in; the id must land
    /// at the agreed offset or the packet is dropped.
    fn forward_rtp(&self, id: u32, packet: Bytes) {
        let Ok(stamp) = u16::try_from(id) else {
            tracing::warn!(target = "strait::relay", endpoint = id, "endpoint id does not fit the rtp extension");
            return;
        };
        let parsed = match RtpPacket::parse(&packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::trace!(target = "strait::relay", endpoint = id, error = %err, "malformed rtp not forwarded");
                return;
            }
        };
        let offset = self.config.rtp_header_offset;
        let mut datagram = if parsed.bridge_extension().is_some() {
            packet.to_vec()
        } else {
            let extension = BridgeExtension {
                endpoint_id: stamp,
                ..BridgeExtension::default()
            };
            match with_bridge_extension(&packet, &extension) {
                Ok(datagram) => datagram,
                Err(err) => {
                    tracing::trace!(target = "strait::relay", endpoint = id, error = %err, "rtp extension not added");
                    return;
                }
            }
        };
        let placed = RtpPacket::parse(&datagram)
            .ok()
            .and_then(|spliced| spliced.bridge_endpoint_offset());
        if placed != Some(offset) {
            tracing::warn!(target = "strait::relay", endpoint = id, expected = offset, found = ?placed, "bridge extension not at the agreed offset");
            return;
        }
        if !stamp_rtp_endpoint_id(&mut datagram, offset, stamp) {
            tracing::trace!(target = "strait::relay", endpoint = id, len = datagram.len(), "rtp packet too short to stamp");
            return;
        }
        if let Err(err) = self.link.send_raw(&datagram) {
            tracing::warn!(target = "strait::relay", endpoint = id, error = %err, "failed to forward rtp");
        }
    }

    fn notify_endpoint(&self, id: u32, event: EndpointEvent) {
        let callback = self.callbacks.lock().endpoint.clone();
        if let Some(callback) = callback {
            callback(id, event);
        }
    }

    fn report(&self, error: RelayError) {
        tracing::error!(target = "strait::relay", role = ?self.role, error = %error, "relay failure");
        let callback = self.callbacks.lock().failure.clone();
        if let Some(callback) = callback {
            callback(&error);
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        self.calls.clear();
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(target = "strait::relay", "listener thread terminated abnormally");
            }
        }
        self.bridge.shutdown();
        let endpoints = self.routing.lock().drain();
        for endpoint in endpoints {
            endpoint.session.shutdown();
            self.notify_endpoint(endpoint.id, EndpointEvent::Removed);
        }
        if let Some(sink) = self.signaling.lock().take() {
            sink.close();
        }
        tracing::debug!(target = "strait::relay", role = ?self.role, "bridge relay stopped");
    }
}
