#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use strait::error::SignalingError;
use strait::session::WeakPeerSession;
use strait::session::mock::MockTransport;
use strait::{ConnectionState, EnvelopeSink, PeerSession, SessionConfig, SignalingEvent};

/// Keeps every envelope it is asked to send.
#[derive(Default)]
pub struct Recorder {
    sent: Mutex<Vec<Value>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub fn of_type(&self, kind: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|value| value["type"] == kind)
            .cloned()
            .collect()
    }
}

impl EnvelopeSink for Recorder {
    fn send_envelope(&self, envelope: Value) -> Result<(), SignalingError> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// Signaling path that hands envelopes straight to another session.
#[derive(Default)]
pub struct Pipe {
    target: Mutex<Option<WeakPeerSession>>,
}

impl Pipe {
    pub fn connect(&self, session: &PeerSession) {
        *self.target.lock() = Some(session.downgrade());
    }
}

impl EnvelopeSink for Pipe {
    fn send_envelope(&self, envelope: Value) -> Result<(), SignalingError> {
        let target = self.target.lock().as_ref().and_then(WeakPeerSession::upgrade);
        match target {
            Some(session) => {
                session.handle_signaling_event(SignalingEvent::Envelope(envelope));
                Ok(())
            }
            None => Err(SignalingError::Closed),
        }
    }
}

pub struct ConnectedPair {
    pub offerer: PeerSession,
    pub answerer: PeerSession,
    pub offerer_transport: MockTransport,
    pub answerer_transport: MockTransport,
}

impl ConnectedPair {
    pub fn shutdown(&self) {
        self.offerer.shutdown();
        self.answerer.shutdown();
    }
}

/// Two sessions over a linked mock pair, signaled through pipes and
/// connected.
pub fn connected_pair(config: SessionConfig) -> ConnectedPair {
    let (left, right) = MockTransport::linked_pair();
    let offerer = PeerSession::new(
        "offerer",
        SessionConfig {
            offering: true,
            ..config.clone()
        },
        Arc::new(left.clone()),
    )
    .unwrap();
    let answerer = PeerSession::new(
        "answerer",
        SessionConfig {
            offering: false,
            ..config
        },
        Arc::new(right.clone()),
    )
    .unwrap();

    let to_answerer = Arc::new(Pipe::default());
    to_answerer.connect(&answerer);
    let to_offerer = Arc::new(Pipe::default());
    to_offerer.connect(&offerer);

    answerer.attach(to_offerer).unwrap();
    assert_eq!(
        answerer.wait_for_state(ConnectionState::Signup, Duration::from_secs(5)),
        ConnectionState::Signup
    );
    offerer.attach(to_answerer).unwrap();

    for session in [&offerer, &answerer] {
        assert_eq!(
            session.wait_for_state(ConnectionState::Connected, Duration::from_secs(5)),
            ConnectionState::Connected,
            "{} did not connect",
            session.label()
        );
    }
    ConnectedPair {
        offerer,
        answerer,
        offerer_transport: left,
        answerer_transport: right,
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
