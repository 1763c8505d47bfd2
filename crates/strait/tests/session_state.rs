mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use strait::session::mock::MockTransport;
use strait::session::{Intercept, MessageLayer, TransportEvent, TransportState};
use strait::{ConnectionError, ConnectionState, PeerSession, SessionConfig};
use strait_proto::ChannelMessage;

use common::{Recorder, connected_pair, wait_until};

#[test_watchdog::watchdog(secs = 20)]
fn pair_passes_through_signup_and_offered() {
    let (left, right) = MockTransport::linked_pair();
    let offerer = PeerSession::new(
        "offerer",
        SessionConfig {
            offering: true,
            ..SessionConfig::default()
        },
        Arc::new(left),
    )
    .unwrap();
    let answerer = PeerSession::new("answerer", SessionConfig::default(), Arc::new(right)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    offerer.on_state_change(move |state| record.lock().push(state));

    let to_answerer = Arc::new(common::Pipe::default());
    to_answerer.connect(&answerer);
    let to_offerer = Arc::new(common::Pipe::default());
    to_offerer.connect(&offerer);
    answerer.attach(to_offerer).unwrap();
    answerer.wait_for_state(ConnectionState::Signup, Duration::from_secs(5));
    offerer.attach(to_answerer).unwrap();

    assert_eq!(
        offerer.wait_for_state(ConnectionState::Connected, Duration::from_secs(5)),
        ConnectionState::Connected
    );
    assert_eq!(
        answerer.wait_for_state(ConnectionState::Connected, Duration::from_secs(5)),
        ConnectionState::Connected
    );
    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() >= 3));
    assert_eq!(
        seen.lock()[..3],
        [
            ConnectionState::Signup,
            ConnectionState::Offered,
            ConnectionState::Connected
        ]
    );
    offerer.shutdown();
    answerer.shutdown();
}

#[test_watchdog::watchdog(secs = 20)]
fn connected_pair_exchanges_text_and_binary() {
    let pair = connected_pair(SessionConfig::default());
    let texts = Arc::new(Mutex::new(Vec::new()));
    let data = Arc::new(Mutex::new(Vec::new()));
    let text_sink = Arc::clone(&texts);
    let data_sink = Arc::clone(&data);
    pair.answerer.on_message(move |text| text_sink.lock().push(text));
    pair.answerer.on_data(move |bytes| data_sink.lock().push(bytes));

    pair.offerer.send_json(&json!({"type": "input", "key": 4})).unwrap();
    pair.offerer.send_on_data_channel(&[1, 2, 3]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        !texts.lock().is_empty() && !data.lock().is_empty()
    }));
    let text: serde_json::Value = serde_json::from_str(&texts.lock()[0]).unwrap();
    assert_eq!(text["key"], 4);
    assert_eq!(data.lock()[0].as_ref(), &[1, 2, 3]);
    pair.shutdown();
}

struct Swallow {
    seen: Mutex<usize>,
}

impl MessageLayer for Swallow {
    fn intercept(&self, _message: &ChannelMessage, _session: &PeerSession) -> Intercept {
        *self.seen.lock() += 1;
        Intercept::Consumed
    }
}

#[test_watchdog::watchdog(secs = 20)]
fn layers_see_messages_first_until_dropped() {
    let pair = connected_pair(SessionConfig::default());
    let texts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&texts);
    pair.answerer.on_message(move |text| sink.lock().push(text));

    let layer = Arc::new(Swallow { seen: Mutex::new(0) });
    let guard = pair.answerer.install_layer(layer.clone());
    pair.offerer.send_text("{\"n\":1}").unwrap();
    assert!(wait_until(Duration::from_secs(5), || *layer.seen.lock() == 1));
    assert!(texts.lock().is_empty());

    drop(guard);
    pair.offerer.send_text("{\"n\":2}").unwrap();
    assert!(wait_until(Duration::from_secs(5), || texts.lock().len() == 1));
    assert_eq!(*layer.seen.lock(), 1);
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 20)]
fn error_is_terminal_and_sending_stops() {
    let pair = connected_pair(SessionConfig::default());
    let failures = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&failures);
    pair.offerer.on_failed(move |_| *counter.lock() += 1);

    pair.offerer_transport
        .emit(TransportEvent::StateChanged(TransportState::Failed));
    assert_eq!(
        pair.offerer
            .wait_for_state(ConnectionState::Closed, Duration::from_secs(5)),
        ConnectionState::Error
    );
    pair.offerer_transport
        .emit(TransportEvent::StateChanged(TransportState::Connected));
    assert!(wait_until(Duration::from_secs(2), || *failures.lock() == 1));
    assert_eq!(pair.offerer.state(), ConnectionState::Error);
    assert!(matches!(
        pair.offerer.send_text("late"),
        Err(ConnectionError::NotConnected)
    ));
    pair.shutdown();
    assert_eq!(pair.offerer.state(), ConnectionState::Error);
}

#[test_watchdog::watchdog(secs = 20)]
fn sending_before_connected_is_refused() {
    let transport = MockTransport::new();
    let session = PeerSession::new("idle", SessionConfig::default(), Arc::new(transport.clone())).unwrap();
    session.attach(Recorder::new()).unwrap();
    assert_eq!(
        session.wait_for_state(ConnectionState::Signup, Duration::from_secs(5)),
        ConnectionState::Signup
    );
    assert!(matches!(
        session.send_on_data_channel(b"early"),
        Err(ConnectionError::NotConnected)
    ));
    assert!(transport.sent().is_empty());
    session.shutdown();
    assert_eq!(session.state(), ConnectionState::Closed);
}
