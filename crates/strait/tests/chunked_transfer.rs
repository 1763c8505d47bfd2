mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use strait::chunked::typed::Geometry;
use strait::chunked::GeometryDelivery;
use strait::session::{Intercept, MessageLayer};
use strait::{
    BufferReceiver, CancelToken, ChunkConfig, ChunkedTransport, ConnectionError, PeerSession,
    ReceivedBuffer, SessionConfig, TransferError,
};
use strait_proto::{BufferFormat, ChannelMessage, Envelope};

use common::{connected_pair, wait_until};

fn collector() -> (
    Arc<Mutex<Vec<ReceivedBuffer>>>,
    impl Fn(ReceivedBuffer) + Send + Sync + 'static,
) {
    let buffers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffers);
    (buffers, move |buffer| sink.lock().push(buffer))
}

fn quick(retry_on_error: bool) -> ChunkConfig {
    ChunkConfig {
        ack_timeout: Duration::from_secs(2),
        retry_on_error,
        max_attempts: 3,
    }
}

#[test_watchdog::watchdog(secs = 30)]
fn large_buffer_arrives_in_seven_chunks() {
    let pair = connected_pair(SessionConfig::default());
    let (buffers, on_buffer) = collector();
    let (_receiver, _guard) = BufferReceiver::install(&pair.answerer, on_buffer);

    let mut data = vec![0u8; 100_000];
    rand::thread_rng().fill_bytes(&mut data);
    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(false));
    let report = transport.send_buffer("mesh", &data, BufferFormat::Raw).unwrap();
    assert_eq!(report.chunks, 7);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.bytes, 100_000);

    assert!(wait_until(Duration::from_secs(5), || buffers.lock().len() == 1));
    let received = buffers.lock()[0].clone();
    assert_eq!(received.name, "mesh");
    assert_eq!(received.format, BufferFormat::Raw);
    assert_eq!(received.data.as_ref(), data.as_slice());
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn raw_buffers_that_look_like_json_arrive_intact() {
    let pair = connected_pair(SessionConfig::default());
    let (buffers, on_buffer) = collector();
    let (_receiver, _guard) = BufferReceiver::install(&pair.answerer, on_buffer);
    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(false));

    let payloads: [&[u8]; 3] = [
        br#"{"hello":"world"}"#,
        br#"{"type":"control","message":"x","id":1}"#,
        b"{ not json }",
    ];
    for (i, payload) in payloads.iter().enumerate() {
        let report = transport.send_buffer("doc", payload, BufferFormat::Raw).unwrap();
        assert_eq!(report.chunks, 1);
        assert!(wait_until(Duration::from_secs(5), || buffers.lock().len() == i + 1));
        assert_eq!(buffers.lock()[i].data.as_ref(), *payload);
    }
    pair.shutdown();
}

/// Rejects the fifth data chunk of the first transfer, then behaves like the
/// wrapped receiver.
struct RejectFifthChunk {
    inner: BufferReceiver,
    chunks: AtomicUsize,
    rejected: AtomicBool,
}

impl MessageLayer for RejectFifthChunk {
    fn intercept(&self, message: &ChannelMessage, session: &PeerSession) -> Intercept {
        let is_chunk = message
            .json_text(session.channel_tag())
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .is_none_or(|value| value["type"] != "buffer");
        if is_chunk && self.inner.is_receiving() {
            let seen = self.chunks.fetch_add(1, Ordering::SeqCst) + 1;
            if seen == 5 && !self.rejected.swap(true, Ordering::SeqCst) {
                session
                    .send_json(&Envelope::error("chunk checksum mismatch").to_value())
                    .unwrap();
                return Intercept::Consumed;
            }
        }
        self.inner.intercept(message, session)
    }
}

fn flaky_receiver(session: &PeerSession) -> (Arc<Mutex<Vec<ReceivedBuffer>>>, strait::session::LayerGuard) {
    let (buffers, on_buffer) = collector();
    let layer = Arc::new(RejectFifthChunk {
        inner: BufferReceiver::new(on_buffer),
        chunks: AtomicUsize::new(0),
        rejected: AtomicBool::new(false),
    });
    let guard = session.install_layer(layer);
    (buffers, guard)
}

#[test_watchdog::watchdog(secs = 30)]
fn rejected_chunk_restarts_the_transfer() {
    let pair = connected_pair(SessionConfig::default());
    let (buffers, _guard) = flaky_receiver(&pair.answerer);

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(true));
    let report = transport.send_buffer("retry", &data, BufferFormat::Raw).unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(report.chunks, 7);

    assert!(wait_until(Duration::from_secs(5), || buffers.lock().len() == 1));
    assert_eq!(buffers.lock()[0].data.as_ref(), data.as_slice());

    let tag = pair.offerer.channel_tag();
    let starts = pair
        .offerer_transport
        .sent()
        .iter()
        .filter_map(|message| message.json_text(tag))
        .filter_map(|text| serde_json::from_str::<Value>(&text).ok())
        .filter(|value| value["type"] == "buffer" && value.get("start").is_some())
        .count();
    assert_eq!(starts, 2);
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn rejection_without_retry_names_the_chunk() {
    let pair = connected_pair(SessionConfig::default());
    let (buffers, _guard) = flaky_receiver(&pair.answerer);

    let data = vec![7u8; 100_000];
    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(false));
    match transport.send_buffer("once", &data, BufferFormat::Raw) {
        Err(TransferError::Rejected { name, chunk, message }) => {
            assert_eq!(name, "once");
            assert_eq!(chunk, 4);
            assert_eq!(message, "chunk checksum mismatch");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert!(buffers.lock().is_empty());
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn base64_doubles_match_the_golden_encoding() {
    let pair = connected_pair(SessionConfig::default());
    let (buffers, on_buffer) = collector();
    let (_receiver, _guard) = BufferReceiver::install(&pair.answerer, on_buffer);

    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(false));
    let report = transport
        .send_f64s("heights", &[1.0, -2.5], BufferFormat::Base64)
        .unwrap();
    assert_eq!(report.chunks, 1);
    assert_eq!(report.bytes, 24);

    let tag = pair.offerer.channel_tag();
    let sent = pair.offerer_transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[1].payload(tag).as_ref(), b"AAAAAAAA8D8AAAAAAAAEwA==");

    assert!(wait_until(Duration::from_secs(5), || buffers.lock().len() == 1));
    let received = buffers.lock()[0].clone();
    assert_eq!(received.format, BufferFormat::Base64);
    let expected: Vec<u8> = [1.0f64.to_le_bytes(), (-2.5f64).to_le_bytes()].concat();
    assert_eq!(received.data.as_ref(), expected.as_slice());
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn silent_receiver_times_out_on_the_start_step() {
    let pair = connected_pair(SessionConfig::default());
    let transport = ChunkedTransport::with_config(
        pair.offerer.clone(),
        ChunkConfig {
            ack_timeout: Duration::from_millis(200),
            ..quick(false)
        },
    );
    match transport.send_buffer("nobody", b"hello", BufferFormat::Raw) {
        Err(TransferError::Timeout { name, step, .. }) => {
            assert_eq!(name, "nobody");
            assert_eq!(step, 0);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn cancelled_transfer_sends_nothing() {
    let pair = connected_pair(SessionConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let transport =
        ChunkedTransport::with_config(pair.offerer.clone(), quick(false)).with_cancel(cancel);
    let before = pair.offerer_transport.sent().len();
    assert!(matches!(
        transport.send_buffer("skipped", &[1, 2, 3], BufferFormat::Raw),
        Err(TransferError::Cancelled)
    ));
    assert_eq!(pair.offerer_transport.sent().len(), before);
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn closed_session_refuses_the_transfer() {
    let pair = connected_pair(SessionConfig::default());
    pair.offerer.shutdown();
    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(true));
    assert!(matches!(
        transport.send_buffer("late", &[0; 32], BufferFormat::Raw),
        Err(TransferError::Connection(ConnectionError::NotConnected))
    ));
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn large_geometry_falls_back_to_buffers() {
    let pair = connected_pair(SessionConfig {
        max_message_size: 512,
        ..SessionConfig::default()
    });
    let (buffers, on_buffer) = collector();
    let (_receiver, _guard) = BufferReceiver::install(&pair.answerer, on_buffer);
    let spawned = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&spawned);
    pair.answerer.on_message(move |text| sink.lock().push(text));

    let points: Vec<f64> = (0..300).map(f64::from).collect();
    let triangles: Vec<u32> = (0..99).collect();
    let transport = ChunkedTransport::with_config(pair.offerer.clone(), quick(false));
    let delivery = transport
        .send_geometry(&Geometry::new("terrain", &points, &triangles))
        .unwrap();
    match delivery {
        GeometryDelivery::Chunked(reports) => {
            let parts: Vec<_> = reports.iter().map(|(part, _)| *part).collect();
            assert_eq!(parts, ["points", "triangles"]);
        }
        GeometryDelivery::Direct => panic!("mesh should not fit in one message"),
    }

    assert!(wait_until(Duration::from_secs(5), || {
        buffers.lock().len() == 2 && !spawned.lock().is_empty()
    }));
    assert_eq!(buffers.lock()[0].data.len(), 300 * 8);
    assert_eq!(buffers.lock()[1].data.len(), 99 * 4);
    let spawn: Value = serde_json::from_str(&spawned.lock()[0]).unwrap();
    assert_eq!(spawn["type"], "spawn");
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn small_geometry_goes_in_one_message() {
    let pair = connected_pair(SessionConfig::default());
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    pair.answerer.on_message(move |text| sink.lock().push(text));

    let transport = ChunkedTransport::new(pair.offerer.clone());
    let delivery = transport
        .send_geometry(&Geometry::new("tri", &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], &[0, 1, 2]))
        .unwrap();
    assert_eq!(delivery, GeometryDelivery::Direct);
    assert!(wait_until(Duration::from_secs(5), || messages.lock().len() == 1));
    let message: Value = serde_json::from_str(&messages.lock()[0]).unwrap();
    assert_eq!(message["type"], "directbase64");
    assert_eq!(message["name"], "tri");
    assert!(message["points"].is_string());
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn cancel_interrupts_an_ack_wait() {
    let pair = connected_pair(SessionConfig::default());
    let cancel = CancelToken::new();
    let transport = ChunkedTransport::with_config(
        pair.offerer.clone(),
        ChunkConfig {
            ack_timeout: Duration::from_secs(20),
            ..quick(false)
        },
    )
    .with_cancel(cancel.clone());

    let started = std::time::Instant::now();
    let outcome = std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(150));
            cancel.cancel();
        });
        transport.send_buffer("stalled", &[9; 64], BufferFormat::Raw)
    });
    assert!(matches!(outcome, Err(TransferError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    pair.shutdown();
}

#[test_watchdog::watchdog(secs = 30)]
fn receiver_discards_partial_buffer_after_a_violation() {
    let pair = connected_pair(SessionConfig::default());
    let (buffers, on_buffer) = collector();
    let (receiver, _guard) = BufferReceiver::install(&pair.answerer, on_buffer);
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    pair.offerer
        .on_message(move |text| sink.lock().push(serde_json::from_str::<Value>(&text).unwrap()));
    let errors = || {
        replies
            .lock()
            .iter()
            .filter(|value| value["type"] == "error")
            .count()
    };

    pair.offerer
        .send_json(&serde_json::json!({"type": "buffer", "start": "small", "size": 4, "format": "raw"}))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || receiver.is_receiving()));
    pair.offerer.send_on_data_channel(&[1, 2, 3, 4, 5, 6]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || errors() == 1));
    assert!(!receiver.is_receiving());

    // The partial buffer is gone, so a stop has nothing to finish.
    pair.offerer
        .send_json(&serde_json::json!({"type": "buffer", "stop": "small"}))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || errors() == 2));
    assert!(buffers.lock().is_empty());

    let acks: Vec<_> = replies
        .lock()
        .iter()
        .filter(|value| value["type"] == "buffer")
        .map(|value| value["state"].clone())
        .collect();
    assert_eq!(acks, [Value::from("start")]);
    pair.shutdown();
}
