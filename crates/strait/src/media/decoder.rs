use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{AccessUnit, DecodedFrame, FrameDecoder, FrameReassembler, PushOutcome, ReassemblerConfig};
use crate::error::{QueueClosed, ReassemblyError, Result};
use crate::session::{PeerSession, WeakPeerSession};
use crate::task_queue::TaskQueue;

pub type FrameCallback = Arc<dyn Fn(DecodedFrame) + Send + Sync>;

/// Minimum spacing between key frame requests sent after frame loss.
const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct DecodeCounters {
    decoded: AtomicU64,
    failed: AtomicU64,
}

/// Runs a [`FrameDecoder`] on a dedicated task queue.
///
/// Units are decoded in submission order. A failed unit is logged and
/// counted; the next one is decoded as usual.
pub struct DecodeWorker {
    queue: TaskQueue,
    decoder: Arc<Mutex<Box<dyn FrameDecoder>>>,
    on_frame: FrameCallback,
    counters: Arc<DecodeCounters>,
}

impl DecodeWorker {
    pub fn new(
        decoder: impl FrameDecoder + 'static,
        on_frame: impl Fn(DecodedFrame) + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        Ok(Self {
            queue: TaskQueue::new("decoder")?,
            decoder: Arc::new(Mutex::new(Box::new(decoder))),
            on_frame: Arc::new(on_frame),
            counters: Arc::new(DecodeCounters::default()),
        })
    }

    pub fn submit(&self, unit: AccessUnit) -> Result<(), QueueClosed> {
        let decoder = Arc::clone(&self.decoder);
        let on_frame = Arc::clone(&self.on_frame);
        let counters = Arc::clone(&self.counters);
        self.queue.submit(move || {
            let result = decoder.lock().decode(&unit);
            match result {
                Ok(Some(frame)) => {
                    counters.decoded.fetch_add(1, Ordering::Relaxed);
                    on_frame(frame);
                }
                Ok(None) => {}
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target = "strait::media",
                        timestamp = unit.timestamp,
                        keyframe = unit.keyframe,
                        len = unit.data.len(),
                        error = %err,
                        "decode failed"
                    );
                }
            }
        })
    }

    pub fn decoded(&self) -> u64 {
        self.counters.decoded.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Decodes what is already queued, then stops.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

/// Reassembler and decode worker fed from one session's media track.
pub struct MediaReceiver {
    reassembler: Mutex<FrameReassembler>,
    worker: Arc<DecodeWorker>,
    last_keyframe_request: Mutex<Option<Instant>>,
}

impl MediaReceiver {
    pub fn new(
        config: ReassemblerConfig,
        decoder: impl FrameDecoder + 'static,
        on_frame: impl Fn(DecodedFrame) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let worker = Arc::new(DecodeWorker::new(decoder, on_frame)?);
        let sink_worker = Arc::clone(&worker);
        let reassembler = FrameReassembler::new(config, move |unit| {
            let timestamp = unit.timestamp;
            if let Err(err) = sink_worker.submit(unit) {
                tracing::debug!(target = "strait::media", timestamp, error = %err, "access unit dropped");
            }
        });
        Ok(Arc::new(Self {
            reassembler: Mutex::new(reassembler),
            worker,
            last_keyframe_request: Mutex::new(None),
        }))
    }

    /// Feeds every RTP packet `session` receives into this receiver. Frame
    /// loss triggers a rate-limited key frame request on the session.
    pub fn attach(self: &Arc<Self>, session: &PeerSession) {
        let receiver = Arc::downgrade(self);
        let weak_session = session.downgrade();
        session.on_rtp(move |packet: Bytes| {
            on_session_rtp(&receiver, &weak_session, &packet);
        });
    }

    pub fn push_packet(&self, raw: &[u8]) -> Result<PushOutcome, ReassemblyError> {
        self.reassembler.lock().push_packet(raw)
    }

    pub fn stats(&self) -> super::ReassemblyStats {
        self.reassembler.lock().stats()
    }

    pub fn worker(&self) -> &DecodeWorker {
        &self.worker
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    fn keyframe_due(&self) -> bool {
        let mut last = self.last_keyframe_request.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < KEYFRAME_REQUEST_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

fn on_session_rtp(receiver: &Weak<MediaReceiver>, session: &WeakPeerSession, packet: &[u8]) {
    let Some(receiver) = receiver.upgrade() else {
        return;
    };
    let (outcome, lost) = {
        let mut reassembler = receiver.reassembler.lock();
        let before = reassembler.stats();
        let outcome = reassembler.push_packet(packet);
        let after = reassembler.stats();
        (outcome, after.discarded + after.evicted > before.discarded + before.evicted)
    };
    if let Err(err) = outcome {
        tracing::trace!(target = "strait::media", len = packet.len(), error = %err, "rtp packet ignored");
        return;
    }
    if lost && receiver.keyframe_due() {
        if let Some(session) = session.upgrade() {
            if let Err(err) = session.request_keyframe() {
                tracing::debug!(target = "strait::media", error = %err, "key frame request failed");
            }
        }
    }
}

impl Drop for MediaReceiver {
    fn drop(&mut self) {
        self.worker.shutdown();
    }
}
