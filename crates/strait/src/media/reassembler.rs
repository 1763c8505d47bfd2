use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strait_proto::{Codec, RtpPacket};

use super::AccessUnit;
use super::depacketize::{depacketize, starts_frame};
use crate::error::{ConfigError, ReassemblyError};

pub const DEFAULT_MAX_BUCKETS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassemblerConfig {
    pub codec: Codec,
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
}

fn default_max_buckets() -> usize {
    DEFAULT_MAX_BUCKETS
}

impl ReassemblerConfig {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            max_buckets: DEFAULT_MAX_BUCKETS,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buckets == 0 {
            return Err(ConfigError::Invalid {
                key: "max_buckets",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Held until the rest of its frame arrives.
    Buffered,
    /// Completed a frame that went to the unit sink.
    Submitted { timestamp: u32 },
    Discarded(ReassemblyError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub submitted: u64,
    /// Buckets dropped for a gap or a depacketization failure.
    pub discarded: u64,
    pub evicted: u64,
    pub duplicates: u64,
    pub late: u64,
}

struct FrameBucket {
    timestamp: u32,
    packets: Vec<(u16, Bytes)>,
    marker: Option<u16>,
}

impl FrameBucket {
    fn new(timestamp: u32) -> Self {
        Self {
            timestamp,
            packets: Vec::new(),
            marker: None,
        }
    }

    /// Sequence numbers and bodies in order when the packets form one
    /// unbroken run ending at the marker.
    fn ordered(&self) -> Option<Vec<(u16, &[u8])>> {
        let marker = self.marker?;
        let count = self.packets.len();
        let mut ordered: Vec<(usize, u16, &[u8])> = Vec::with_capacity(count);
        for (sequence, body) in &self.packets {
            let back = usize::from(marker.wrapping_sub(*sequence));
            if back >= count {
                return None;
            }
            ordered.push((back, *sequence, body.as_ref()));
        }
        ordered.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Some(ordered.into_iter().map(|(_, seq, body)| (seq, body)).collect())
    }
}

/// `a` is earlier than `b` in RTP timestamp order.
fn earlier(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

pub type UnitSink = Box<dyn FnMut(AccessUnit) + Send>;

/// Collects RTP packets into per-timestamp buckets and hands each complete
/// frame to a sink as an [`AccessUnit`].
///
/// Packets of a frame may arrive in any order. A frame is complete once its
/// marker packet is present and the sequence numbers back to its first
/// packet are contiguous. For VP8 and VP9 the first packet carries a start
/// flag. H.264 and H.265 have none at the access unit level, so the first
/// packet must directly follow a packet of an earlier frame. The first frame
/// of a stream has nothing before it and is taken once a later timestamp
/// shows up. Frames older than the last
/// submitted one can no longer complete and are discarded; the bucket count
/// is bounded and the oldest bucket is evicted first.
pub struct FrameReassembler {
    config: ReassemblerConfig,
    buckets: VecDeque<FrameBucket>,
    last_submitted: Option<u32>,
    /// Marker sequence of the last frame taken out of the buckets.
    last_marker: Option<u16>,
    stats: ReassemblyStats,
    sink: UnitSink,
}

impl FrameReassembler {
    pub fn new(config: ReassemblerConfig, sink: impl FnMut(AccessUnit) + Send + 'static) -> Self {
        Self {
            config,
            buckets: VecDeque::new(),
            last_submitted: None,
            last_marker: None,
            stats: ReassemblyStats::default(),
            sink: Box::new(sink),
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    pub fn pending_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn push_packet(&mut self, raw: &[u8]) -> Result<PushOutcome, ReassemblyError> {
        let packet = RtpPacket::parse(raw)?;
        let timestamp = packet.timestamp();
        let sequence = packet.sequence();

        if let Some(last) = self.last_submitted {
            if !earlier(last, timestamp) {
                self.stats.late += 1;
                return Ok(PushOutcome::Discarded(ReassemblyError::Late { timestamp }));
            }
        }

        let index = match self.buckets.iter().position(|b| b.timestamp == timestamp) {
            Some(index) => index,
            None => {
                while self.buckets.len() >= self.config.max_buckets.max(1) {
                    if let Some(evicted) = self.buckets.pop_front() {
                        self.stats.evicted += 1;
                        tracing::debug!(
                            target = "strait::media",
                            error = %ReassemblyError::Evicted { timestamp: evicted.timestamp },
                            packets = evicted.packets.len(),
                            "frame bucket evicted"
                        );
                    }
                }
                self.buckets.push_back(FrameBucket::new(timestamp));
                self.buckets.len() - 1
            }
        };

        let bucket = &mut self.buckets[index];
        if bucket.packets.iter().any(|(seq, _)| *seq == sequence) {
            self.stats.duplicates += 1;
            return Ok(PushOutcome::Buffered);
        }
        bucket
            .packets
            .push((sequence, Bytes::copy_from_slice(packet.body())));
        if packet.marker() {
            bucket.marker = Some(sequence);
        }

        Ok(self.complete_frames())
    }

    /// Takes complete frames out of the buckets, earliest first, until none
    /// is left. Reports the last frame taken.
    fn complete_frames(&mut self) -> PushOutcome {
        let mut outcome = PushOutcome::Buffered;
        while let Some(index) = self.next_complete() {
            let Some(bucket) = self.buckets.remove(index) else {
                break;
            };
            outcome = self.finish(bucket);
        }
        outcome
    }

    fn next_complete(&self) -> Option<usize> {
        let mut found: Option<usize> = None;
        for (index, bucket) in self.buckets.iter().enumerate() {
            if !self.is_complete(bucket) {
                continue;
            }
            match found {
                Some(current) if !earlier(bucket.timestamp, self.buckets[current].timestamp) => {}
                _ => found = Some(index),
            }
        }
        found
    }

    fn is_complete(&self, bucket: &FrameBucket) -> bool {
        let Some(ordered) = bucket.ordered() else {
            return false;
        };
        let Some(&(first, body)) = ordered.first() else {
            return false;
        };
        let codec = self.config.codec;
        match codec {
            Codec::Vp8 | Codec::Vp9 => starts_frame(codec, body),
            Codec::H264 | Codec::H265 => {
                let previous = first.wrapping_sub(1);
                let follows_earlier_frame = self.last_marker == Some(previous)
                    || self.buckets.iter().any(|other| {
                        earlier(other.timestamp, bucket.timestamp)
                            && other.packets.iter().any(|(seq, _)| *seq == previous)
                    });
                if follows_earlier_frame {
                    return true;
                }
                // Nothing taken yet: the first frame of the stream.
                self.last_marker.is_none()
                    && starts_frame(codec, body)
                    && self
                        .buckets
                        .iter()
                        .any(|other| earlier(bucket.timestamp, other.timestamp))
            }
        }
    }

    fn finish(&mut self, bucket: FrameBucket) -> PushOutcome {
        let codec = self.config.codec;
        let timestamp = bucket.timestamp;
        let result = match bucket.ordered() {
            Some(ordered) => {
                let bodies: Vec<&[u8]> = ordered.into_iter().map(|(_, body)| body).collect();
                depacketize(codec, &bodies)
            }
            None => return PushOutcome::Buffered,
        };
        self.last_marker = bucket.marker;
        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.discarded += 1;
                let error = ReassemblyError::Depacketize {
                    timestamp,
                    reason: err.to_string(),
                };
                tracing::warn!(target = "strait::media", error = %error, packets = bucket.packets.len(), "frame discarded");
                return PushOutcome::Discarded(error);
            }
        };

        self.discard_before(timestamp);
        self.last_submitted = Some(timestamp);
        self.stats.submitted += 1;
        (self.sink)(AccessUnit {
            codec,
            timestamp,
            keyframe: frame.keyframe,
            data: frame.data,
        });
        PushOutcome::Submitted { timestamp }
    }

    fn discard_before(&mut self, timestamp: u32) {
        let before = self.buckets.len();
        self.buckets.retain(|bucket| {
            let stale = earlier(bucket.timestamp, timestamp);
            if stale {
                tracing::debug!(
                    target = "strait::media",
                    error = %ReassemblyError::Gap { timestamp: bucket.timestamp },
                    packets = bucket.packets.len(),
                    "incomplete frame discarded"
                );
            }
            !stale
        });
        self.stats.discarded += (before - self.buckets.len()) as u64;
    }
}

impl std::fmt::Debug for FrameReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReassembler")
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .field("stats", &self.stats)
            .finish()
    }
}
