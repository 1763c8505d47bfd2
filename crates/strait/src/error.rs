use std::time::Duration;

use strait_proto::{EnvelopeError, FrameError, RtpError};
use thiserror::Error;

use crate::session::ConnectionState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    Closed,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed session description: {0}")]
    MalformedSdp(String),
    #[error("operation `{operation}` not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("data channel not connected")]
    NotConnected,
    #[error("no media track open")]
    NoMediaTrack,
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("peer transport failed")]
    Failed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("session worker stopped")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer rejected chunk {chunk} of `{name}`: {message}")]
    Rejected {
        name: String,
        chunk: usize,
        message: String,
    },
    #[error("no acknowledgement for step {step} of `{name}` within {timeout:?}")]
    Timeout {
        name: String,
        step: usize,
        timeout: Duration,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("channel budget of {0} bytes cannot hold a chunk")]
    ChannelTooSmall(usize),
    #[error("transfer would wait on its own session worker")]
    WouldDeadlock,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("receiver protocol violation: {0}")]
    Protocol(String),
}

impl TransferError {
    /// Whether a whole-transfer retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Rejected { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("malformed rtp packet: {0}")]
    Malformed(#[from] RtpError),
    #[error("frame {timestamp} has a sequence gap")]
    Gap { timestamp: u32 },
    #[error("frame {timestamp} could not be depacketized: {reason}")]
    Depacketize { timestamp: u32, reason: String },
    #[error("frame {timestamp} evicted before it completed")]
    Evicted { timestamp: u32 },
    #[error("packet for frame {timestamp} arrived after a newer frame was submitted")]
    Late { timestamp: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("`{operation}` timed out after {after:?}")]
    Expired {
        operation: &'static str,
        after: Duration,
    },
    #[error("`{operation}` failed because another bridge call timed out")]
    Collateral { operation: &'static str },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("bridge call `{operation}` for endpoint {endpoint} could not be resolved")]
    Unresolved {
        operation: String,
        endpoint: i64,
        #[source]
        cause: TimeoutError,
    },
    #[error("bridge peer replied with an error: {0}")]
    Remote(String),
    #[error("bridge socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge handshake rejected: {0}")]
    Handshake(String),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(i64),
    #[error("endpoint {0} already exists")]
    DuplicateEndpoint(u32),
    #[error("bridge relay stopped")]
    Closed,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Returned by [`crate::TaskQueue::submit`] after shutdown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task queue `{0}` is shut down")]
pub struct QueueClosed(pub &'static str);

#[derive(Debug, Error)]
pub enum StraitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Decode(#[from] crate::media::DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueClosed),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StraitError> = std::result::Result<T, E>;
