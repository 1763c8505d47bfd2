//! Peer-to-peer media and data bridging over WebRTC.
//!
//! A [`PeerSession`] negotiates one peer connection through a JSON signaling
//! server. [`ChunkedTransport`] moves large buffers over its data channel,
//! [`MediaReceiver`] turns its video track back into frames, and a pair of
//! [`BridgeRelay`]s multiplexes many sessions across a trusted UDP link.

pub mod cancel;
pub mod chunked;
pub mod config;
pub mod error;
pub mod media;
pub mod relay;
mod runtime;
pub mod session;
pub mod signaling;
pub mod task_queue;
pub mod telemetry;

pub use cancel::CancelToken;
pub use chunked::{BufferReceiver, ChunkConfig, ChunkedTransport, ReceivedBuffer, TransferReport};
pub use config::{BridgeConfig, SessionConfig, TimeoutPolicy};
pub use error::{
    ConfigError, ConnectionError, QueueClosed, ReassemblyError, RelayError, Result,
    SignalingError, StraitError, TimeoutError, TransferError,
};
pub use media::{
    AccessUnit, DecodeError, DecodedFrame, FrameDecoder, FrameReassembler, MediaReceiver,
    PushOutcome, ReassemblerConfig,
};
pub use relay::{BridgeRelay, EndpointFactory, Liveness, RelayRole};
pub use session::{ConnectionState, PeerSession};
pub use signaling::{EnvelopeSink, SignalingChannel, SignalingEvent};
pub use strait_proto::Codec;
pub use task_queue::TaskQueue;
pub use telemetry::LogVerbosity;
