//! Chunked buffer transfer over a connected session's data channel.
//!
//! ```text
//! sender                         receiver
//!   buffer{start,size,format} -->
//!                             <-- buffer{name,state:start}
//!   chunk 0 .. N-1 (framed)   -->
//!                             <-- buffer{name,state:transit}   (one per chunk)
//!   buffer{stop}              -->
//!                             <-- buffer{name,state:stop,amount}
//! ```
//!
//! Exactly one step is in flight. An `error` envelope from the receiver
//! aborts the transfer; a retry always starts over at chunk 0.

pub mod receiver;
pub mod typed;

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;
use serde_json::Value;
use strait_proto::{
    BufferControl, BufferFormat, ChannelMessage, Envelope, FRAME_OVERHEAD, MAX_FRAME_LEN,
    envelope_type,
};

use crate::cancel::CancelToken;
use crate::config::{parse_bool_env, parse_env_or};
use crate::error::{ConnectionError, TransferError};
use crate::session::{ConnectionState, Intercept, MessageLayer, PeerSession};

pub use self::receiver::{BufferReceiver, ReceivedBuffer};
pub use self::typed::{Geometry, GeometryDelivery, encode_f32s, encode_f64s, encode_i32s};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    pub ack_timeout: Duration,
    /// Restart the whole transfer when the receiver answers with `error`.
    pub retry_on_error: bool,
    /// Upper bound on attempts, the first one included.
    pub max_attempts: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry_on_error: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let ack_timeout_ms = parse_env_or(
            &lookup,
            "STRAIT_CHUNK_ACK_TIMEOUT_MS",
            defaults.ack_timeout.as_millis() as u64,
            1,
        );
        Self {
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            retry_on_error: parse_bool_env(&lookup, "STRAIT_CHUNK_RETRY", defaults.retry_on_error),
            max_attempts: parse_env_or(
                &lookup,
                "STRAIT_CHUNK_MAX_ATTEMPTS",
                defaults.max_attempts,
                1,
            ),
        }
    }
}

/// Payload bytes that fit one framed chunk under a `max_message_size` budget.
pub fn payload_capacity(max_message_size: usize) -> Result<usize, TransferError> {
    let budget = max_message_size.min(MAX_FRAME_LEN);
    if budget <= FRAME_OVERHEAD {
        return Err(TransferError::ChannelTooSmall(max_message_size));
    }
    Ok(budget - FRAME_OVERHEAD)
}

/// Smallest `n` with `n * capacity >= size`.
pub fn chunk_count(size: usize, capacity: usize) -> usize {
    size.div_ceil(capacity.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub chunks: usize,
    pub attempts: usize,
    /// Bytes on the wire, after any base64 expansion.
    pub bytes: usize,
}

#[derive(Debug)]
enum Ack {
    Accepted,
    Rejected(String),
}

/// Consumes buffer acknowledgements and `error` envelopes; forwards the rest.
struct AckLayer {
    tx: Sender<Ack>,
}

impl MessageLayer for AckLayer {
    fn intercept(&self, message: &ChannelMessage, session: &PeerSession) -> Intercept {
        let Some(text) = message.json_text(session.channel_tag()) else {
            return Intercept::Forward;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            return Intercept::Forward;
        };
        let ack = match envelope_type(&value) {
            Some("buffer") if value.get("state").is_some() => {
                let name = value.get("name").and_then(Value::as_str).unwrap_or("");
                let state = value.get("state").and_then(Value::as_str).unwrap_or("");
                tracing::trace!(target = "strait::chunked", name, state, "ack");
                Ack::Accepted
            }
            Some("error") => Ack::Rejected(
                value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            ),
            _ => return Intercept::Forward,
        };
        if self.tx.send(ack).is_err() {
            return Intercept::Forward;
        }
        Intercept::Consumed
    }
}

/// Sends buffers larger than one data-channel message over `session`.
pub struct ChunkedTransport {
    session: PeerSession,
    config: ChunkConfig,
    cancel: CancelToken,
    outstanding: Mutex<()>,
}

impl ChunkedTransport {
    pub fn new(session: PeerSession) -> Self {
        Self::with_config(session, ChunkConfig::from_env())
    }

    pub fn with_config(session: PeerSession, config: ChunkConfig) -> Self {
        Self {
            session,
            config,
            cancel: CancelToken::new(),
            outstanding: Mutex::new(()),
        }
    }

    /// Replaces the cancellation handle observed by every wait.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Transfers `data` as buffer `name`, blocking until the receiver has
    /// acknowledged the stop step.
    pub fn send_buffer(
        &self,
        name: &str,
        data: &[u8],
        format: BufferFormat,
    ) -> Result<TransferReport, TransferError> {
        if self.session.is_worker_thread() {
            return Err(TransferError::WouldDeadlock);
        }
        let capacity = payload_capacity(self.session.max_message_size())?;
        let encoded;
        let payload: &[u8] = match format {
            BufferFormat::Raw => data,
            BufferFormat::Base64 => {
                encoded = STANDARD.encode(data);
                encoded.as_bytes()
            }
        };

        let _outstanding = self.outstanding.lock();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(name, payload, format, capacity) {
                Ok(chunks) => {
                    tracing::debug!(
                        target = "strait::chunked",
                        name,
                        chunks,
                        attempts,
                        bytes = payload.len(),
                        "transfer complete"
                    );
                    return Ok(TransferReport {
                        chunks,
                        attempts,
                        bytes: payload.len(),
                    });
                }
                Err(err)
                    if err.is_retryable()
                        && self.config.retry_on_error
                        && attempts < self.config.max_attempts =>
                {
                    tracing::warn!(target = "strait::chunked", name, attempts, error = %err, "transfer rejected; restarting");
                }
                Err(err) => {
                    tracing::warn!(target = "strait::chunked", name, attempts, error = %err, "transfer failed");
                    return Err(err);
                }
            }
        }
    }

    fn attempt(
        &self,
        name: &str,
        payload: &[u8],
        format: BufferFormat,
        capacity: usize,
    ) -> Result<usize, TransferError> {
        if self.session.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected.into());
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        let _layer = self.session.install_layer(std::sync::Arc::new(AckLayer { tx }));
        let chunks = chunk_count(payload.len(), capacity);

        let start = Envelope::Buffer(BufferControl::start(name, payload.len() as u64, format));
        self.check_cancelled()?;
        self.session.send_json(&start.to_value())?;
        self.wait_ack(&rx, name, 0, 0)?;

        for (index, chunk) in payload.chunks(capacity).enumerate() {
            self.check_cancelled()?;
            self.session.send_on_data_channel(chunk)?;
            tracing::trace!(target = "strait::chunked", name, index, len = chunk.len(), "chunk sent");
            self.wait_ack(&rx, name, index + 1, index)?;
        }

        let stop = Envelope::Buffer(BufferControl::stop(name));
        self.check_cancelled()?;
        self.session.send_json(&stop.to_value())?;
        self.wait_ack(&rx, name, chunks + 1, chunks)?;
        Ok(chunks)
    }

    fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn wait_ack(
        &self,
        rx: &Receiver<Ack>,
        name: &str,
        step: usize,
        chunk: usize,
    ) -> Result<(), TransferError> {
        let session_cancel = self.session.cancel_token();
        select! {
            recv(rx) -> ack => match ack {
                Ok(Ack::Accepted) => Ok(()),
                Ok(Ack::Rejected(message)) => Err(TransferError::Rejected {
                    name: name.to_string(),
                    chunk,
                    message,
                }),
                Err(_) => Err(ConnectionError::NotConnected.into()),
            },
            recv(self.cancel.receiver()) -> _ => Err(TransferError::Cancelled),
            recv(session_cancel.receiver()) -> _ => Err(ConnectionError::NotConnected.into()),
            default(self.config.ack_timeout) => Err(TransferError::Timeout {
                name: name.to_string(),
                step,
                timeout: self.config.ack_timeout,
            }),
        }
    }
}
