use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use strait_proto::{BufferControl, BufferFormat, BufferState, ChannelMessage, Envelope, envelope_type};

use crate::session::{Intercept, LayerGuard, MessageLayer, PeerSession};

/// Upper bound on a single incoming buffer unless configured otherwise.
pub const DEFAULT_RECEIVE_LIMIT: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBuffer {
    pub name: String,
    pub format: BufferFormat,
    /// Decoded bytes; base64 transfers are already decoded.
    pub data: Bytes,
}

struct Pending {
    name: String,
    size: usize,
    format: BufferFormat,
    data: BytesMut,
}

/// Receiving half of the chunked transfer protocol.
///
/// Installed as a session layer it owns the channel's non-JSON frames: a
/// frame outside a `start`/`stop` pair is a protocol violation. Any violation
/// discards the partial buffer and answers with an `error` envelope; the
/// sender has to start over.
pub struct BufferReceiver {
    pending: Mutex<Option<Pending>>,
    limit: usize,
    on_buffer: Box<dyn Fn(ReceivedBuffer) + Send + Sync>,
}

impl BufferReceiver {
    pub fn new(on_buffer: impl Fn(ReceivedBuffer) + Send + Sync + 'static) -> Self {
        Self::with_limit(DEFAULT_RECEIVE_LIMIT, on_buffer)
    }

    pub fn with_limit(limit: usize, on_buffer: impl Fn(ReceivedBuffer) + Send + Sync + 'static) -> Self {
        Self {
            pending: Mutex::new(None),
            limit,
            on_buffer: Box::new(on_buffer),
        }
    }

    /// Builds a receiver and installs it on `session`.
    pub fn install(
        session: &PeerSession,
        on_buffer: impl Fn(ReceivedBuffer) + Send + Sync + 'static,
    ) -> (Arc<Self>, LayerGuard) {
        let receiver = Arc::new(Self::new(on_buffer));
        let guard = session.install_layer(Arc::clone(&receiver) as Arc<dyn MessageLayer>);
        (receiver, guard)
    }

    pub fn is_receiving(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn on_start(&self, control: BufferControl, session: &PeerSession) {
        let name = control.start.unwrap_or_default();
        let Some(size) = control.size else {
            self.reject(session, format!("buffer `{name}` started without a size"));
            return;
        };
        let size = size as usize;
        if size > self.limit {
            self.reject(session, format!("buffer `{name}` of {size} bytes exceeds {}", self.limit));
            return;
        }
        let format = control.format.unwrap_or_default();
        let previous = self.pending.lock().replace(Pending {
            name: name.clone(),
            size,
            format,
            data: BytesMut::with_capacity(size),
        });
        if let Some(previous) = previous {
            tracing::warn!(
                target = "strait::chunked",
                discarded = %previous.name,
                received = previous.data.len(),
                "new start discards partial buffer"
            );
        }
        tracing::debug!(target = "strait::chunked", name = %name, size, ?format, "receiving buffer");
        acknowledge(session, BufferControl::ack(name, BufferState::Start, None));
    }

    fn on_data(&self, payload: Bytes, session: &PeerSession) {
        let outcome = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                None => Err("data frame without start".to_string()),
                Some(buffer) if buffer.data.len() + payload.len() > buffer.size => Err(format!(
                    "buffer `{}` overflows its declared {} bytes",
                    buffer.name, buffer.size
                )),
                Some(buffer) => {
                    buffer.data.extend_from_slice(&payload);
                    Ok((buffer.name.clone(), buffer.data.len()))
                }
            }
        };
        match outcome {
            Ok((name, received)) => {
                tracing::trace!(target = "strait::chunked", name = %name, received, "chunk received");
                acknowledge(
                    session,
                    BufferControl::ack(name, BufferState::Transit, Some(received as u64)),
                );
            }
            Err(reason) => self.reject(session, reason),
        }
    }

    fn on_stop(&self, control: BufferControl, session: &PeerSession) {
        let Some(buffer) = self.pending.lock().take() else {
            self.reject(session, "stop without start".to_string());
            return;
        };
        let stop_name = control.stop.unwrap_or_default();
        if !stop_name.is_empty() && stop_name != buffer.name {
            self.reject(
                session,
                format!("stop for `{stop_name}` while receiving `{}`", buffer.name),
            );
            return;
        }
        if buffer.data.len() != buffer.size {
            self.reject(
                session,
                format!(
                    "buffer `{}` ended after {} of {} bytes",
                    buffer.name,
                    buffer.data.len(),
                    buffer.size
                ),
            );
            return;
        }
        let data = match buffer.format {
            BufferFormat::Raw => buffer.data.freeze(),
            BufferFormat::Base64 => match STANDARD.decode(&buffer.data) {
                Ok(decoded) => Bytes::from(decoded),
                Err(err) => {
                    self.reject(session, format!("buffer `{}` is not valid base64: {err}", buffer.name));
                    return;
                }
            },
        };
        acknowledge(
            session,
            BufferControl::ack(buffer.name.clone(), BufferState::Stop, Some(buffer.size as u64)),
        );
        tracing::debug!(target = "strait::chunked", name = %buffer.name, bytes = data.len(), "buffer received");
        (self.on_buffer)(ReceivedBuffer {
            name: buffer.name,
            format: buffer.format,
            data,
        });
    }

    fn on_control(&self, value: Value, session: &PeerSession) -> Intercept {
        let control: BufferControl = match serde_json::from_value(value) {
            Ok(control) => control,
            Err(err) => {
                self.reject(session, format!("malformed buffer envelope: {err}"));
                return Intercept::Consumed;
            }
        };
        if control.start.is_some() {
            self.on_start(control, session);
        } else if control.stop.is_some() {
            self.on_stop(control, session);
        } else {
            // Acknowledgement for a transfer going the other way.
            return Intercept::Forward;
        }
        Intercept::Consumed
    }

    fn reject(&self, session: &PeerSession, reason: String) {
        self.pending.lock().take();
        tracing::warn!(target = "strait::chunked", %reason, "buffer rejected");
        if let Err(err) = session.send_json(&Envelope::error(reason).to_value()) {
            tracing::warn!(target = "strait::chunked", error = %err, "failed to send rejection");
        }
    }
}

fn acknowledge(session: &PeerSession, ack: BufferControl) {
    if let Err(err) = session.send_json(&Envelope::Buffer(ack).to_value()) {
        tracing::warn!(target = "strait::chunked", error = %err, "failed to send acknowledgement");
    }
}

impl MessageLayer for BufferReceiver {
    fn intercept(&self, message: &ChannelMessage, session: &PeerSession) -> Intercept {
        let tag = session.channel_tag();
        let text = message.json_text(tag);
        let value = text
            .as_deref()
            .and_then(|text| serde_json::from_str::<Value>(text).ok());
        match value {
            Some(value) if envelope_type(&value) == Some("buffer") => self.on_control(value, session),
            // Chunks can look like JSON; while a buffer is pending they are data.
            _ if self.is_receiving() => {
                self.on_data(message.payload(tag), session);
                Intercept::Consumed
            }
            _ if text.is_some() || matches!(message, ChannelMessage::Text(_)) => Intercept::Forward,
            _ => {
                self.on_data(message.payload(tag), session);
                Intercept::Consumed
            }
        }
    }
}
