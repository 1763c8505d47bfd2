//! Websocket client for the rendezvous server.
//!
//! The channel only moves JSON envelopes; interpreting them is up to the
//! subscribed handler. There is no reconnection: once the socket closes the
//! channel is dead and `send` fails with [`SignalingError::Closed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::error::SignalingError;
use crate::runtime::{block_on, spawn_on_global};

/// Anything that can carry an envelope toward the rendezvous server.
///
/// Sessions only see this trait, so the relay can hand them forwarders that
/// stamp endpoint ids instead of a real channel.
pub trait EnvelopeSink: Send + Sync {
    fn send_envelope(&self, envelope: Value) -> Result<(), SignalingError>;

    fn close(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Open,
    Envelope(Value),
    Closed,
    Error(String),
}

/// Runs on a runtime thread; must not block.
pub type SignalingHandler = Arc<dyn Fn(SignalingEvent) + Send + Sync>;

pub struct SignalingChannel {
    url: Url,
    send_tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Connects and blocks until the socket is open. `handler` sees
    /// [`SignalingEvent::Open`] before any envelope.
    pub fn connect(url: &str, handler: SignalingHandler) -> Result<Arc<Self>, SignalingError> {
        let url = normalize_url(url)?;
        block_on(Self::open(url, handler))
    }

    async fn open(url: Url, handler: SignalingHandler) -> Result<Arc<Self>, SignalingError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(format!("{url}: {err}")))?;
        tracing::debug!(target = "strait::signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_handle = spawn_on_global(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        handler(SignalingEvent::Open);

        let reader_open = Arc::clone(&open);
        let reader_handle = spawn_on_global(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target = "strait::signaling", kind = "text", len = text.len(), "ws in");
                        dispatch_text(&handler, &text);
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::trace!(target = "strait::signaling", kind = "binary", len = data.len(), "ws in");
                        match String::from_utf8(data) {
                            Ok(text) => dispatch_text(&handler, &text),
                            Err(_) => tracing::warn!(
                                target = "strait::signaling",
                                "dropping non UTF-8 binary frame"
                            ),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "strait::signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "strait::signaling", "signaling websocket error: {err}");
                                handler(SignalingEvent::Error(err.to_string()));
                            }
                        }
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            handler(SignalingEvent::Closed);
        });

        Ok(Arc::new(Self {
            url,
            send_tx,
            open,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        }))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn send(&self, envelope: &Value) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::Closed);
        }
        tracing::trace!(
            target = "strait::signaling",
            kind = strait_proto::envelope_type(envelope).unwrap_or("?"),
            "ws out"
        );
        self.send_tx
            .send(Message::Text(envelope.to_string()))
            .map_err(|_| SignalingError::Closed)
    }

    /// Sends a close frame and stops reading. No `Closed` event follows.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.send_tx.send(Message::Close(None));
            tracing::debug!(target = "strait::signaling", url = %self.url, "signaling channel closed locally");
        }
        let mut tasks = self.tasks.lock();
        if tasks.len() > 1 {
            for handle in tasks.drain(1..) {
                handle.abort();
            }
        }
    }
}

impl EnvelopeSink for SignalingChannel {
    fn send_envelope(&self, envelope: Value) -> Result<(), SignalingError> {
        self.send(&envelope)
    }

    fn close(&self) {
        SignalingChannel::close(self);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("url", &self.url.as_str())
            .field("open", &self.is_open())
            .finish()
    }
}

fn dispatch_text(handler: &SignalingHandler, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(target = "strait::signaling", error = %err, "dropping non-JSON signaling frame");
            return;
        }
    };
    if strait_proto::envelope_type(&value).is_none() {
        tracing::warn!(target = "strait::signaling", "dropping signaling frame without a string `type`");
        return;
    }
    handler(SignalingEvent::Envelope(value));
}

/// Accepts `ws://`, `wss://` or a bare `host:port`, which is taken as `ws://`.
pub fn normalize_url(raw: &str) -> Result<Url, SignalingError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(SignalingError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme `{other}`"),
            });
        }
    }
    if url.host_str().is_none() {
        return Err(SignalingError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_becomes_ws() {
        let url = normalize_url("127.0.0.1:8080").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/");
        let secure = normalize_url(" wss://signal.example.com/room ").unwrap();
        assert_eq!(secure.scheme(), "wss");
    }

    #[test]
    fn other_schemes_are_rejected() {
        assert!(matches!(
            normalize_url("http://127.0.0.1:8080"),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(matches!(
            normalize_url("ws://"),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn frames_without_type_are_dropped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: SignalingHandler = Arc::new(move |event| sink.lock().push(event));
        dispatch_text(&handler, "not json");
        dispatch_text(&handler, r#"{"sdp": "x"}"#);
        dispatch_text(&handler, r#"{"type": 4}"#);
        dispatch_text(&handler, r#"{"type": "playerCount", "count": 2}"#);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], SignalingEvent::Envelope(value) if value["count"] == 2));
    }

    #[test]
    fn connect_failure_is_reported() {
        let handler: SignalingHandler = Arc::new(|_| {});
        let err = SignalingChannel::connect("ws://127.0.0.1:1", handler).unwrap_err();
        assert!(matches!(err, SignalingError::Connect(_)));
    }
}
