use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use serde_json::{Value, json};
use strait_proto::{endpoint_id, envelope_type, read_endpoint_id};

use super::routing::{Endpoint, StampedSink};
use super::{RelayInner, rpc::rpc_id};
use crate::error::RelayError;
use crate::session::TrackRole;
use crate::signaling::SignalingEvent;

/// Which half of the bridge a relay is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    /// External half. Players reach it through the public signaling server;
    /// each player offer opens an endpoint that answers and sends media.
    Seeker,
    /// Internal half. Opens an offering, media-receiving session toward the
    /// application for every endpoint the seeker announces.
    Provider,
}

impl RelayRole {
    pub(crate) fn rpc_parity(self) -> u64 {
        match self {
            RelayRole::Seeker => 1,
            RelayRole::Provider => 0,
        }
    }

    /// Envelope from this relay's own signaling domain. Bridge thread.
    pub(crate) fn on_signaling(self, relay: &Arc<RelayInner>, value: Value) {
        match self {
            RelayRole::Seeker => seeker_signaling(relay, value),
            RelayRole::Provider => provider_signaling(relay, value),
        }
    }

    /// Request from the other half. Bridge thread.
    pub(crate) fn on_bridge_envelope(self, relay: &Arc<RelayInner>, value: Value) {
        match (self, envelope_type(&value)) {
            (RelayRole::Provider, Some("offer")) => provider_offer(relay, value),
            (_, Some("control")) => relay.deliver_control(&value),
            (_, Some("playerDisconnected")) => {
                match endpoint_id(&value).and_then(|id| u32::try_from(id).ok()) {
                    Some(id) => relay.destroy_endpoint(id, false),
                    None => tracing::warn!(target = "strait::relay", "disconnect without endpoint id dropped"),
                }
            }
            (_, kind) => {
                if rpc_id(&value).is_some() {
                    relay.reply_error(&value, format!("unsupported request `{}`", kind.unwrap_or("?")));
                } else {
                    tracing::warn!(target = "strait::relay", role = ?self, kind = kind.unwrap_or("?"), "unhandled bridge envelope");
                }
            }
        }
    }

    /// RTP from the other half. Listener thread.
    pub(crate) fn on_bridge_rtp(self, relay: &Arc<RelayInner>, packet: Bytes) {
        if self == RelayRole::Provider {
            tracing::warn!(target = "strait::relay", len = packet.len(), "provider does not accept bridged rtp");
            return;
        }
        let Some(id) = read_endpoint_id(&packet, relay.config.rtp_header_offset) else {
            tracing::warn!(target = "strait::relay", len = packet.len(), "rtp without endpoint id dropped");
            return;
        };
        let session = relay.routing.lock().session(u32::from(id));
        let Some(session) = session else {
            tracing::warn!(target = "strait::relay", endpoint = id, "rtp for unknown endpoint dropped");
            return;
        };
        if let Err(err) = session.send_rtp(&packet) {
            tracing::trace!(target = "strait::relay", endpoint = id, error = %err, "rtp not delivered");
        }
    }
}

fn seeker_signaling(relay: &Arc<RelayInner>, value: Value) {
    let kind = envelope_type(&value).unwrap_or("?").to_string();
    let Some(peer) = endpoint_id(&value) else {
        tracing::debug!(target = "strait::relay", %kind, "signaling envelope without player id ignored");
        return;
    };
    match kind.as_str() {
        "offer" => seeker_offer(relay, peer, value),
        "iceCandidate" => {
            let session = {
                let routing = relay.routing.lock();
                routing.by_peer(peer).and_then(|id| routing.session(id))
            };
            match session {
                Some(session) => session.handle_signaling_event(SignalingEvent::Envelope(value)),
                None => tracing::warn!(target = "strait::relay", peer, "candidate for unknown player dropped"),
            }
        }
        "playerDisconnected" => {
            let id = relay.routing.lock().by_peer(peer);
            match id {
                Some(id) => relay.destroy_endpoint(id, true),
                None => tracing::debug!(target = "strait::relay", peer, "unknown player left"),
            }
        }
        _ => tracing::debug!(target = "strait::relay", %kind, peer, "signaling envelope not relayed"),
    }
}

/// Player `peer` offers: open an endpoint, make sure the provider has its
/// counterpart, then let the endpoint answer the player.
fn seeker_offer(relay: &Arc<RelayInner>, peer: i64, offer: Value) {
    if relay.routing.lock().by_peer(peer).is_some() {
        tracing::warn!(target = "strait::relay", peer, "repeated offer from player ignored");
        return;
    }
    let Some(signaling) = relay.signaling.lock().clone() else {
        tracing::warn!(target = "strait::relay", peer, "offer without a signaling channel dropped");
        return;
    };
    let id = relay.next_id.fetch_add(1, Ordering::Relaxed);
    let session = match relay.endpoints.build(id, false, TrackRole::Send) {
        Ok(session) => session,
        Err(err) => {
            relay.report(err);
            return;
        }
    };
    relay.wire_endpoint(id, &session);
    let endpoint = Endpoint {
        id,
        peer: Some(peer),
        session: session.clone(),
    };
    if let Err(err) = relay.register_endpoint(endpoint) {
        session.shutdown();
        relay.report(err);
        return;
    }

    match relay.synchronize(Some(id), offer.clone(), true) {
        Ok(_) => {
            if let Err(err) = session.attach(Arc::new(StampedSink::new(signaling, peer))) {
                tracing::warn!(target = "strait::relay", endpoint = id, error = %err, "endpoint could not attach signaling");
            }
            session.handle_signaling_event(SignalingEvent::Envelope(offer));
        }
        Err(err) => {
            relay.destroy_endpoint(id, false);
            relay.report(err);
        }
    }
}

fn provider_signaling(relay: &Arc<RelayInner>, value: Value) {
    match relay.endpoint_for(&value) {
        Some((_, session)) => session.handle_signaling_event(SignalingEvent::Envelope(value)),
        None => tracing::debug!(
            target = "strait::relay",
            kind = envelope_type(&value).unwrap_or("?"),
            id = ?endpoint_id(&value),
            "internal signaling envelope without endpoint ignored"
        ),
    }
}

/// The seeker announced endpoint `id`: open the internal session for it.
fn provider_offer(relay: &Arc<RelayInner>, request: Value) {
    let Some(id) = endpoint_id(&request).and_then(|id| u32::try_from(id).ok()) else {
        relay.reply_error(&request, "offer without a valid endpoint id");
        return;
    };
    if relay.routing.lock().contains(id) {
        relay.reply_error(&request, RelayError::DuplicateEndpoint(id).to_string());
        return;
    }
    let Some(signaling) = relay.signaling.lock().clone() else {
        relay.reply_error(&request, "provider has no internal signaling channel");
        return;
    };
    let session = match relay.endpoints.build(id, true, TrackRole::Receive) {
        Ok(session) => session,
        Err(err) => {
            relay.reply_error(&request, err.to_string());
            return;
        }
    };
    relay.wire_endpoint(id, &session);
    let endpoint = Endpoint {
        id,
        peer: None,
        session: session.clone(),
    };
    if let Err(err) = relay.register_endpoint(endpoint) {
        session.shutdown();
        relay.reply_error(&request, err.to_string());
        return;
    }
    if let Err(err) = session.attach(Arc::new(StampedSink::new(signaling, i64::from(id)))) {
        tracing::warn!(target = "strait::relay", endpoint = id, error = %err, "endpoint could not attach signaling");
    }
    relay.reply(&request, json!({"type": "ok"}));
}
