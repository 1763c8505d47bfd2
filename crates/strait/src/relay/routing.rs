use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use strait_proto::{Codec, stamp_endpoint_id};

use crate::config::SessionConfig;
use crate::error::{RelayError, SignalingError};
use crate::session::{PeerSession, TrackRole, TransportFactory};
use crate::signaling::EnvelopeSink;

/// Builds the peer session behind each bridged endpoint.
#[derive(Clone)]
pub struct EndpointFactory {
    pub session: SessionConfig,
    pub transport: Arc<dyn TransportFactory>,
    /// Video codec negotiated on every endpoint's media track; `None` leaves
    /// endpoints data-channel only.
    pub codec: Option<Codec>,
}

impl EndpointFactory {
    pub fn new(transport: Arc<dyn TransportFactory>) -> Self {
        Self {
            session: SessionConfig::default(),
            transport,
            codec: None,
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub(crate) fn build(
        &self,
        id: u32,
        offering: bool,
        track: TrackRole,
    ) -> Result<PeerSession, RelayError> {
        let config = SessionConfig {
            offering,
            ..self.session.clone()
        };
        let session =
            PeerSession::with_factory(format!("endpoint-{id}"), config, self.transport.as_ref())?;
        if let Some(codec) = self.codec {
            if let Err(err) = session.open_media_track(track, codec) {
                session.shutdown();
                return Err(err.into());
            }
        }
        Ok(session)
    }
}

impl std::fmt::Debug for EndpointFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointFactory")
            .field("session", &self.session)
            .field("codec", &self.codec)
            .finish()
    }
}

/// Signaling sink that writes an endpoint id into every envelope.
///
/// Many endpoints share one signaling channel, so closing a stamped sink
/// leaves the channel open.
pub struct StampedSink {
    inner: Arc<dyn EnvelopeSink>,
    id: i64,
}

impl StampedSink {
    pub fn new(inner: Arc<dyn EnvelopeSink>, id: i64) -> Self {
        Self { inner, id }
    }
}

impl EnvelopeSink for StampedSink {
    fn send_envelope(&self, mut envelope: Value) -> Result<(), SignalingError> {
        stamp_endpoint_id(&mut envelope, self.id);
        self.inner.send_envelope(envelope)
    }
}

pub(crate) struct Endpoint {
    pub id: u32,
    /// Signaling id of the remote party on the seeker side.
    pub peer: Option<i64>,
    pub session: PeerSession,
}

/// Endpoint table of one relay.
///
/// Lock order: the relay's routing mutex is taken before the pending-call
/// table, and neither is held across socket I/O or a session call.
#[derive(Default)]
pub(crate) struct RoutingTable {
    endpoints: HashMap<u32, Endpoint>,
    by_peer: HashMap<i64, u32>,
}

impl RoutingTable {
    pub fn insert(&mut self, endpoint: Endpoint) -> Result<(), RelayError> {
        if self.endpoints.contains_key(&endpoint.id) {
            return Err(RelayError::DuplicateEndpoint(endpoint.id));
        }
        if let Some(peer) = endpoint.peer {
            self.by_peer.insert(peer, endpoint.id);
        }
        self.endpoints.insert(endpoint.id, endpoint);
        Ok(())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.endpoints.contains_key(&id)
    }

    pub fn session(&self, id: u32) -> Option<PeerSession> {
        self.endpoints.get(&id).map(|endpoint| endpoint.session.clone())
    }

    pub fn peer(&self, id: u32) -> Option<i64> {
        self.endpoints.get(&id).and_then(|endpoint| endpoint.peer)
    }

    pub fn by_peer(&self, peer: i64) -> Option<u32> {
        self.by_peer.get(&peer).copied()
    }

    pub fn remove(&mut self, id: u32) -> Option<Endpoint> {
        let endpoint = self.endpoints.remove(&id)?;
        if let Some(peer) = endpoint.peer {
            self.by_peer.remove(&peer);
        }
        Some(endpoint)
    }

    pub fn drain(&mut self) -> Vec<Endpoint> {
        self.by_peer.clear();
        self.endpoints.drain().map(|(_, endpoint)| endpoint).collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.endpoints.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockTransport, MockTransportFactory};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder(Mutex<Vec<Value>>);

    impl EnvelopeSink for Recorder {
        fn send_envelope(&self, envelope: Value) -> Result<(), SignalingError> {
            self.0.lock().push(envelope);
            Ok(())
        }
    }

    fn endpoint(id: u32, peer: Option<i64>) -> Endpoint {
        let session = PeerSession::new(
            format!("endpoint-{id}"),
            SessionConfig::default(),
            Arc::new(MockTransport::new()),
        )
        .unwrap();
        Endpoint { id, peer, session }
    }

    #[test]
    fn stamped_sink_overwrites_the_id() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sink = StampedSink::new(recorder.clone(), 7);
        sink.send_envelope(json!({"type": "answer", "sdp": "x", "id": 2}))
            .unwrap();
        assert_eq!(recorder.0.lock()[0]["id"], 7);
    }

    #[test]
    fn table_tracks_peers_and_rejects_duplicates() {
        let mut table = RoutingTable::default();
        table.insert(endpoint(1, Some(40))).unwrap();
        table.insert(endpoint(2, None)).unwrap();
        let duplicate = endpoint(1, None);
        let duplicate_session = duplicate.session.clone();
        assert!(matches!(
            table.insert(duplicate),
            Err(RelayError::DuplicateEndpoint(1))
        ));
        duplicate_session.shutdown();

        assert_eq!(table.by_peer(40), Some(1));
        assert_eq!(table.peer(1), Some(40));
        assert_eq!(table.ids(), vec![1, 2]);

        let removed = table.remove(1).unwrap();
        removed.session.shutdown();
        assert_eq!(table.by_peer(40), None);
        assert!(!table.contains(1));
        for endpoint in table.drain() {
            endpoint.session.shutdown();
        }
        assert!(table.ids().is_empty());
    }

    #[test]
    fn factory_opens_the_media_track() {
        let transports = Arc::new(MockTransportFactory::new());
        let factory = EndpointFactory::new(transports.clone()).with_codec(Codec::H264);
        let session = factory.build(3, true, TrackRole::Receive).unwrap();
        assert!(session.is_offering());
        assert_eq!(session.label(), "endpoint-3");
        assert_eq!(transports.created().len(), 1);
        session.shutdown();
    }
}
