use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use strait_proto::{ChannelMessage, Codec};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use super::transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescriptor, TrackRole, TransportEvent,
    TransportEventHandler, TransportFactory, TransportState,
};
use crate::config::SessionConfig;
use crate::error::ConnectionError;
use crate::runtime::{block_on, spawn_on_global};

type SharedHandler = Arc<Mutex<Option<TransportEventHandler>>>;

fn emit(handler: &SharedHandler, event: TransportEvent) {
    let handler = handler.lock().clone();
    if let Some(handler) = handler {
        handler(event);
    }
}

fn build_api(setting: SettingEngine) -> Result<API, ConnectionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_transport_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_transport_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_transport_error<E: std::fmt::Display>(err: E) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}

enum Media {
    Send(Arc<TrackLocalStaticRTP>),
    Receive,
}

/// [`PeerTransport`] over a webrtc-rs peer connection.
pub struct RtcPeerTransport {
    label: String,
    max_message_size: usize,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    handler: SharedHandler,
    media: Mutex<Option<Media>>,
    remote_ssrc: Arc<AtomicU32>,
}

impl RtcPeerTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, ConnectionError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = block_on(api.new_peer_connection(rtc_config)).map_err(to_transport_error)?;

        let transport = Self {
            label: config.data_channel_label.clone(),
            max_message_size: config.effective_message_size(),
            pc: Arc::new(pc),
            channel: Arc::new(Mutex::new(None)),
            handler: Arc::new(Mutex::new(None)),
            media: Mutex::new(None),
            remote_ssrc: Arc::new(AtomicU32::new(0)),
        };
        transport.install_callbacks();
        Ok(transport)
    }

    fn install_callbacks(&self) {
        let handler = Arc::clone(&self.handler);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        tracing::trace!(target = "strait::session::rtc", "ice gathering finished");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => emit(
                            &handler,
                            TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                mid: init.sdp_mid.unwrap_or_default(),
                                mline_index: init.sdp_mline_index,
                            }),
                        ),
                        Err(err) => tracing::warn!(
                            target = "strait::session::rtc",
                            error = %err,
                            "failed to serialise local candidate"
                        ),
                    }
                })
            }));

        let handler = Arc::clone(&self.handler);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    tracing::debug!(target = "strait::session::rtc", ?state, "peer connection state changed");
                    let mapped = match state {
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => TransportState::New,
                    };
                    emit(&handler, TransportEvent::StateChanged(mapped));
                })
            }));

        let handler = Arc::clone(&self.handler);
        let slot = Arc::clone(&self.channel);
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let handler = Arc::clone(&handler);
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    tracing::debug!(
                        target = "strait::session::rtc",
                        label = channel.label(),
                        "remote data channel announced"
                    );
                    wire_channel(&channel, &handler);
                    *slot.lock() = Some(channel);
                })
            }));

        let handler = Arc::clone(&self.handler);
        let ssrc = Arc::clone(&self.remote_ssrc);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let handler = Arc::clone(&handler);
            let ssrc = Arc::clone(&ssrc);
            Box::pin(async move {
                ssrc.store(track.ssrc(), Ordering::SeqCst);
                tracing::debug!(
                    target = "strait::session::rtc",
                    mime = %track.codec().capability.mime_type,
                    ssrc = track.ssrc(),
                    "remote track started"
                );
                spawn_on_global(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => match packet.marshal() {
                                Ok(raw) => emit(&handler, TransportEvent::RtpPacket(raw)),
                                Err(err) => tracing::warn!(
                                    target = "strait::session::rtc",
                                    error = %err,
                                    "failed to re-marshal rtp packet"
                                ),
                            },
                            Err(err) => {
                                tracing::debug!(
                                    target = "strait::session::rtc",
                                    error = %err,
                                    "remote track ended"
                                );
                                break;
                            }
                        }
                    }
                });
            })
        }));
    }

    fn ensure_channel(&self) -> Result<(), ConnectionError> {
        if self.channel.lock().is_some() {
            return Ok(());
        }
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = block_on(self.pc.create_data_channel(&self.label, Some(init)))
            .map_err(to_transport_error)?;
        wire_channel(&channel, &self.handler);
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    /// Sets `description` locally and resolves once ICE gathering is done, so
    /// the returned SDP carries every candidate.
    async fn finish_local(
        pc: &Arc<RTCPeerConnection>,
        description: RTCSessionDescription,
    ) -> Result<String, ConnectionError> {
        let mut gather = pc.gathering_complete_promise().await;
        pc.set_local_description(description)
            .await
            .map_err(to_transport_error)?;
        let _ = gather.recv().await;
        pc.local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| ConnectionError::Transport("failed to obtain local description".into()))
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, handler: &SharedHandler) {
    let on_open = Arc::clone(handler);
    channel.on_open(Box::new(move || {
        let handler = Arc::clone(&on_open);
        Box::pin(async move {
            tracing::debug!(target = "strait::session::rtc", "data channel open");
            emit(&handler, TransportEvent::ChannelOpen);
        })
    }));

    let on_message = Arc::clone(handler);
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let handler = Arc::clone(&on_message);
        Box::pin(async move {
            let message = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelMessage::Text(text),
                    Err(_) => ChannelMessage::Binary(msg.data),
                }
            } else {
                ChannelMessage::Binary(msg.data)
            };
            tracing::trace!(target = "strait::session::rtc", len = message.len(), "received message");
            emit(&handler, TransportEvent::ChannelMessage(message));
        })
    }));

    let on_close = Arc::clone(handler);
    channel.on_close(Box::new(move || {
        let handler = Arc::clone(&on_close);
        Box::pin(async move {
            tracing::debug!(target = "strait::session::rtc", "data channel closed");
            emit(&handler, TransportEvent::ChannelClosed);
        })
    }));

    channel.on_error(Box::new(move |err| {
        Box::pin(async move {
            tracing::warn!(target = "strait::session::rtc", error = %err, "data channel error");
        })
    }));
}

impl PeerTransport for RtcPeerTransport {
    fn subscribe(&self, handler: TransportEventHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn create_offer(&self) -> Result<SessionDescriptor, ConnectionError> {
        self.ensure_channel()?;
        let pc = Arc::clone(&self.pc);
        let sdp = block_on(async move {
            let offer = pc.create_offer(None).await.map_err(to_transport_error)?;
            Self::finish_local(&pc, offer).await
        })?;
        Ok(SessionDescriptor::offer(sdp))
    }

    fn create_answer(&self) -> Result<SessionDescriptor, ConnectionError> {
        let pc = Arc::clone(&self.pc);
        let sdp = block_on(async move {
            let answer = pc.create_answer(None).await.map_err(to_transport_error)?;
            Self::finish_local(&pc, answer).await
        })?;
        Ok(SessionDescriptor::answer(sdp))
    }

    fn apply_remote(&self, description: &SessionDescriptor) -> Result<(), ConnectionError> {
        let sdp = description.sdp().to_string();
        let remote = match description.kind() {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|err| ConnectionError::MalformedSdp(err.to_string()))?;
        block_on(self.pc.set_remote_description(remote)).map_err(to_transport_error)
    }

    fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: (!candidate.mid.is_empty()).then(|| candidate.mid.clone()),
            sdp_mline_index: candidate.mline_index,
            username_fragment: None,
        };
        block_on(self.pc.add_ice_candidate(init)).map_err(to_transport_error)
    }

    fn send(&self, message: ChannelMessage) -> Result<(), ConnectionError> {
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        let result = match message {
            ChannelMessage::Text(text) => block_on(channel.send_text(text)),
            ChannelMessage::Binary(bytes) => block_on(channel.send(&bytes)),
        };
        result.map(|_| ()).map_err(to_transport_error)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn open_media_track(&self, role: TrackRole, codec: Codec) -> Result<(), ConnectionError> {
        let mut media = self.media.lock();
        if media.is_some() {
            return Err(ConnectionError::Transport("media track already open".into()));
        }
        match role {
            TrackRole::Send => {
                let track = Arc::new(TrackLocalStaticRTP::new(
                    RTCRtpCodecCapability {
                        mime_type: codec.mime_type().to_owned(),
                        clock_rate: codec.clock_rate(),
                        ..Default::default()
                    },
                    "video".to_owned(),
                    format!("{}-video", self.label),
                ));
                let sender = block_on(
                    self.pc
                        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>),
                )
                .map_err(to_transport_error)?;
                // Incoming RTCP has to be read for the interceptors to run.
                spawn_on_global(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
                *media = Some(Media::Send(track));
            }
            TrackRole::Receive => {
                block_on(self.pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                ))
                .map_err(to_transport_error)?;
                *media = Some(Media::Receive);
            }
        }
        tracing::debug!(target = "strait::session::rtc", ?role, ?codec, "media track opened");
        Ok(())
    }

    fn send_rtp(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        let track = match &*self.media.lock() {
            Some(Media::Send(track)) => Arc::clone(track),
            _ => return Err(ConnectionError::NoMediaTrack),
        };
        block_on(track.write(packet))
            .map(|_| ())
            .map_err(to_transport_error)
    }

    fn request_keyframe(&self) -> Result<(), ConnectionError> {
        if !matches!(&*self.media.lock(), Some(Media::Receive)) {
            return Err(ConnectionError::NoMediaTrack);
        }
        let media_ssrc = self.remote_ssrc.load(Ordering::SeqCst);
        if media_ssrc == 0 {
            return Err(ConnectionError::Transport("remote track not started".into()));
        }
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        block_on(self.pc.write_rtcp(&[Box::new(pli)]))
            .map(|_| ())
            .map_err(to_transport_error)
    }

    fn close(&self) {
        let channel = self.channel.lock().take();
        let pc = Arc::clone(&self.pc);
        let result = block_on(async move {
            if let Some(channel) = channel {
                let _ = channel.close().await;
            }
            pc.close().await
        });
        if let Err(err) = result {
            tracing::debug!(target = "strait::session::rtc", error = %err, "peer connection close failed");
        }
    }
}

/// Builds a fresh [`RtcPeerTransport`] per session.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

impl TransportFactory for RtcTransportFactory {
    fn create(&self, config: &SessionConfig) -> Result<Arc<dyn PeerTransport>, ConnectionError> {
        Ok(Arc::new(RtcPeerTransport::new(config)?))
    }
}
