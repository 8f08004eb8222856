use crate::error::{IceError, NegotiationError};
use crate::media::LocalTrack;
use crate::peer::types::{
    ConnectionState, IceCandidate, IceConnectionState, ReplaceOutcome, SdpKind,
    ServerConfig, SessionDescription, TrackKind, TransportEvent,
};
use crate::telemetry::StatsSnapshot;
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Куда транспорт отдаёт свои события
pub type TransportEvents = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Одно peer-to-peer соединение с собеседником.
///
/// Методы вызываются строго последовательно (одна очередь операций на сессию).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn add_tracks(&self, tracks: &[Arc<LocalTrack>]) -> Result<(), NegotiationError>;

    /// Создаёт offer. Локальным описанием он становится только вместе с
    /// применением answer собеседника
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;

    /// Создаёт answer на применённый offer и устанавливает его локальным описанием
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// `rollback` отбрасывает наш offer, на который ещё нет answer
    async fn set_remote_description(
        &self,
        description: SessionDescription,
        rollback: bool,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), IceError>;

    /// Подменяет трек на исходящем видео отправителе без пересогласования
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<ReplaceOutcome, NegotiationError>;

    async fn stats(&self) -> Result<StatsSnapshot, String>;

    /// Входящий трек собеседника по идентификатору
    fn remote_track(&self, _track_id: &str) -> Option<Arc<TrackRemote>> {
        None
    }

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, NegotiationError>;
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// ServerConfig -> RTCIceServer
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[derive(Default)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, NegotiationError> {
        let transport = RtcTransport::new(ice_servers, events).await?;
        Ok(Arc::new(transport))
    }
}

/// Транспорт на webrtc-rs.
///
/// webrtc-rs не умеет откатывать локальный offer (`RTCSdpType::Rollback`),
/// поэтому свой offer применяется к соединению только вместе с answer.
/// До этого соединение остаётся в `stable` и может принять встречный offer.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    unanswered_offer: Mutex<Option<String>>,
    remote_tracks: Arc<Mutex<HashMap<String, Arc<TrackRemote>>>>,
}

impl RtcTransport {
    pub async fn new(
        ice_servers: &[ServerConfig],
        events: TransportEvents,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(ice_servers))
                .await
                .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?,
        );
        let remote_tracks = Arc::new(Mutex::new(HashMap::new()));

        let on_candidate = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => on_candidate(TransportEvent::LocalCandidate(Some(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }))),
                    Err(e) => warn!("Failed to serialize local candidate: {e}"),
                },
                // cand == None означает конец сбора
                None => on_candidate(TransportEvent::LocalCandidate(None)),
            }
            Box::pin(async {})
        }));

        let on_state = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {:?}", st);
            let state = match st {
                RTCPeerConnectionState::New => Some(ConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                on_state(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let on_ice = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            let state = match st {
                RTCIceConnectionState::New => Some(IceConnectionState::New),
                RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                on_ice(TransportEvent::IceConnectionState(state));
            }
            Box::pin(async {})
        }));

        let on_track = events;
        let tracks = remote_tracks.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let track_id = track.id();
            let stream_id = track.stream_id();
            if let Ok(mut map) = tracks.lock() {
                map.insert(track_id.clone(), track);
            }
            on_track(TransportEvent::RemoteTrack {
                stream_id,
                track_id,
                kind,
            });
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            unanswered_offer: Mutex::new(None),
            remote_tracks,
        })
    }

    fn take_unanswered_offer(&self) -> Option<String> {
        self.unanswered_offer.lock().ok()?.take()
    }

    /// Если своих треков какого-то типа нет, добавляем recvonly трансивер,
    /// чтобы offer всё равно просил аудио и видео собеседника
    async fn ensure_receivers(&self) -> Result<(), NegotiationError> {
        let transceivers = self.pc.get_transceivers().await;
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            if transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| negotiation_error(e, NegotiationError::CreateOffer))?;
        }
        Ok(())
    }
}

/// Закрытое соединение отличаем от прочих ошибок webrtc-rs
fn negotiation_error(e: webrtc::Error, wrap: fn(String) -> NegotiationError) -> NegotiationError {
    match e {
        webrtc::Error::ErrConnectionClosed => NegotiationError::Closed,
        other => wrap(other.to_string()),
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| NegotiationError::SetRemoteDescription(e.to_string()))
}

#[async_trait]
impl Transport for RtcTransport {
    async fn add_tracks(&self, tracks: &[Arc<LocalTrack>]) -> Result<(), NegotiationError> {
        for track in tracks {
            let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            self.pc
                .add_track(rtc)
                .await
                .map_err(|e| negotiation_error(e, NegotiationError::AttachTrack))?;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.ensure_receivers().await?;
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| negotiation_error(e, NegotiationError::CreateOffer))?;
        if let Ok(mut slot) = self.unanswered_offer.lock() {
            *slot = Some(offer.sdp.clone());
        }
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error(e, NegotiationError::CreateAnswer))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| negotiation_error(e, NegotiationError::SetLocalDescription))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
        rollback: bool,
    ) -> Result<(), NegotiationError> {
        match description.kind {
            SdpKind::Offer => {
                // встречный offer: наш неотвеченный offer больше не нужен
                if self.take_unanswered_offer().is_some() {
                    debug!("Discarding unanswered local offer (rollback: {rollback})");
                }
            }
            SdpKind::Answer => {
                if let Some(sdp) = self.take_unanswered_offer() {
                    let offer = RTCSessionDescription::offer(sdp)
                        .map_err(|e| NegotiationError::SetLocalDescription(e.to_string()))?;
                    self.pc
                        .set_local_description(offer)
                        .await
                        .map_err(|e| negotiation_error(e, NegotiationError::SetLocalDescription))?;
                }
            }
        }
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| negotiation_error(e, NegotiationError::SetRemoteDescription))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), IceError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| IceError(e.to_string()))
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<ReplaceOutcome, NegotiationError> {
        for sender in self.pc.get_senders().await {
            let is_video = match sender.track().await {
                Some(current) => current.kind() == RTPCodecType::Video,
                None => false,
            };
            if !is_video {
                continue;
            }
            let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            sender
                .replace_track(Some(rtc))
                .await
                .map_err(|e| negotiation_error(e, NegotiationError::AttachTrack))?;
            return Ok(ReplaceOutcome::Replaced);
        }
        Ok(ReplaceOutcome::NoSender)
    }

    async fn stats(&self) -> Result<StatsSnapshot, String> {
        let report = self.pc.get_stats().await;
        let mut snapshot = StatsSnapshot::default();
        for (_, v) in report.reports {
            if let StatsReportType::CandidatePair(pair) = v {
                // RTT берём только у выбранной пары
                if pair.nominated {
                    snapshot.round_trip_time = Some(pair.current_round_trip_time);
                }
            }
        }
        Ok(snapshot)
    }

    fn remote_track(&self, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.remote_tracks.lock().ok()?.get(track_id).cloned()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {e}");
        }
        self.take_unanswered_offer();
        if let Ok(mut map) = self.remote_tracks.lock() {
            map.clear();
        }
    }
}
