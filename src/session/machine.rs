//! Состояние звонка как чистая функция переходов.
//!
//! `Session::step` принимает одно событие и возвращает список эффектов.
//! Ввод-вывод (транспорт, сигналинг, устройства, таймеры) выполняет
//! контроллер; завершения асинхронных операций возвращаются сюда обычными
//! событиями.

use crate::config::CallConfig;
use crate::error::{
    ErrorKind, IceError, MediaError, NegotiationError, ScreenShareError, SignalingError,
};
use crate::logger::LogLevel;
use crate::media::{LocalTrack, LocalTracks, MediaConstraints, TrackSet};
use crate::negotiation::{CallRole, Negotiator, OfferDisposition, OfferRequest, OfferTicket};
use crate::peer::ice::{analyze_candidates, PendingCandidates, RestartGuard};
use crate::peer::types::{
    ConnectionState, IceCandidate, IceConnectionState, RemoteStream, ReplaceOutcome, SdpKind,
    SessionDescription, TrackKind, TransportEvent,
};
use crate::signaling::{Inbound, NegotiationMessage, RoomEvent};
use crate::telemetry::{QualitySample, Sampler, StatsSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Команды пользователя
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleAudio,
    ToggleVideo,
    ToggleScreenShare,
    EndCall,
}

#[derive(Debug)]
pub enum Event {
    Start,
    MediaReady(Result<LocalTracks, MediaError>),
    TracksAttached(Result<(), NegotiationError>),
    SignalingConnected { local_id: String },
    SignalingDisconnected { reason: String },
    SignalingFailed(SignalingError),
    Signal(Inbound),
    OfferTimer { generation: u64 },
    OfferCreated {
        seq: u64,
        result: Result<SessionDescription, NegotiationError>,
    },
    RemoteDescriptionApplied {
        kind: SdpKind,
        result: Result<(), NegotiationError>,
    },
    AnswerCreated(Result<SessionDescription, NegotiationError>),
    CandidateApplied(Result<(), IceError>),
    Transport(TransportEvent),
    Command(Command),
    ScreenReady(Result<Arc<LocalTrack>, ScreenShareError>),
    ScreenEnded { track_id: String },
    VideoReplaced(Result<ReplaceOutcome, NegotiationError>),
    StatsTick,
    StatsSampled {
        episode: u64,
        result: Result<StatsSnapshot, String>,
    },
    IdentityNoticeExpired { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub audio: bool,
    pub video: bool,
    pub screen_sharing: bool,
}

/// Что сообщается наблюдателю (UI)
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(ConnectionState),
    RemoteStream(RemoteStream),
    RemoteStreamCleared,
    Quality(Option<QualitySample>),
    Error { kind: ErrorKind, message: String },
    ErrorCleared,
    RemoteIdentity { visible: bool },
    RemoteMedia { audio: bool, video: bool },
    RemoteScreenShare { is_sharing: bool },
    LocalMedia(LocalMediaState),
}

#[derive(Debug)]
pub enum Effect {
    AcquireMedia(MediaConstraints),
    AttachTracks(Vec<Arc<LocalTrack>>),
    AcquireScreen,
    ReleaseTrack(Arc<LocalTrack>),
    SetTrackEnabled { track: Arc<LocalTrack>, enabled: bool },
    WatchTrackEnded(Arc<LocalTrack>),
    ReplaceVideoTrack(Arc<LocalTrack>),
    Send(NegotiationMessage),
    ScheduleOffer { generation: u64, delay: Duration },
    CreateOffer(OfferTicket),
    ApplyRemoteDescription {
        description: SessionDescription,
        rollback: bool,
    },
    CreateAnswer,
    ApplyCandidate(IceCandidate),
    StartSampling { every: Duration },
    StopSampling,
    SampleStats { episode: u64 },
    ScheduleIdentityHide { generation: u64, after: Duration },
    CloseTransport,
    /// Последний эффект сессии: отменить таймеры и отписаться
    Shutdown,
    Notify(Notification),
    Log(LogLevel, String),
}

#[derive(Debug, Default)]
struct Effects(Vec<Effect>);

impl Effects {
    fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }

    fn log(&mut self, level: LogLevel, msg: impl Into<String>) {
        self.0.push(Effect::Log(level, msg.into()));
    }

    fn info(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Info, msg);
    }

    fn success(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Success, msg);
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Warning, msg);
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Error, msg);
    }

    fn notify(&mut self, notification: Notification) {
        self.0.push(Effect::Notify(notification));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScreenShare {
    Off,
    Starting,
    On,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    offer_delay: Duration,
    stats_interval: Duration,
    identity_notice: Duration,
}

#[derive(Debug)]
pub struct Session {
    room_id: String,
    constraints: MediaConstraints,
    timing: Timing,
    started: bool,
    state: ConnectionState,
    ice_state: IceConnectionState,
    negotiator: Negotiator,
    pending: PendingCandidates,
    restart: RestartGuard,
    sampler: Sampler,
    tracks: Option<TrackSet>,
    audio_enabled: bool,
    video_enabled: bool,
    screen: ScreenShare,
    signaling_up: bool,
    joined: bool,
    remote_stream: Option<RemoteStream>,
    remote_sharing: bool,
    identity_generation: u64,
    local_candidates: Vec<IceCandidate>,
    error: Option<(ErrorKind, String)>,
}

impl Session {
    pub fn new(room_id: impl Into<String>, config: &CallConfig) -> Self {
        Self {
            room_id: room_id.into(),
            constraints: config.media.clone(),
            timing: Timing {
                offer_delay: config.offer_delay(),
                stats_interval: config.stats_interval(),
                identity_notice: config.identity_notice(),
            },
            started: false,
            state: ConnectionState::New,
            ice_state: IceConnectionState::New,
            negotiator: Negotiator::new(),
            pending: PendingCandidates::new(),
            restart: RestartGuard::default(),
            sampler: Sampler::default(),
            tracks: None,
            audio_enabled: true,
            video_enabled: true,
            screen: ScreenShare::Off,
            signaling_up: false,
            joined: false,
            remote_stream: None,
            remote_sharing: false,
            identity_generation: 0,
            local_candidates: Vec::new(),
            error: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice_state
    }

    pub fn role(&self) -> CallRole {
        self.negotiator.role()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn tracks(&self) -> Option<&TrackSet> {
        self.tracks.as_ref()
    }

    pub fn local_media(&self) -> LocalMediaState {
        LocalMediaState {
            audio: self.audio_enabled,
            video: self.video_enabled,
            screen_sharing: self.screen == ScreenShare::On,
        }
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn is_remote_sharing(&self) -> bool {
        self.remote_sharing
    }

    pub fn pending_candidates(&self) -> &PendingCandidates {
        &self.pending
    }

    pub fn ice_restarts(&self) -> u32 {
        self.restart.restarts()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_active()
    }

    pub fn error(&self) -> Option<&(ErrorKind, String)> {
        self.error.as_ref()
    }

    pub fn step(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Effects::default();

        if self.is_closed() {
            // после закрытия всё — no-op; только не оставляем захват устройств висеть
            match event {
                Event::MediaReady(Ok(tracks)) => {
                    fx.push(Effect::ReleaseTrack(tracks.audio));
                    fx.push(Effect::ReleaseTrack(tracks.video));
                }
                Event::ScreenReady(Ok(track)) => fx.push(Effect::ReleaseTrack(track)),
                _ => {}
            }
            return fx.0;
        }

        match event {
            Event::Start => self.start(&mut fx),
            Event::MediaReady(result) => self.media_ready(&mut fx, result),
            Event::TracksAttached(Ok(())) => {}
            Event::TracksAttached(Err(e)) => self.negotiation_failed(&mut fx, e),
            Event::SignalingConnected { local_id } => {
                fx.info(format!("Connected to signaling server as {local_id}"));
                self.negotiator.set_local_id(local_id);
                self.signaling_up = true;
                if matches!(self.error, Some((ErrorKind::Signaling, _))) {
                    self.clear_error(&mut fx);
                }
                self.join_room(&mut fx);
            }
            Event::SignalingDisconnected { reason } => {
                self.signaling_up = false;
                self.joined = false;
                fx.error(format!("Disconnected from signaling server: {reason}"));
                self.report_error(&mut fx, ErrorKind::Signaling, "Connection to the signaling server was lost");
            }
            Event::SignalingFailed(e) => {
                fx.error(e.to_string());
                self.report_error(&mut fx, ErrorKind::Signaling, e.to_string());
            }
            Event::Signal(inbound) => self.signal(&mut fx, inbound),
            Event::OfferTimer { generation } => {
                if let Some(ticket) = self.negotiator.offer_timer_fired(generation) {
                    fx.info("Initiating call as the caller...");
                    fx.push(Effect::CreateOffer(ticket));
                }
            }
            Event::OfferCreated { seq, result } => self.offer_created(&mut fx, seq, result),
            Event::RemoteDescriptionApplied { kind, result } => {
                self.remote_description_applied(&mut fx, kind, result)
            }
            Event::AnswerCreated(Ok(answer)) => {
                fx.info("Sending answer to remote peer");
                fx.push(Effect::Send(NegotiationMessage::Answer(answer)));
                if let Some(ticket) = self.negotiator.answer_sent() {
                    self.issue_offer(&mut fx, ticket);
                }
            }
            Event::AnswerCreated(Err(e)) => self.negotiation_failed(&mut fx, e),
            Event::CandidateApplied(Ok(())) => fx.info("ICE candidate added successfully"),
            Event::CandidateApplied(Err(e)) => fx.warn(e.to_string()),
            Event::Transport(event) => self.transport(&mut fx, event),
            Event::Command(command) => self.command(&mut fx, command),
            Event::ScreenReady(result) => self.screen_ready(&mut fx, result),
            Event::ScreenEnded { track_id } => {
                let active = self
                    .tracks
                    .as_ref()
                    .map(|t| t.active_video().id() == track_id)
                    .unwrap_or(false);
                if self.screen == ScreenShare::On && active {
                    fx.info("Screen sharing ended by the capture source");
                    self.stop_screen_share(&mut fx);
                }
            }
            Event::VideoReplaced(result) => self.video_replaced(&mut fx, result),
            Event::StatsTick => {
                if self.state == ConnectionState::Connected {
                    if let Some(episode) = self.sampler.tick() {
                        fx.push(Effect::SampleStats { episode });
                    }
                }
            }
            Event::StatsSampled { episode, result } => match self.sampler.complete(episode, result) {
                Some(Ok(sample)) => fx.notify(Notification::Quality(Some(sample))),
                Some(Err(e)) => fx.warn(format!("Failed to read connection stats: {e}")),
                None => {}
            },
            Event::IdentityNoticeExpired { generation } => {
                if generation == self.identity_generation {
                    fx.notify(Notification::RemoteIdentity { visible: false });
                }
            }
        }

        fx.0
    }

    fn start(&mut self, fx: &mut Effects) {
        if self.started {
            return;
        }
        self.started = true;
        fx.info("Requesting camera and microphone access...");
        fx.push(Effect::AcquireMedia(self.constraints.clone()));
    }

    fn media_ready(&mut self, fx: &mut Effects, result: Result<LocalTracks, MediaError>) {
        match result {
            Ok(tracks) => {
                if self.tracks.is_some() {
                    fx.push(Effect::ReleaseTrack(tracks.audio));
                    fx.push(Effect::ReleaseTrack(tracks.video));
                    return;
                }
                fx.success("Local media stream initialized successfully");
                let set = TrackSet::new(tracks);
                let attach = vec![set.audio().clone(), set.camera().clone()];
                for track in &attach {
                    fx.info(format!("Adding {:?} track to peer connection", track.kind()));
                }
                fx.push(Effect::AttachTracks(attach));
                self.tracks = Some(set);
                self.audio_enabled = true;
                self.video_enabled = true;
                fx.notify(Notification::LocalMedia(self.local_media()));
                self.join_room(fx);
            }
            Err(e) => {
                fx.error(format!("WebRTC initialization failed: {}", e.message));
                self.report_error(fx, ErrorKind::Media, format!("Could not access camera or microphone: {}", e.message));
                self.close(fx);
            }
        }
    }

    /// `join-room` уходит, когда готовы и медиа, и сигнальный канал
    fn join_room(&mut self, fx: &mut Effects) {
        if !self.signaling_up || self.tracks.is_none() || self.joined {
            return;
        }
        self.joined = true;
        fx.info(format!("Joining room {}", self.room_id));
        fx.push(Effect::Send(NegotiationMessage::JoinRoom));
    }

    fn signal(&mut self, fx: &mut Effects, inbound: Inbound) {
        if let Some(room) = &inbound.room_id {
            if room != &self.room_id {
                fx.warn(format!("Ignoring message for another room: {room}"));
                return;
            }
        }
        let from = inbound.from.as_deref();

        match inbound.message {
            NegotiationMessage::RoomEvent(RoomEvent::Joined(user)) => {
                fx.info(format!("User joined: {user}"));
                if let Some(generation) = self.negotiator.peer_joined(&user) {
                    fx.push(Effect::ScheduleOffer {
                        generation,
                        delay: self.timing.offer_delay,
                    });
                }
            }
            NegotiationMessage::RoomEvent(RoomEvent::Left(user)) => {
                fx.info(format!("User left: {user}"));
                if self.negotiator.peer_left(&user) {
                    self.remote_sharing = false;
                    if self.remote_stream.take().is_some() {
                        fx.notify(Notification::RemoteStreamCleared);
                    }
                }
            }
            NegotiationMessage::Offer(description) => {
                fx.info(format!("Received offer from {}", from.unwrap_or("unknown peer")));
                match self.negotiator.remote_offer(from) {
                    OfferDisposition::Ignore => {
                        fx.warn("Offer collision: keeping our own offer");
                    }
                    OfferDisposition::Accept { rollback } => {
                        if rollback {
                            fx.warn("Offer collision: rolling back our offer to answer the remote one");
                        }
                        fx.push(Effect::ApplyRemoteDescription {
                            description,
                            rollback,
                        });
                    }
                }
            }
            NegotiationMessage::Answer(description) => {
                if self.negotiator.expects_answer() {
                    fx.info("Received answer");
                    fx.push(Effect::ApplyRemoteDescription {
                        description,
                        rollback: false,
                    });
                } else {
                    fx.warn("Ignoring answer without an outstanding offer");
                }
            }
            NegotiationMessage::IceCandidate(candidate) => match self.pending.offer(candidate) {
                Some(candidate) => fx.push(Effect::ApplyCandidate(candidate)),
                None => fx.info(format!(
                    "Remote description not set yet, buffering ICE candidate ({} pending)",
                    self.pending.len()
                )),
            },
            NegotiationMessage::MediaStateChange { audio, video } => {
                fx.info(format!("Remote media changed: audio={audio}, video={video}"));
                fx.notify(Notification::RemoteMedia { audio, video });
                self.show_identity(fx);
            }
            NegotiationMessage::ScreenShareChange { is_sharing } => {
                self.remote_sharing = is_sharing;
                fx.info(if is_sharing {
                    "Remote peer started screen sharing"
                } else {
                    "Remote peer stopped screen sharing"
                });
                fx.notify(Notification::RemoteScreenShare { is_sharing });
            }
            NegotiationMessage::JoinRoom | NegotiationMessage::LeaveRoom => {}
        }
    }

    fn request_offer(&mut self, fx: &mut Effects, request: OfferRequest) {
        match self.negotiator.request(request) {
            Some(ticket) => self.issue_offer(fx, ticket),
            None => fx.info("Offer already outstanding, renegotiation queued"),
        }
    }

    fn issue_offer(&mut self, fx: &mut Effects, ticket: OfferTicket) {
        fx.info(if ticket.ice_restart {
            "Creating ICE restart offer..."
        } else {
            "Creating offer..."
        });
        fx.push(Effect::CreateOffer(ticket));
    }

    fn offer_created(
        &mut self,
        fx: &mut Effects,
        seq: u64,
        result: Result<SessionDescription, NegotiationError>,
    ) {
        if !self.negotiator.is_current(seq) {
            fx.info("Discarding superseded local offer");
            return;
        }
        match result {
            Ok(offer) => {
                fx.info("Sending offer to remote peer");
                fx.push(Effect::Send(NegotiationMessage::Offer(offer)));
            }
            Err(e) => {
                let retry = self.negotiator.offer_failed(seq);
                self.negotiation_failed(fx, e);
                if let Some(ticket) = retry {
                    self.issue_offer(fx, ticket);
                }
            }
        }
    }

    fn remote_description_applied(
        &mut self,
        fx: &mut Effects,
        kind: SdpKind,
        result: Result<(), NegotiationError>,
    ) {
        if let Err(e) = result {
            self.negotiator.abandon();
            self.negotiation_failed(fx, e);
            return;
        }
        fx.info(match kind {
            SdpKind::Offer => "Remote offer applied",
            SdpKind::Answer => "Remote answer applied",
        });

        let buffered = self.pending.drain();
        if !buffered.is_empty() {
            fx.info(format!("Applying {} buffered ICE candidates", buffered.len()));
        }
        for candidate in buffered {
            fx.push(Effect::ApplyCandidate(candidate));
        }

        match kind {
            SdpKind::Offer => {
                fx.info("Creating answer...");
                fx.push(Effect::CreateAnswer);
            }
            SdpKind::Answer => {
                if let Some(ticket) = self.negotiator.answer_applied() {
                    self.issue_offer(fx, ticket);
                }
            }
        }
    }

    fn negotiation_failed(&mut self, fx: &mut Effects, error: NegotiationError) {
        fx.error(error.to_string());
        self.report_error(fx, ErrorKind::Negotiation, "Failed to connect");
        self.set_state(fx, ConnectionState::Failed);
    }

    fn transport(&mut self, fx: &mut Effects, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                fx.info(format!("{} candidate gathered", candidate.kind().label()));
                self.local_candidates.push(candidate.clone());
                fx.push(Effect::Send(NegotiationMessage::IceCandidate(candidate)));
            }
            TransportEvent::LocalCandidate(None) => {
                fx.info("ICE candidate gathering completed");
                fx.info(analyze_candidates(&self.local_candidates));
                self.local_candidates.clear();
            }
            TransportEvent::ConnectionState(ConnectionState::Closed) => {
                fx.info("Peer connection closed by transport");
                self.close(fx);
            }
            TransportEvent::ConnectionState(state) => {
                self.set_state(fx, state);
                if state == ConnectionState::Failed {
                    self.report_error(fx, ErrorKind::Connection, "Connection failed. Please try again.");
                }
            }
            TransportEvent::IceConnectionState(state) => {
                self.ice_state = state;
                fx.info(format!("ICE connection state: {state:?}"));
                if matches!(state, IceConnectionState::Connected | IceConnectionState::Completed) {
                    fx.success("ICE connection established");
                    if matches!(self.error, Some((ErrorKind::Ice, _))) {
                        self.clear_error(fx);
                    }
                }
                if self.restart.observe(state) {
                    fx.error("ICE connection failed, attempting restart...");
                    self.request_offer(fx, OfferRequest::restart());
                } else if state == IceConnectionState::Failed {
                    fx.warn("ICE restart already issued for this failure");
                    self.report_error(fx, ErrorKind::Ice, "ICE connection failed after restart");
                }
            }
            TransportEvent::RemoteTrack {
                stream_id,
                track_id,
                kind,
            } => self.remote_track(fx, stream_id, track_id, kind),
        }
    }

    fn remote_track(&mut self, fx: &mut Effects, stream_id: String, track_id: String, kind: TrackKind) {
        fx.info(format!("Received remote {kind:?} track"));
        if let Some(stream) = self.remote_stream.as_mut().filter(|s| s.id == stream_id) {
            if !stream.track_ids.contains(&track_id) {
                stream.track_ids.push(track_id);
            }
            fx.notify(Notification::RemoteStream(stream.clone()));
            return;
        }
        let stream = RemoteStream {
            id: stream_id,
            track_ids: vec![track_id],
        };
        fx.success("Received remote stream");
        fx.notify(Notification::RemoteStream(stream.clone()));
        self.remote_stream = Some(stream);
        self.show_identity(fx);
    }

    fn set_state(&mut self, fx: &mut Effects, state: ConnectionState) {
        if self.state == state {
            return;
        }
        let previous = self.state;
        self.state = state;
        fx.info(format!("Connection state: {}", state.as_str()));
        fx.notify(Notification::StateChanged(state));

        if previous == ConnectionState::Connected && self.sampler.stop() {
            fx.push(Effect::StopSampling);
            fx.notify(Notification::Quality(None));
        }

        match state {
            ConnectionState::Connected => {
                fx.success("WebRTC connection established");
                self.clear_error(fx);
                self.show_identity(fx);
                if self.sampler.start() {
                    fx.push(Effect::StartSampling {
                        every: self.timing.stats_interval,
                    });
                }
            }
            ConnectionState::Disconnected => fx.warn("WebRTC connection disconnected"),
            ConnectionState::Failed => fx.error("WebRTC connection failed"),
            _ => {}
        }
    }

    fn show_identity(&mut self, fx: &mut Effects) {
        self.identity_generation += 1;
        fx.notify(Notification::RemoteIdentity { visible: true });
        fx.push(Effect::ScheduleIdentityHide {
            generation: self.identity_generation,
            after: self.timing.identity_notice,
        });
    }

    fn report_error(&mut self, fx: &mut Effects, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        self.error = Some((kind, message.clone()));
        fx.notify(Notification::Error { kind, message });
    }

    fn clear_error(&mut self, fx: &mut Effects) {
        if self.error.take().is_some() {
            fx.notify(Notification::ErrorCleared);
        }
    }

    fn command(&mut self, fx: &mut Effects, command: Command) {
        match command {
            Command::ToggleAudio => {
                let Some(tracks) = &self.tracks else {
                    fx.warn("No local media to toggle");
                    return;
                };
                self.audio_enabled = !self.audio_enabled;
                fx.push(Effect::SetTrackEnabled {
                    track: tracks.audio().clone(),
                    enabled: self.audio_enabled,
                });
                fx.info(if self.audio_enabled { "Audio enabled" } else { "Audio muted" });
                self.broadcast_media_state(fx);
            }
            Command::ToggleVideo => {
                if self.screen != ScreenShare::Off {
                    fx.warn("Camera cannot be toggled while screen sharing");
                    return;
                }
                let Some(tracks) = &self.tracks else {
                    fx.warn("No local media to toggle");
                    return;
                };
                self.video_enabled = !self.video_enabled;
                fx.push(Effect::SetTrackEnabled {
                    track: tracks.camera().clone(),
                    enabled: self.video_enabled,
                });
                fx.info(if self.video_enabled { "Video enabled" } else { "Video disabled" });
                self.broadcast_media_state(fx);
            }
            Command::ToggleScreenShare => match self.screen {
                ScreenShare::Off => {
                    if self.tracks.is_none() {
                        fx.warn("No local media, cannot start screen sharing");
                        return;
                    }
                    self.screen = ScreenShare::Starting;
                    fx.info("Starting screen share...");
                    fx.push(Effect::AcquireScreen);
                }
                ScreenShare::Starting => fx.info("Screen share is already starting"),
                ScreenShare::On => self.stop_screen_share(fx),
            },
            Command::EndCall => {
                fx.info("Ending call and cleaning up...");
                self.close(fx);
            }
        }
    }

    fn broadcast_media_state(&mut self, fx: &mut Effects) {
        fx.push(Effect::Send(NegotiationMessage::MediaStateChange {
            audio: self.audio_enabled,
            video: self.video_enabled,
        }));
        fx.notify(Notification::LocalMedia(self.local_media()));
    }

    fn screen_ready(&mut self, fx: &mut Effects, result: Result<Arc<LocalTrack>, ScreenShareError>) {
        match result {
            Ok(screen) => {
                if self.screen != ScreenShare::Starting {
                    fx.push(Effect::ReleaseTrack(screen));
                    return;
                }
                let Some(tracks) = self.tracks.as_mut() else {
                    fx.push(Effect::ReleaseTrack(screen));
                    return;
                };
                tracks.switch_video_source(screen.clone());
                self.screen = ScreenShare::On;
                fx.push(Effect::ReplaceVideoTrack(screen.clone()));
                fx.push(Effect::WatchTrackEnded(screen));
                fx.push(Effect::Send(NegotiationMessage::ScreenShareChange { is_sharing: true }));
                fx.success("Screen sharing started");
                fx.notify(Notification::LocalMedia(self.local_media()));
            }
            Err(e) => {
                self.screen = ScreenShare::Off;
                fx.error(format!("Screen sharing failed: {e}"));
                self.report_error(fx, ErrorKind::ScreenShare, e.to_string());
            }
        }
    }

    /// Возвращает камеру на место экрана. Состояние enabled камеры не трогается,
    /// поэтому после шаринга оно такое же, как до него
    fn stop_screen_share(&mut self, fx: &mut Effects) {
        let Some(tracks) = self.tracks.as_mut() else {
            return;
        };
        let camera = tracks.camera().clone();
        let screen = tracks.switch_video_source(camera.clone());
        self.screen = ScreenShare::Off;
        fx.info("Stopping screen share, reverting to camera");
        fx.push(Effect::ReplaceVideoTrack(camera));
        fx.push(Effect::ReleaseTrack(screen));
        fx.push(Effect::Send(NegotiationMessage::ScreenShareChange { is_sharing: false }));
        fx.notify(Notification::LocalMedia(self.local_media()));
    }

    fn video_replaced(&mut self, fx: &mut Effects, result: Result<ReplaceOutcome, NegotiationError>) {
        match result {
            Ok(ReplaceOutcome::Replaced) => fx.info("Outgoing video track replaced"),
            Ok(ReplaceOutcome::NoSender) => {
                let Some(tracks) = &self.tracks else {
                    return;
                };
                fx.warn("No outgoing video sender, renegotiating");
                fx.push(Effect::AttachTracks(vec![tracks.active_video().clone()]));
                if self.negotiator.remote_id().is_some() {
                    self.request_offer(fx, OfferRequest::default());
                }
            }
            Err(e) => {
                fx.error(e.to_string());
                self.report_error(fx, ErrorKind::ScreenShare, "Could not switch the outgoing video");
            }
        }
    }

    /// Терминальный переход: освобождаем всё, чем владеет сессия
    fn close(&mut self, fx: &mut Effects) {
        if self.sampler.stop() {
            fx.push(Effect::StopSampling);
        }
        if let Some(tracks) = self.tracks.take() {
            for track in tracks.all() {
                fx.info(format!("Stopped {:?} track", track.kind()));
                fx.push(Effect::ReleaseTrack(track));
            }
        }
        self.screen = ScreenShare::Off;
        fx.push(Effect::CloseTransport);
        if self.joined && self.signaling_up {
            fx.push(Effect::Send(NegotiationMessage::LeaveRoom));
            fx.info(format!("Left room {}", self.room_id));
        }
        self.joined = false;
        self.remote_stream = None;
        self.negotiator.abandon();
        self.set_state(fx, ConnectionState::Closed);
        fx.push(Effect::Shutdown);
    }
}
