#![allow(dead_code)]

use async_trait::async_trait;
use duocall::error::{ErrorKind, IceError, NegotiationError};
use duocall::media::{LocalTrack, SyntheticDevices};
use duocall::peer::types::{
    ConnectionState, IceCandidate, IceConnectionState, ReplaceOutcome, RemoteStream,
    ServerConfig, SessionDescription, TrackKind, TransportEvent,
};
use duocall::peer::{RtcTransportFactory, Transport, TransportEvents, TransportFactory};
use duocall::session::LocalMediaState;
use duocall::signaling::RelayConnection;
use duocall::telemetry::{InboundVideo, QualitySample, StatsSnapshot};
use duocall::{CallConfig, CallDeps, SessionController, SessionObserver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

pub const ROOM: &str = "room-42";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> CallConfig {
    CallConfig {
        log_capacity: 500,
        ..CallConfig::default()
    }
}

#[derive(Default)]
struct LoopState {
    local: bool,
    remote: bool,
    applied: usize,
    connected: bool,
    video_sender: bool,
}

/// Транспорт без сети: соединяется, как только у него есть оба описания
/// и все кандидаты собеседника
pub struct LoopbackTransport {
    name: String,
    candidates: usize,
    events: TransportEvents,
    state: Mutex<LoopState>,
}

impl LoopbackTransport {
    fn gather(&self) {
        for i in 0..self.candidates {
            (self.events)(TransportEvent::LocalCandidate(Some(IceCandidate::new(format!(
                "candidate:{i} 1 udp 2130706431 192.168.0.{i} 5000 typ host"
            )))));
        }
        (self.events)(TransportEvent::LocalCandidate(None));
    }

    fn check(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.connected || !state.local || !state.remote || state.applied < self.candidates {
                return;
            }
            state.connected = true;
        }
        (self.events)(TransportEvent::ConnectionState(ConnectionState::Connecting));
        (self.events)(TransportEvent::IceConnectionState(IceConnectionState::Connected));
        (self.events)(TransportEvent::ConnectionState(ConnectionState::Connected));
        for kind in [TrackKind::Audio, TrackKind::Video] {
            (self.events)(TransportEvent::RemoteTrack {
                stream_id: format!("{}-remote", self.name),
                track_id: format!("{}-{kind:?}", self.name),
                kind,
            });
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn add_tracks(&self, tracks: &[Arc<LocalTrack>]) -> Result<(), NegotiationError> {
        if tracks.iter().any(|t| t.kind() == TrackKind::Video) {
            self.state.lock().unwrap().video_sender = true;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.state.lock().unwrap().local = true;
        self.gather();
        Ok(SessionDescription::offer(format!(
            "v=0 {} restart={ice_restart}",
            self.name
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.state.lock().unwrap().local = true;
        self.gather();
        self.check();
        Ok(SessionDescription::answer(format!("v=0 {}", self.name)))
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
        rollback: bool,
    ) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock().unwrap();
            if rollback {
                state.local = false;
            }
            state.remote = true;
        }
        self.check();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), IceError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.remote {
                return Err(IceError("no remote description".into()));
            }
            state.applied += 1;
        }
        self.check();
        Ok(())
    }

    async fn replace_video_track(&self, _track: &LocalTrack) -> Result<ReplaceOutcome, NegotiationError> {
        if self.state.lock().unwrap().video_sender {
            Ok(ReplaceOutcome::Replaced)
        } else {
            Ok(ReplaceOutcome::NoSender)
        }
    }

    async fn stats(&self) -> Result<StatsSnapshot, String> {
        Ok(StatsSnapshot {
            round_trip_time: Some(0.08),
            inbound_video: Some(InboundVideo {
                width: Some(1280),
                height: Some(720),
                frames_per_second: Some(30.0),
            }),
        })
    }

    async fn close(&self) {
        (self.events)(TransportEvent::ConnectionState(ConnectionState::Closed));
    }
}

pub struct LoopbackFactory {
    pub candidates: usize,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        _ice_servers: &[ServerConfig],
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, NegotiationError> {
        Ok(Arc::new(LoopbackTransport {
            name: duocall::utils::random_id(),
            candidates: self.candidates,
            events,
            state: Mutex::new(LoopState::default()),
        }))
    }
}

/// Наблюдатель, который всё записывает
#[derive(Default)]
pub struct Recorder {
    pub states: Mutex<Vec<ConnectionState>>,
    pub streams: Mutex<Vec<Option<RemoteStream>>>,
    pub errors: Mutex<Vec<ErrorKind>>,
    pub local: Mutex<Vec<LocalMediaState>>,
    pub remote_sharing: Mutex<Vec<bool>>,
    samples: AtomicUsize,
}

impl Recorder {
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        self.errors.lock().unwrap().clone()
    }

    pub fn screen_sharing(&self) -> Option<bool> {
        self.local.lock().unwrap().last().map(|s| s.screen_sharing)
    }

    pub fn remote_sharing(&self) -> Option<bool> {
        self.remote_sharing.lock().unwrap().last().copied()
    }

    pub fn has_remote_stream(&self) -> bool {
        matches!(self.streams.lock().unwrap().last(), Some(Some(_)))
    }

    pub fn stream_cleared(&self) -> bool {
        matches!(self.streams.lock().unwrap().last(), Some(None))
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.streams.lock().unwrap().last().cloned().flatten()
    }

    pub fn audio_enabled(&self) -> Option<bool> {
        self.local.lock().unwrap().last().map(|s| s.audio)
    }
}

impl SessionObserver for Recorder {
    fn on_state_change(&self, state: ConnectionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_remote_stream(&self, stream: Option<&RemoteStream>) {
        self.streams.lock().unwrap().push(stream.cloned());
    }

    fn on_quality_sample(&self, sample: Option<&QualitySample>) {
        if sample.is_some() {
            self.samples.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_error(&self, kind: ErrorKind, _message: &str) {
        self.errors.lock().unwrap().push(kind);
    }

    fn on_remote_screen_share(&self, is_sharing: bool) {
        self.remote_sharing.lock().unwrap().push(is_sharing);
    }

    fn on_local_media(&self, state: LocalMediaState) {
        self.local.lock().unwrap().push(state);
    }
}

pub struct Peer {
    pub controller: SessionController,
    pub recorder: Arc<Recorder>,
    pub devices: Arc<SyntheticDevices>,
    pub connection: Arc<RelayConnection>,
}

pub async fn start_peer(
    connection: Arc<RelayConnection>,
    devices: Arc<SyntheticDevices>,
    candidates: usize,
) -> Peer {
    start_peer_with(
        connection,
        devices,
        Arc::new(LoopbackFactory { candidates }),
        test_config(),
    )
    .await
}

/// Настоящий webrtc-rs транспорт; без ICE серверов, только host кандидаты
pub async fn start_rtc_peer(connection: Arc<RelayConnection>, devices: Arc<SyntheticDevices>) -> Peer {
    let config = CallConfig {
        ice_servers: Vec::new(),
        ..test_config()
    };
    start_peer_with(connection, devices, Arc::new(RtcTransportFactory), config).await
}

pub async fn start_peer_with(
    connection: Arc<RelayConnection>,
    devices: Arc<SyntheticDevices>,
    transports: Arc<dyn TransportFactory>,
    config: CallConfig,
) -> Peer {
    let recorder = Arc::new(Recorder::default());
    let deps = CallDeps {
        signaling: connection.clone(),
        devices: devices.clone(),
        transports,
        observer: recorder.clone(),
    };
    let controller = SessionController::start(ROOM, config, deps)
        .await
        .expect("controller starts");
    Peer {
        controller,
        recorder,
        devices,
        connection,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(30), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn wait_for_state(controller: &SessionController, target: ConnectionState) {
    let mut states = controller.state_changes();
    timeout(Duration::from_secs(30), states.wait_for(|s| *s == target))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

pub fn count_logs(controller: &SessionController, needle: &str) -> usize {
    controller
        .logs()
        .iter()
        .filter(|entry| entry.message.contains(needle))
        .count()
}
