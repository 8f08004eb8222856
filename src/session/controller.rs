//! Контроллер звонка: владеет транспортом, треками, подпиской на сигналинг
//! и таймерами; исполняет эффекты `Session`.

use crate::config::CallConfig;
use crate::error::{CallError, ErrorKind};
use crate::logger::{LogEntry, LogStream};
use crate::media::{LocalTrack, MediaDevices, MediaSourceManager};
use crate::negotiation::OfferTicket;
use crate::peer::connection::{Transport, TransportEvents, TransportFactory};
use crate::peer::types::{ConnectionState, IceCandidate, RemoteStream, SessionDescription};
use crate::session::machine::{Command, Effect, Event, LocalMediaState, Notification, Session};
use crate::signaling::{NegotiationMessage, SignalEvent, SignalHandler, SignalingChannel, Subscription};
use crate::telemetry::QualitySample;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use webrtc::track::track_remote::TrackRemote;

/// Интерфейс к слою UI. Все методы необязательные
pub trait SessionObserver: Send + Sync {
    fn on_state_change(&self, _state: ConnectionState) {}

    /// `None`, когда собеседник ушёл
    fn on_remote_stream(&self, _stream: Option<&RemoteStream>) {}

    /// `None`, когда опрос остановлен
    fn on_quality_sample(&self, _sample: Option<&QualitySample>) {}

    fn on_error(&self, _kind: ErrorKind, _message: &str) {}

    fn on_error_cleared(&self) {}

    fn on_remote_identity(&self, _visible: bool) {}

    fn on_remote_media(&self, _audio: bool, _video: bool) {}

    fn on_remote_screen_share(&self, _is_sharing: bool) {}

    fn on_local_media(&self, _state: LocalMediaState) {}
}

/// Наблюдатель, которому ничего не нужно
#[derive(Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Внешние зависимости звонка
#[derive(Clone)]
pub struct CallDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub observer: Arc<dyn SessionObserver>,
}

/// Один звонок в одной комнате
pub struct SessionController {
    room_id: String,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConnectionState>,
    logs: LogStream,
    transport: Arc<dyn Transport>,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Создаёт транспорт, подписывается на сигналинг и запускает звонок
    pub async fn start(
        room_id: impl Into<String>,
        config: CallConfig,
        deps: CallDeps,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let room_id = room_id.into();
        let logs = LogStream::new(config.log_capacity);
        let (events, inbox) = mpsc::unbounded_channel();

        let sink = events.clone();
        let transport_events: TransportEvents = Arc::new(move |event| {
            let _ = sink.send(Event::Transport(event));
        });
        let transport = deps
            .transports
            .create(&config.ice_servers, transport_events)
            .await?;

        let sink = events.clone();
        let handler: SignalHandler = Arc::new(move |event| {
            let event = match event {
                SignalEvent::Connected { local_id } => Event::SignalingConnected { local_id },
                SignalEvent::Disconnected { reason } => Event::SignalingDisconnected { reason },
                SignalEvent::Message(inbound) => Event::Signal(inbound),
            };
            let _ = sink.send(event);
        });
        let subscription = deps.signaling.subscribe(handler);

        let (ops, ops_rx) = mpsc::unbounded_channel();
        let ops_worker = tokio::spawn(transport_worker(transport.clone(), ops_rx, events.clone()));

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let outbox_worker = tokio::spawn(outbox_worker(
            deps.signaling.clone(),
            room_id.clone(),
            outbox_rx,
            events.clone(),
        ));

        let (state_tx, state) = watch::channel(ConnectionState::New);
        let driver = Driver {
            session: Session::new(room_id.clone(), &config),
            events: events.clone(),
            ops: Some(ops),
            outbox: Some(outbox),
            media: Arc::new(MediaSourceManager::new(deps.devices)),
            transport: transport.clone(),
            observer: deps.observer,
            logs: logs.clone(),
            state: state_tx,
            subscription: Some(subscription),
            timers: Timers::default(),
            workers: vec![ops_worker, outbox_worker],
        };

        let _ = events.send(Event::Start);
        let task = tokio::spawn(driver.run(inbox));

        Ok(Self {
            room_id,
            events,
            state,
            logs,
            transport,
            task: Some(task),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn toggle_audio(&self) {
        self.command(Command::ToggleAudio);
    }

    pub fn toggle_video(&self) {
        self.command(Command::ToggleVideo);
    }

    pub fn toggle_screen_share(&self) {
        self.command(Command::ToggleScreenShare);
    }

    pub fn end_call(&self) {
        self.command(Command::EndCall);
    }

    fn command(&self, command: Command) {
        // после завершения звонка команды молча игнорируются
        let _ = self.events.send(Event::Command(command));
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.entries()
    }

    pub fn log_stream(&self) -> LogStream {
        self.logs.clone()
    }

    /// Входящий трек по идентификатору из `on_remote_stream`, для отрисовки
    pub fn remote_track(&self, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.transport.remote_track(track_id)
    }

    /// Ждёт, пока звонок полностью завершится и ресурсы будут освобождены
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.command(Command::EndCall);
        }
    }
}

/// Операции над транспортом; выполняются по одной в порядке постановки
enum TransportOp {
    AttachTracks(Vec<Arc<LocalTrack>>),
    CreateOffer(OfferTicket),
    ApplyRemote {
        description: SessionDescription,
        rollback: bool,
    },
    CreateAnswer,
    ApplyCandidate(IceCandidate),
    ReplaceVideo(Arc<LocalTrack>),
    Close,
}

async fn transport_worker(
    transport: Arc<dyn Transport>,
    mut ops: mpsc::UnboundedReceiver<TransportOp>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(op) = ops.recv().await {
        let event = match op {
            TransportOp::AttachTracks(tracks) => {
                Event::TracksAttached(transport.add_tracks(&tracks).await)
            }
            TransportOp::CreateOffer(ticket) => Event::OfferCreated {
                seq: ticket.seq,
                result: transport.create_offer(ticket.ice_restart).await,
            },
            TransportOp::ApplyRemote {
                description,
                rollback,
            } => {
                let kind = description.kind;
                Event::RemoteDescriptionApplied {
                    kind,
                    result: transport.set_remote_description(description, rollback).await,
                }
            }
            TransportOp::CreateAnswer => Event::AnswerCreated(transport.create_answer().await),
            TransportOp::ApplyCandidate(candidate) => {
                Event::CandidateApplied(transport.add_ice_candidate(candidate).await)
            }
            TransportOp::ReplaceVideo(track) => {
                Event::VideoReplaced(transport.replace_video_track(&track).await)
            }
            TransportOp::Close => {
                transport.close().await;
                break;
            }
        };
        // сессия могла уже закрыться; тогда результат никому не нужен
        let _ = events.send(event);
    }
}

async fn outbox_worker(
    signaling: Arc<dyn SignalingChannel>,
    room_id: String,
    mut outbox: mpsc::UnboundedReceiver<NegotiationMessage>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = signaling.send(&room_id, &message).await {
            let _ = events.send(Event::SignalingFailed(e));
        }
    }
}

#[derive(Default)]
struct Timers {
    offer: Option<JoinHandle<()>>,
    identity: Option<JoinHandle<()>>,
    sampling: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Timers {
    fn replace(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(handle);
    }

    fn cancel_all(&mut self) {
        for handle in [self.offer.take(), self.identity.take(), self.sampling.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

struct Driver {
    session: Session,
    events: mpsc::UnboundedSender<Event>,
    ops: Option<mpsc::UnboundedSender<TransportOp>>,
    outbox: Option<mpsc::UnboundedSender<NegotiationMessage>>,
    media: Arc<MediaSourceManager>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn SessionObserver>,
    logs: LogStream,
    state: watch::Sender<ConnectionState>,
    subscription: Option<Subscription>,
    timers: Timers,
    workers: Vec<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = inbox.recv().await {
            let mut finished = false;
            for effect in self.session.step(event) {
                finished |= self.execute(effect);
            }
            if finished {
                break;
            }
        }
        self.shutdown().await;
    }

    /// `true` означает, что сессия закрыта
    fn execute(&mut self, effect: Effect) -> bool {
        match effect {
            Effect::AcquireMedia(constraints) => {
                let media = self.media.clone();
                let events = self.events.clone();
                self.timers.track(tokio::spawn(async move {
                    let result = media.acquire(&constraints).await;
                    let _ = events.send(Event::MediaReady(result));
                }));
            }
            Effect::AcquireScreen => {
                let media = self.media.clone();
                let events = self.events.clone();
                self.timers.track(tokio::spawn(async move {
                    let result = media.acquire_screen().await;
                    let _ = events.send(Event::ScreenReady(result));
                }));
            }
            Effect::ReleaseTrack(track) => self.media.release(&track),
            Effect::SetTrackEnabled { track, enabled } => track.set_enabled(enabled),
            Effect::WatchTrackEnded(track) => {
                let events = self.events.clone();
                self.timers.track(tokio::spawn(async move {
                    track.ended().await;
                    let _ = events.send(Event::ScreenEnded {
                        track_id: track.id().to_string(),
                    });
                }));
            }
            Effect::AttachTracks(tracks) => self.transport_op(TransportOp::AttachTracks(tracks)),
            Effect::ReplaceVideoTrack(track) => self.transport_op(TransportOp::ReplaceVideo(track)),
            Effect::CreateOffer(ticket) => self.transport_op(TransportOp::CreateOffer(ticket)),
            Effect::ApplyRemoteDescription {
                description,
                rollback,
            } => self.transport_op(TransportOp::ApplyRemote {
                description,
                rollback,
            }),
            Effect::CreateAnswer => self.transport_op(TransportOp::CreateAnswer),
            Effect::ApplyCandidate(candidate) => {
                self.transport_op(TransportOp::ApplyCandidate(candidate))
            }
            Effect::CloseTransport => self.transport_op(TransportOp::Close),
            Effect::Send(message) => {
                if let Some(outbox) = &self.outbox {
                    let _ = outbox.send(message);
                }
            }
            Effect::ScheduleOffer { generation, delay } => {
                let handle = self.after(delay, Event::OfferTimer { generation });
                Timers::replace(&mut self.timers.offer, handle);
            }
            Effect::ScheduleIdentityHide { generation, after } => {
                let handle = self.after(after, Event::IdentityNoticeExpired { generation });
                Timers::replace(&mut self.timers.identity, handle);
            }
            Effect::StartSampling { every } => {
                let handle = self.sampling(every);
                Timers::replace(&mut self.timers.sampling, handle);
            }
            Effect::StopSampling => {
                if let Some(handle) = self.timers.sampling.take() {
                    handle.abort();
                }
            }
            Effect::SampleStats { episode } => {
                let transport = self.transport.clone();
                let events = self.events.clone();
                self.timers.track(tokio::spawn(async move {
                    let result = transport.stats().await;
                    let _ = events.send(Event::StatsSampled { episode, result });
                }));
            }
            Effect::Notify(notification) => self.notify(notification),
            Effect::Log(level, message) => self.logs.log(level, &message),
            Effect::Shutdown => return true,
        }
        false
    }

    fn transport_op(&self, op: TransportOp) {
        if let Some(ops) = &self.ops {
            let _ = ops.send(op);
        }
    }

    fn after(&self, delay: Duration, event: Event) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(event);
        })
    }

    fn sampling(&self, every: Duration) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if events.send(Event::StatsTick).is_err() {
                    break;
                }
            }
        })
    }

    fn notify(&self, notification: Notification) {
        let observer = &self.observer;
        match notification {
            Notification::StateChanged(state) => {
                self.state.send_replace(state);
                observer.on_state_change(state);
            }
            Notification::RemoteStream(stream) => observer.on_remote_stream(Some(&stream)),
            Notification::RemoteStreamCleared => observer.on_remote_stream(None),
            Notification::Quality(sample) => observer.on_quality_sample(sample.as_ref()),
            Notification::Error { kind, message } => observer.on_error(kind, &message),
            Notification::ErrorCleared => observer.on_error_cleared(),
            Notification::RemoteIdentity { visible } => observer.on_remote_identity(visible),
            Notification::RemoteMedia { audio, video } => observer.on_remote_media(audio, video),
            Notification::RemoteScreenShare { is_sharing } => {
                observer.on_remote_screen_share(is_sharing)
            }
            Notification::LocalMedia(state) => observer.on_local_media(state),
        }
    }

    /// Таймеры отменяются сразу; очереди транспорта и сигналинга
    /// дорабатывают то, что уже поставлено (в том числе `leave-room` и close)
    async fn shutdown(mut self) {
        self.timers.cancel_all();
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.ops.take();
        self.outbox.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("Session worker ended abnormally: {e}");
            }
        }
        debug!("Session for room {} shut down", self.session.room_id());
    }
}
