//! Адаптер сигнального канала: типизированные сообщения поверх внешнего релея.
//!
//! Здесь нет логики согласования. Канал только отправляет сообщения комнаты,
//! доставляет входящие подписчикам и сообщает о подключении/отключении.

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Joined(String),
    Left(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationMessage {
    JoinRoom,
    LeaveRoom,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    RoomEvent(RoomEvent),
    MediaStateChange { audio: bool, video: bool },
    ScreenShareChange { is_sharing: bool },
}

/// Входящее сообщение вместе с тем, что к нему добавил релей
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub room_id: Option<String>,
    pub from: Option<String>,
    pub message: NegotiationMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Connected { local_id: String },
    Disconnected { reason: String },
    Message(Inbound),
}

pub type SignalHandler = Arc<dyn Fn(SignalEvent) + Send + Sync>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Идентификатор соединения, выданный релеем (если подключены)
    fn local_id(&self) -> Option<String>;

    async fn send(&self, room_id: &str, message: &NegotiationMessage) -> Result<(), SignalingError>;

    /// Если канал уже подключён, обработчик сразу получает `Connected`
    fn subscribe(&self, handler: SignalHandler) -> Subscription;
}

// ========== SUBSCRIPTIONS ==========

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    handlers: Vec<(u64, SignalHandler)>,
}

/// Список обработчиков для реализаций `SignalingChannel`
#[derive(Default, Clone)]
pub struct Subscribers {
    inner: Arc<Mutex<SubscriberList>>,
}

impl Subscribers {
    pub fn add(&self, handler: SignalHandler) -> Subscription {
        let id = match self.inner.lock() {
            Ok(mut list) => {
                list.next_id += 1;
                let id = list.next_id;
                list.handlers.push((id, handler));
                id
            }
            Err(_) => 0,
        };
        Subscription {
            id,
            list: Arc::downgrade(&self.inner),
        }
    }

    /// Обработчики вызываются вне блокировки
    pub fn emit(&self, event: SignalEvent) {
        let handlers: Vec<SignalHandler> = match self.inner.lock() {
            Ok(list) => list.handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|l| l.handlers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Подписка на канал; при drop обработчик снимается
pub struct Subscription {
    id: u64,
    list: Weak<Mutex<SubscriberList>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            if let Ok(mut list) = list.lock() {
                list.handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

// ========== WIRE FORMAT ==========

/// Событие релея: имя + JSON полезная нагрузка
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub event: String,
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SdpBody {
    room_id: Option<String>,
    sdp: SessionDescription,
    user_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateBody {
    room_id: Option<String>,
    candidate: IceCandidate,
    user_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaStateBody {
    room_id: Option<String>,
    audio: bool,
    video: bool,
    user_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenShareBody {
    room_id: Option<String>,
    is_sharing: bool,
    user_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserBody {
    user_id: String,
}

fn body<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Кодирует исходящее сообщение комнаты
pub fn to_wire(room_id: &str, message: &NegotiationMessage) -> WireEvent {
    let room = Some(room_id.to_owned());
    let (event, payload) = match message {
        NegotiationMessage::JoinRoom => ("join-room", json!(room_id)),
        NegotiationMessage::LeaveRoom => ("leave-room", json!(room_id)),
        NegotiationMessage::Offer(sdp) => (
            "offer",
            body(SdpBody {
                room_id: room,
                sdp: sdp.clone(),
                user_id: None
            }),
        ),
        NegotiationMessage::Answer(sdp) => (
            "answer",
            body(SdpBody {
                room_id: room,
                sdp: sdp.clone(),
                user_id: None
            }),
        ),
        NegotiationMessage::IceCandidate(candidate) => (
            "ice-candidate",
            body(CandidateBody {
                room_id: room,
                candidate: candidate.clone(),
                user_id: None
            }),
        ),
        NegotiationMessage::RoomEvent(RoomEvent::Joined(user_id)) => (
            "user-joined",
            body(UserBody {
                user_id: user_id.clone()
            }),
        ),
        NegotiationMessage::RoomEvent(RoomEvent::Left(user_id)) => (
            "user-left",
            body(UserBody {
                user_id: user_id.clone()
            }),
        ),
        NegotiationMessage::MediaStateChange { audio, video } => (
            "media-state-change",
            body(MediaStateBody {
                room_id: room,
                audio: *audio,
                video: *video,
                user_id: None
            }),
        ),
        NegotiationMessage::ScreenShareChange { is_sharing } => (
            "screen-share-change",
            body(ScreenShareBody {
                room_id: room,
                is_sharing: *is_sharing,
                user_id: None
            }),
        ),
    };
    WireEvent {
        event: event.to_owned(),
        payload,
    }
}

fn parse<T: serde::de::DeserializeOwned>(event: &WireEvent) -> Result<T, SignalingError> {
    serde_json::from_value(event.payload.clone()).map_err(|e| SignalingError::Malformed {
        event: event.event.clone(),
        reason: e.to_string(),
    })
}

/// Разбирает событие релея
pub fn from_wire(event: &WireEvent) -> Result<Inbound, SignalingError> {
    let inbound = match event.event.as_str() {
        "join-room" | "leave-room" => {
            let room: String = parse(event)?;
            let message = if event.event == "join-room" {
                NegotiationMessage::JoinRoom
            } else {
                NegotiationMessage::LeaveRoom
            };
            Inbound {
                room_id: Some(room),
                from: None,
                message,
            }
        }
        "user-joined" | "user-left" => {
            let body: UserBody = parse(event)?;
            let room_event = if event.event == "user-joined" {
                RoomEvent::Joined(body.user_id.clone())
            } else {
                RoomEvent::Left(body.user_id.clone())
            };
            Inbound {
                room_id: None,
                from: Some(body.user_id),
                message: NegotiationMessage::RoomEvent(room_event),
            }
        }
        "offer" | "answer" => {
            let body: SdpBody = parse(event)?;
            let message = if event.event == "offer" {
                NegotiationMessage::Offer(body.sdp)
            } else {
                NegotiationMessage::Answer(body.sdp)
            };
            Inbound {
                room_id: body.room_id,
                from: body.user_id,
                message,
            }
        }
        "ice-candidate" => {
            let body: CandidateBody = parse(event)?;
            Inbound {
                room_id: body.room_id,
                from: body.user_id,
                message: NegotiationMessage::IceCandidate(body.candidate),
            }
        }
        "media-state-change" => {
            let body: MediaStateBody = parse(event)?;
            Inbound {
                room_id: body.room_id,
                from: body.user_id,
                message: NegotiationMessage::MediaStateChange {
                    audio: body.audio,
                    video: body.video,
                },
            }
        }
        "screen-share-change" => {
            let body: ScreenShareBody = parse(event)?;
            Inbound {
                room_id: body.room_id,
                from: body.user_id,
                message: NegotiationMessage::ScreenShareChange {
                    is_sharing: body.is_sharing,
                },
            }
        }
        other => {
            return Err(SignalingError::Malformed {
                event: other.to_owned(),
                reason: "unknown event".into(),
            })
        }
    };
    Ok(inbound)
}

/// Добавляет `userId` отправителя, как это делает релей при пересылке
fn tag_sender(mut event: WireEvent, user_id: &str) -> WireEvent {
    if let Value::Object(map) = &mut event.payload {
        map.insert("userId".into(), Value::String(user_id.to_owned()));
    }
    event
}

// ========== IN-PROCESS RELAY ==========

const ROOM_CAPACITY: usize = 2;

#[derive(Default)]
struct RelayState {
    connections: HashMap<String, Subscribers>,
    rooms: HashMap<String, Vec<String>>,
}

/// Релей в памяти процесса с теми же правилами пересылки, что и сигнальный
/// сервер: двое в комнате, `user-joined`/`user-left` остальным участникам,
/// остальные события пересылаются с `userId` отправителя.
#[derive(Default, Clone)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> Arc<RelayConnection> {
        let id = random_id();
        let subscribers = Subscribers::default();
        if let Ok(mut state) = self.state.lock() {
            state.connections.insert(id.clone(), subscribers.clone());
        }
        Arc::new(RelayConnection {
            id,
            relay: self.clone(),
            subscribers,
            connected: Mutex::new(true),
        })
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.rooms.get(room_id).cloned())
            .unwrap_or_default()
    }

    fn route(&self, from: &str, room_id: &str, message: &NegotiationMessage) -> Result<(), SignalingError> {
        let wire = to_wire(room_id, message);
        let deliveries: Vec<(Subscribers, WireEvent)> = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| SignalingError::Unavailable("relay poisoned".into()))?;
            match message {
                NegotiationMessage::JoinRoom => {
                    let members = state.rooms.entry(room_id.to_owned()).or_default();
                    if members.iter().any(|m| m == from) {
                        return Ok(());
                    }
                    if members.len() >= ROOM_CAPACITY {
                        return Err(SignalingError::RoomFull(room_id.to_owned()));
                    }
                    let others = members.clone();
                    members.push(from.to_owned());
                    let joined = to_wire(
                        room_id,
                        &NegotiationMessage::RoomEvent(RoomEvent::Joined(from.to_owned())),
                    );
                    others
                        .iter()
                        .filter_map(|m| state.connections.get(m))
                        .map(|s| (s.clone(), joined.clone()))
                        .collect()
                }
                NegotiationMessage::LeaveRoom => Self::remove_member(&mut state, from, room_id),
                _ => {
                    let members = state.rooms.get(room_id).cloned().unwrap_or_default();
                    if !members.iter().any(|m| m == from) {
                        return Err(SignalingError::Unavailable(format!(
                            "not a member of room {room_id}"
                        )));
                    }
                    let tagged = tag_sender(wire, from);
                    members
                        .iter()
                        .filter(|m| m.as_str() != from)
                        .filter_map(|m| state.connections.get(m))
                        .map(|s| (s.clone(), tagged.clone()))
                        .collect()
                }
            }
        };

        for (subscribers, event) in deliveries {
            match from_wire(&event) {
                Ok(inbound) => subscribers.emit(SignalEvent::Message(inbound)),
                Err(e) => tracing::warn!("relay dropped event: {e}"),
            }
        }
        Ok(())
    }

    fn remove_member(state: &mut RelayState, member: &str, room_id: &str) -> Vec<(Subscribers, WireEvent)> {
        let Some(members) = state.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        let before = members.len();
        members.retain(|m| m != member);
        if members.len() == before {
            return Vec::new();
        }
        let left = to_wire(
            room_id,
            &NegotiationMessage::RoomEvent(RoomEvent::Left(member.to_owned())),
        );
        let others = members.clone();
        if others.is_empty() {
            state.rooms.remove(room_id);
        }
        others
            .iter()
            .filter_map(|m| state.connections.get(m))
            .map(|s| (s.clone(), left.clone()))
            .collect()
    }

    fn drop_connection(&self, id: &str) {
        let deliveries: Vec<(Subscribers, WireEvent)> = match self.state.lock() {
            Ok(mut state) => {
                state.connections.remove(id);
                let rooms: Vec<String> = state
                    .rooms
                    .iter()
                    .filter(|(_, members)| members.iter().any(|m| m == id))
                    .map(|(room, _)| room.clone())
                    .collect();
                rooms
                    .iter()
                    .flat_map(|room| Self::remove_member(&mut state, id, room))
                    .collect()
            }
            Err(_) => return,
        };
        for (subscribers, event) in deliveries {
            if let Ok(inbound) = from_wire(&event) {
                subscribers.emit(SignalEvent::Message(inbound));
            }
        }
    }
}

/// Соединение одного участника с `LocalRelay`
pub struct RelayConnection {
    id: String,
    relay: LocalRelay,
    subscribers: Subscribers,
    connected: Mutex<bool>,
}

impl RelayConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.lock().map(|c| *c).unwrap_or(false)
    }

    /// Обрыв соединения: релей убирает участника из комнат
    pub fn disconnect(&self, reason: &str) {
        if let Ok(mut connected) = self.connected.lock() {
            if !*connected {
                return;
            }
            *connected = false;
        }
        self.relay.drop_connection(&self.id);
        self.subscribers.emit(SignalEvent::Disconnected {
            reason: reason.to_owned(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl SignalingChannel for RelayConnection {
    fn local_id(&self) -> Option<String> {
        self.is_connected().then(|| self.id.clone())
    }

    async fn send(&self, room_id: &str, message: &NegotiationMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Unavailable("relay connection closed".into()));
        }
        self.relay.route(&self.id, room_id, message)
    }

    fn subscribe(&self, handler: SignalHandler) -> Subscription {
        let connected = self.is_connected();
        let subscription = self.subscribers.add(handler.clone());
        if connected {
            handler(SignalEvent::Connected {
                local_id: self.id.clone(),
            });
        }
        subscription
    }
}
