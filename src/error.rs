//! Ошибки звонка, по одному типу на каждую границу компонента.

use serde::{Deserialize, Serialize};

/// Причина отказа в захвате камеры/микрофона
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    Unknown,
}

/// Захват локальных устройств не удался; фатально для текущей попытки звонка
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalingError {
    #[error("Signaling channel unavailable: {0}")]
    Unavailable(String),

    #[error("Room {0} is full")]
    RoomFull(String),

    #[error("Malformed signaling event {event}: {reason}")]
    Malformed { event: String, reason: String },
}

/// Ошибка создания или применения SDP
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NegotiationError {
    #[error("Failed to create peer connection: {0}")]
    PeerConnection(String),

    #[error("Error creating offer: {0}")]
    CreateOffer(String),

    #[error("Error creating answer: {0}")]
    CreateAnswer(String),

    #[error("Error setting local description: {0}")]
    SetLocalDescription(String),

    #[error("Error setting remote description: {0}")]
    SetRemoteDescription(String),

    #[error("Error attaching track: {0}")]
    AttachTrack(String),

    #[error("Transport closed")]
    Closed,
}

/// Кандидат не применился; сессия продолжает работу
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Error adding ICE candidate: {0}")]
pub struct IceError(pub String);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScreenShareError {
    #[error("Screen sharing permission denied")]
    Denied,

    #[error("Screen sharing cancelled")]
    Cancelled,

    #[error("Screen sharing failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Server URL cannot be empty ({0})")]
    EmptyUrl(String),

    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),
}

/// Ошибки, которые возвращаются вызывающему коду при создании звонка
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Категория ошибки для UI (`on_error`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Media,
    Signaling,
    Negotiation,
    Ice,
    ScreenShare,
    Connection,
}
