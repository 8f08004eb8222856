//! Локальные устройства захвата: камера, микрофон, экран.

use crate::error::{MediaError, MediaErrorKind, ScreenShareError};
use crate::peer::types::TrackKind;
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub facing_mode: String,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            max_width: 1920,
            max_height: 1080,
            facing_mode: "user".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 44_100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct MediaConstraints {
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// Что стало с записанным семплом
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWrite {
    Sent,
    /// Трек выключен (mute); семпл отброшен
    Muted,
    /// Трек остановлен; источнику пора прекратить захват
    Ended,
}

/// Исходящий трек. Идентичность трека — это идентичность `Arc<LocalTrack>`.
///
/// Устройства пишут закодированные семплы только через [`LocalTrack::write_sample`].
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, label: impl Into<String>, stream_id: &str) -> Arc<Self> {
        let id = format!("{:?}-{}", source, random_id()).to_lowercase();
        let codec = match source.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id,
            source,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended,
            rtc,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Идемпотентно: повторная установка того же значения ничего не меняет
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Останавливает захват; трек больше не пригоден к отправке
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Завершается, когда трек остановлен (нами или источником)
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Передаёт семпл в транспорт, если трек включён и не остановлен
    pub async fn write_sample(&self, sample: &Sample) -> Result<SampleWrite, MediaError> {
        if self.is_ended() {
            return Ok(SampleWrite::Ended);
        }
        if !self.is_enabled() {
            return Ok(SampleWrite::Muted);
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::new(MediaErrorKind::Unknown, e.to_string()))?;
        Ok(SampleWrite::Sent)
    }

    pub(crate) fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Результат захвата камеры+микрофона
#[derive(Debug, Clone)]
pub struct LocalTracks {
    pub audio: Arc<LocalTrack>,
    pub video: Arc<LocalTrack>,
}

/// Текущий набор исходящих треков сессии.
///
/// Камера хранится всегда; активным видео может быть камера или экран.
#[derive(Debug, Clone)]
pub struct TrackSet {
    audio: Arc<LocalTrack>,
    camera: Arc<LocalTrack>,
    active_video: Arc<LocalTrack>,
}

impl TrackSet {
    pub fn new(tracks: LocalTracks) -> Self {
        Self {
            active_video: tracks.video.clone(),
            audio: tracks.audio,
            camera: tracks.video,
        }
    }

    pub fn audio(&self) -> &Arc<LocalTrack> {
        &self.audio
    }

    pub fn camera(&self) -> &Arc<LocalTrack> {
        &self.camera
    }

    pub fn active_video(&self) -> &Arc<LocalTrack> {
        &self.active_video
    }

    /// Меняет активный видео источник, возвращает предыдущий
    pub fn switch_video_source(&mut self, track: Arc<LocalTrack>) -> Arc<LocalTrack> {
        std::mem::replace(&mut self.active_video, track)
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.active_video.source() == TrackSource::Screen
    }

    /// Все треки, которые нужно остановить при завершении звонка
    pub fn all(&self) -> Vec<Arc<LocalTrack>> {
        let mut tracks = vec![self.audio.clone(), self.camera.clone()];
        if !Arc::ptr_eq(&self.active_video, &self.camera) {
            tracks.push(self.active_video.clone());
        }
        tracks
    }
}

/// Доступ к устройствам захвата платформы
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalTracks, MediaError>;

    async fn display_media(&self) -> Result<Arc<LocalTrack>, ScreenShareError>;
}

/// Менеджер источников: захват и освобождение устройств
pub struct MediaSourceManager {
    devices: Arc<dyn MediaDevices>,
}

impl MediaSourceManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalTracks, MediaError> {
        let tracks = self.devices.user_media(constraints).await?;
        tracks.audio.set_enabled(true);
        tracks.video.set_enabled(true);
        Ok(tracks)
    }

    /// Захват экрана независим от камеры: ошибка не трогает текущие треки
    pub async fn acquire_screen(&self) -> Result<Arc<LocalTrack>, ScreenShareError> {
        let track = self.devices.display_media().await?;
        if track.kind() != TrackKind::Video {
            track.stop();
            return Err(ScreenShareError::Failed("display source has no video".into()));
        }
        Ok(track)
    }

    pub fn release(&self, track: &LocalTrack) {
        track.stop();
    }
}

/// Устройства без реального захвата: треки создаются, семплы пишет
/// вызывающий код через выданные треки.
///
/// Используется в тестах и локальных демо; ответ на следующий запрос можно
/// подменить ошибкой.
#[derive(Default)]
pub struct SyntheticDevices {
    user_failure: Mutex<Option<MediaError>>,
    screen_failure: Mutex<Option<ScreenShareError>>,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_user_media(&self, error: MediaError) {
        if let Ok(mut slot) = self.user_failure.lock() {
            *slot = Some(error);
        }
    }

    pub fn fail_display_media(&self, error: ScreenShareError) {
        if let Ok(mut slot) = self.screen_failure.lock() {
            *slot = Some(error);
        }
    }

    /// Все выданные треки в порядке выдачи
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Выданные экранные треки, чтобы тест мог «нажать» системную кнопку остановки
    pub fn screens(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.source() == TrackSource::Screen)
            .collect()
    }

    fn issue(&self, track: Arc<LocalTrack>) -> Arc<LocalTrack> {
        if let Ok(mut issued) = self.issued.lock() {
            issued.push(track.clone());
        }
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalTracks, MediaError> {
        if let Some(err) = self.user_failure.lock().ok().and_then(|mut s| s.take()) {
            return Err(err);
        }
        let stream_id = format!("local-{}", random_id());
        let label = format!(
            "synthetic camera {}x{}",
            constraints.video.ideal_width, constraints.video.ideal_height
        );
        Ok(LocalTracks {
            audio: self.issue(LocalTrack::new(
                TrackSource::Microphone,
                "synthetic microphone",
                &stream_id,
            )),
            video: self.issue(LocalTrack::new(TrackSource::Camera, label, &stream_id)),
        })
    }

    async fn display_media(&self) -> Result<Arc<LocalTrack>, ScreenShareError> {
        if let Some(err) = self.screen_failure.lock().ok().and_then(|mut s| s.take()) {
            return Err(err);
        }
        Ok(self.issue(LocalTrack::new(
            TrackSource::Screen,
            "synthetic screen",
            "screen",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaErrorKind;

    fn tracks() -> LocalTracks {
        LocalTracks {
            audio: LocalTrack::new(TrackSource::Microphone, "mic", "s"),
            video: LocalTrack::new(TrackSource::Camera, "cam", "s"),
        }
    }

    #[test]
    fn switching_back_restores_camera_identity() {
        let tracks = tracks();
        let camera = tracks.video.clone();
        let mut set = TrackSet::new(tracks);
        let screen = LocalTrack::new(TrackSource::Screen, "screen", "screen");

        let previous = set.switch_video_source(screen.clone());
        assert!(Arc::ptr_eq(&previous, &camera));
        assert!(set.is_sharing_screen());
        assert_eq!(set.all().len(), 3);

        let replaced = set.switch_video_source(previous);
        assert!(Arc::ptr_eq(&replaced, &screen));
        assert!(Arc::ptr_eq(set.active_video(), &camera));
        assert!(!set.is_sharing_screen());
        assert_eq!(set.all().len(), 2);
    }

    #[test]
    fn enable_is_idempotent() {
        let track = LocalTrack::new(TrackSource::Camera, "cam", "s");
        track.set_enabled(false);
        track.set_enabled(false);
        assert!(!track.is_enabled());
        track.set_enabled(true);
        assert!(track.is_enabled());
        assert_eq!(track.kind(), TrackKind::Video);
    }

    #[tokio::test]
    async fn samples_are_dropped_while_muted_and_after_stop() {
        let track = LocalTrack::new(TrackSource::Microphone, "mic", "s");
        let sample = Sample {
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        assert_eq!(track.write_sample(&sample).await.unwrap(), SampleWrite::Sent);

        track.set_enabled(false);
        track.set_enabled(false);
        assert_eq!(track.write_sample(&sample).await.unwrap(), SampleWrite::Muted);

        track.set_enabled(true);
        assert_eq!(track.write_sample(&sample).await.unwrap(), SampleWrite::Sent);

        track.stop();
        assert_eq!(track.write_sample(&sample).await.unwrap(), SampleWrite::Ended);
    }

    #[tokio::test]
    async fn release_ends_the_track() {
        let manager = MediaSourceManager::new(Arc::new(SyntheticDevices::new()));
        let tracks = manager.acquire(&MediaConstraints::default()).await.unwrap();
        assert!(tracks.video.label().contains("1280x720"));
        manager.release(&tracks.video);
        assert!(tracks.video.is_ended());
        tracks.video.ended().await;
        assert!(!tracks.audio.is_ended());
    }

    #[tokio::test]
    async fn failures_surface_typed_errors() {
        let devices = Arc::new(SyntheticDevices::new());
        devices.fail_user_media(MediaError::new(MediaErrorKind::PermissionDenied, "denied"));
        devices.fail_display_media(ScreenShareError::Cancelled);
        let manager = MediaSourceManager::new(devices.clone());

        let err = manager.acquire(&MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err.kind, MediaErrorKind::PermissionDenied);
        assert_eq!(
            manager.acquire_screen().await.unwrap_err(),
            ScreenShareError::Cancelled
        );

        // ошибка одноразовая
        assert!(manager.acquire_screen().await.is_ok());
        assert_eq!(devices.screens().len(), 1);
        assert_eq!(devices.tracks().len(), 1);
    }
}
