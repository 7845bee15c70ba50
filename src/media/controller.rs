use crate::error::MediaError;
use crate::media::devices::MediaDevices;
use crate::media::track::{LocalStream, LocalTrack, MediaKind, TrackState};
use crate::peer::link::PeerLink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Результаты фоновых захватов и сигнал окончания показа экрана
#[derive(Debug)]
pub enum MediaEvent {
    Acquired(Result<LocalStream, MediaError>),
    DisplayAcquired(Result<LocalStream, MediaError>),
    CameraReacquired(Result<LocalStream, MediaError>),
    ScreenShareEnded { generation: u64 },
}

impl MediaEvent {
    /// Результат, который уже некому принять: треки останавливаем
    pub fn discard(self) {
        match self {
            MediaEvent::Acquired(Ok(stream))
            | MediaEvent::DisplayAcquired(Ok(stream))
            | MediaEvent::CameraReacquired(Ok(stream)) => stream.stop(),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Capture {
    User,
    Display,
    CameraRevert,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalMediaState {
    pub ready: bool,
    pub muted: bool,
    pub video_off: bool,
    pub sharing_screen: bool,
    pub audio_track: Option<String>,
    pub video_track: Option<String>,
}

/// Владелец локальных треков. Живёт внутри задачи звонка; захват устройств
/// уходит в отдельные задачи, результат возвращается через `MediaEvent`.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    events: mpsc::UnboundedSender<MediaEvent>,
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
    /// Снятый показ экрана, пока камера захватывается заново
    retiring: Option<LocalStream>,
    muted: bool,
    video_off: bool,
    acquiring: bool,
    share_pending: bool,
    share_generation: u64,
    released: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            devices,
            events,
            camera: None,
            screen: None,
            retiring: None,
            muted: false,
            video_off: false,
            acquiring: false,
            share_pending: false,
            share_generation: 0,
            released: false,
            tasks: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.camera.is_some()
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    pub fn state(&self) -> LocalMediaState {
        let audio = self.camera.as_ref().and_then(|s| s.audio_track());
        LocalMediaState {
            ready: self.is_ready(),
            muted: self.muted,
            video_off: self.video_off,
            sharing_screen: self.is_sharing_screen(),
            audio_track: audio.map(|t| t.id().to_string()),
            video_track: self.outgoing_video().map(|t| t.id().to_string()),
        }
    }

    /// Треки, которые должны уходить пиру: микрофон и текущее видео
    pub fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let audio = self.camera.as_ref().and_then(|s| s.audio_track()).cloned();
        audio.into_iter().chain(self.outgoing_video().cloned()).collect()
    }

    fn outgoing_video(&self) -> Option<&LocalTrack> {
        self.screen
            .as_ref()
            .and_then(|s| s.video_track())
            .or_else(|| self.camera.as_ref().and_then(|s| s.video_track()))
    }

    /// Захват с ожиданием результата на месте
    pub async fn acquire_local_stream(&mut self) -> Result<LocalMediaState, MediaError> {
        if self.is_ready() {
            return Ok(self.state());
        }
        let stream = self.devices.get_user_media().await?;
        self.adopt_local_stream(stream)
    }

    /// Захват в фоне; false, если он уже идёт или не нужен
    pub fn spawn_acquisition(&mut self) -> bool {
        if self.released || self.acquiring || self.is_ready() {
            return false;
        }
        self.acquiring = true;
        self.spawn_capture(Capture::User);
        true
    }

    pub fn on_acquired(
        &mut self,
        result: Result<LocalStream, MediaError>,
    ) -> Result<LocalMediaState, MediaError> {
        self.acquiring = false;
        match result {
            Ok(stream) => self.adopt_local_stream(stream),
            Err(e) => {
                warn!("Local media acquisition failed: {e}");
                Err(e)
            }
        }
    }

    pub fn adopt_local_stream(&mut self, stream: LocalStream) -> Result<LocalMediaState, MediaError> {
        if self.released {
            stream.stop();
            return Err(MediaError::TrackEnded);
        }
        if self.is_ready() {
            debug!("Local stream already present, dropping {}", stream.id);
            stream.stop();
            return Ok(self.state());
        }
        if stream.tracks.is_empty() {
            return Err(MediaError::DeviceNotFound("camera or microphone".into()));
        }

        // флаги могли переключить до готовности
        if let Some(audio) = stream.audio_track() {
            audio.set_enabled(!self.muted);
        }
        if let Some(video) = stream.video_track() {
            video.set_enabled(!self.video_off);
        }

        info!("Local stream {} ready with {} tracks", stream.id, stream.tracks.len());
        self.camera = Some(stream);
        Ok(self.state())
    }

    /// Только enabled-флаг: трек остаётся в соединении, переговоров нет
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        if let Some(audio) = self.camera.as_ref().and_then(|s| s.audio_track()) {
            audio.set_enabled(!self.muted);
        }
        info!("Microphone {}", if self.muted { "muted" } else { "unmuted" });
        self.muted
    }

    pub fn toggle_video(&mut self) -> bool {
        self.video_off = !self.video_off;
        let camera = self.camera.as_ref().and_then(|s| s.video_track());
        let screen = self.screen.as_ref().and_then(|s| s.video_track());
        for track in camera.into_iter().chain(screen) {
            track.set_enabled(!self.video_off);
        }
        info!("Video {}", if self.video_off { "off" } else { "on" });
        self.video_off
    }

    /// Запускает захват экрана. Ok(false): показ уже идёт.
    pub fn start_screen_share(&mut self) -> Result<bool, MediaError> {
        if self.released {
            return Err(MediaError::TrackEnded);
        }
        if self.screen.is_some() {
            return Ok(false);
        }
        if self.share_pending || self.retiring.is_some() {
            return Err(MediaError::Device(
                "screen share change already in progress".into(),
            ));
        }
        if self.camera.as_ref().and_then(|s| s.video_track()).is_none() {
            return Err(MediaError::MissingTrack("video"));
        }
        self.share_pending = true;
        self.spawn_capture(Capture::Display);
        Ok(true)
    }

    /// Подменяет исходящее видео захваченным экраном.
    /// При ошибке текущий трек не трогаем.
    pub async fn install_screen_share(
        &mut self,
        result: Result<LocalStream, MediaError>,
        link: Option<&PeerLink>,
    ) -> Result<(), MediaError> {
        self.share_pending = false;
        let stream = result?;

        if self.released || self.screen.is_some() {
            stream.stop();
            return Err(MediaError::TrackEnded);
        }
        let Some(display) = stream.video_track().cloned() else {
            stream.stop();
            return Err(MediaError::MissingTrack("video"));
        };
        if display.state() != TrackState::Live {
            stream.stop();
            return Err(MediaError::TrackEnded);
        }

        display.set_enabled(!self.video_off);
        if let Some(link) = link.filter(|l| l.has_sender(MediaKind::Video)) {
            if let Err(e) = link.replace_track(&display).await {
                stream.stop();
                return Err(MediaError::ReplaceTrack(e.to_string()));
            }
        }

        self.share_generation += 1;
        self.watch_screen_end(display, self.share_generation);
        info!("Screen share {} started", stream.id);
        self.screen = Some(stream);
        Ok(())
    }

    fn watch_screen_end(&mut self, track: LocalTrack, generation: u64) {
        let tx = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            if track.ended().await == TrackState::Ended {
                let _ = tx.send(MediaEvent::ScreenShareEnded { generation });
            }
        }));
    }

    /// Сигнал «пользователь остановил показ» от источника.
    /// Устаревшие сигналы (показ уже снят) игнорируются.
    pub fn on_screen_share_ended(&mut self, generation: u64) -> bool {
        if generation != self.share_generation || self.screen.is_none() {
            debug!("Ignoring stale screen share end signal #{generation}");
            return false;
        }
        info!("Screen share ended by the source, reverting to camera");
        self.stop_screen_share_and_revert_to_camera()
    }

    /// Снимает флаг показа и запускает повторный захват камеры.
    /// false, если показа не было.
    pub fn stop_screen_share_and_revert_to_camera(&mut self) -> bool {
        let Some(screen) = self.screen.take() else {
            return false;
        };
        // сигналы окончания от этого показа больше не действуют
        self.share_generation += 1;
        self.retiring = Some(screen);
        self.spawn_capture(Capture::CameraRevert);
        true
    }

    /// Возвращает камеру в sender. Аудио остаётся прежним; если новую камеру
    /// получить не удалось, возвращается старый видеотрек.
    pub async fn revert_to_camera(
        &mut self,
        result: Result<LocalStream, MediaError>,
        link: Option<&PeerLink>,
    ) -> Result<(), MediaError> {
        let Some(screen) = self.retiring.take() else {
            MediaEvent::CameraReacquired(result).discard();
            return Ok(());
        };

        let old_video = self.camera.as_ref().and_then(|s| s.video_track()).cloned();
        let fresh_video = match result {
            Ok(fresh) => {
                for audio in fresh.tracks.iter().filter(|t| t.kind() == MediaKind::Audio) {
                    audio.stop();
                }
                fresh.video_track().cloned()
            }
            Err(e) => {
                warn!("Camera re-acquisition failed ({e}), keeping the previous camera track");
                None
            }
        };

        let mut installed: Option<LocalTrack> = None;
        for video in fresh_video.iter().chain(old_video.iter()) {
            video.set_enabled(!self.video_off);
            match link.filter(|l| l.has_sender(MediaKind::Video)) {
                Some(link) => match link.replace_track(video).await {
                    Ok(()) => {
                        installed = Some(video.clone());
                        break;
                    }
                    Err(e) => warn!("Failed to restore camera track {}: {e}", video.id()),
                },
                None => {
                    installed = Some(video.clone());
                    break;
                }
            }
        }
        screen.stop();

        if let Some(fresh) = &fresh_video {
            if installed.as_ref().map(|t| t.id()) != Some(fresh.id()) {
                fresh.stop();
            }
        }

        let Some(video) = installed else {
            return Err(MediaError::ReplaceTrack("no camera track to restore".into()));
        };

        let replaced_old = old_video.as_ref().is_some_and(|old| old.id() != video.id());
        if replaced_old || old_video.is_none() {
            if let Some(old) = &old_video {
                old.stop();
            }
            if let Some(camera) = self.camera.as_mut() {
                camera.tracks.retain(|t| t.kind() != MediaKind::Video);
                camera.tracks.push(video.clone());
            }
        }
        info!("Reverted outgoing video to camera track {}", video.id());
        Ok(())
    }

    /// Останавливает все треки, включая показ экрана, и фоновые захваты
    pub fn release(&mut self) {
        self.released = true;
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        for stream in [self.camera.take(), self.screen.take(), self.retiring.take()]
            .into_iter()
            .flatten()
        {
            stream.stop();
        }
        self.acquiring = false;
        self.share_pending = false;
        debug!("Local media released");
    }

    fn spawn_capture(&mut self, capture: Capture) {
        self.tasks.retain(|h| !h.is_finished());
        let devices = self.devices.clone();
        let tx = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            let event = match capture {
                Capture::User => MediaEvent::Acquired(devices.get_user_media().await),
                Capture::Display => MediaEvent::DisplayAcquired(devices.get_display_media().await),
                Capture::CameraRevert => {
                    MediaEvent::CameraReacquired(devices.get_user_media().await)
                }
            };
            if let Err(mpsc::error::SendError(event)) = tx.send(event) {
                event.discard();
            }
        }));
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}
