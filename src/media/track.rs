use crate::error::MediaError;
use crate::utils::random_id;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

/// Жизненный цикл трека. `Ended` выставляет только источник
/// (например, пользователь остановил показ экрана системной кнопкой),
/// `Stopped` означает, что трек остановили мы сами.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Stopped,
    Ended,
}

struct Inner {
    id: String,
    kind: MediaKind,
    source: TrackSource,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    rtc: Arc<TrackLocalStaticSample>,
}

/// Локальный трек: webrtc sample-трек плюс флаг `enabled` и сигнал окончания.
/// Клоны ссылаются на один и тот же трек.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(
        kind: MediaKind,
        source: TrackSource,
        codec: RTCRtpCodecCapability,
        stream_id: &str,
    ) -> Self {
        let id = format!("{}-{}", kind.as_str(), random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(Inner {
                id,
                kind,
                source,
                enabled: AtomicBool::new(true),
                state,
                rtc,
            }),
        }
    }

    /// Opus, 48 kHz
    pub fn microphone(stream_id: &str) -> Self {
        Self::new(
            MediaKind::Audio,
            TrackSource::Microphone,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            stream_id,
        )
    }

    pub fn camera(stream_id: &str) -> Self {
        Self::new(
            MediaKind::Video,
            TrackSource::Camera,
            Self::vp8(),
            stream_id,
        )
    }

    pub fn display(stream_id: &str) -> Self {
        Self::new(
            MediaKind::Video,
            TrackSource::Display,
            Self::vp8(),
            stream_id,
        )
    }

    fn vp8() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Выключенный трек продолжает существовать в соединении, но сэмплы не уходят
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Остановка нами; наблюдатели окончания увидят `Stopped`
    pub fn stop(&self) {
        self.finish(TrackState::Stopped);
    }

    /// Окончание со стороны источника
    pub fn end(&self) {
        self.finish(TrackState::Ended);
    }

    fn finish(&self, to: TrackState) {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Ждёт, пока трек перестанет быть живым, и возвращает причину
    pub async fn ended(&self) -> TrackState {
        let mut rx = self.inner.state.subscribe();
        let reason = match rx.wait_for(|state| *state != TrackState::Live).await {
            Ok(state) => *state,
            Err(_) => TrackState::Stopped,
        };
        reason
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.rtc.clone()
    }

    /// Источник пишет сюда закодированные кадры.
    /// Пока трек выключен, кадры молча отбрасываются.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if !self.is_live() {
            return Err(MediaError::TrackEnded);
        }
        if !self.is_enabled() {
            return Ok(());
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner
            .rtc
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::Device(e.to_string()))
    }
}

/// Набор треков одного захвата (getUserMedia / getDisplayMedia)
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Пара микрофон + камера с общим stream id
    pub fn camera_and_microphone() -> Self {
        let id = format!("stream-{}", random_id());
        let tracks = vec![LocalTrack::microphone(&id), LocalTrack::camera(&id)];
        Self::new(id, tracks)
    }

    pub fn screen() -> Self {
        let id = format!("screen-{}", random_id());
        let tracks = vec![LocalTrack::display(&id)];
        Self::new(id, tracks)
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
