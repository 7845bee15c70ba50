use crate::error::MediaError;
use crate::media::track::LocalStream;
use async_trait::async_trait;

/// Доступ к устройствам захвата. Реализует встраивающее приложение:
/// оно же пишет кадры в треки возвращённых потоков.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Камера и микрофон
    async fn get_user_media(&self) -> Result<LocalStream, MediaError>;

    /// Захват экрана. Окончание показа системной кнопкой сообщается через
    /// `LocalTrack::end()` на видеотреке.
    async fn get_display_media(&self) -> Result<LocalStream, MediaError>;
}
