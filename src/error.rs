use thiserror::Error;

/// Ошибки транспорта до сигнального сервера
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("transport dropped: {0}")]
    Dropped(String),

    #[error("reconnection gave up after {0} attempts")]
    RetriesExhausted(u32),

    #[error("signaling channel is closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Ошибки захвата локальных устройств
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("no {0} device available")]
    DeviceNotFound(String),

    #[error("track has ended")]
    TrackEnded,

    #[error("capture device error: {0}")]
    Device(String),

    #[error("failed to replace outgoing track: {0}")]
    ReplaceTrack(String),

    #[error("local stream has no {0} track")]
    MissingTrack(&'static str),
}

/// Ошибки нижележащего peer connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),

    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },

    #[error("no sender for {0} track")]
    NoSender(&'static str),

    #[error("peer connection is closed")]
    Closed,
}

impl PeerError {
    pub fn op(op: &'static str, err: impl std::fmt::Display) -> Self {
        PeerError::Operation {
            op,
            reason: err.to_string(),
        }
    }
}

/// Сбой SDP/ICE шага; соединение с пиром разбирается, координатор уходит в Idle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation with {peer} failed while {stage}: {source}")]
    Anomaly {
        peer: String,
        stage: &'static str,
        #[source]
        source: PeerError,
    },

    #[error("failed to relay {0} message: {1}")]
    Relay(&'static str, TransportError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid signaling url {0}: {1}")]
    SignalUrl(String, String),

    #[error("ice server url cannot be empty")]
    EmptyIceUrl,

    #[error("turn server {0} requires username and credential")]
    TurnCredentials(String),

    #[error("invalid value for {0}: {1}")]
    Env(&'static str, String),
}

/// Общая ошибка звонка, которую видит слой представления
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("already in room {0}")]
    AlreadyJoined(String),

    #[error("not in a room")]
    NotJoined,

    #[error("call session is shutting down")]
    SessionClosed,
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
