use crate::peer::types::{PeerConnectionStatus, PeerIdentity, RemoteTrackInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ========== CONSTANTS ==========

/// Период ожидания восстановления после disconnected
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Сколько кандидатов держим для ещё не созданного соединения
pub const MAX_EARLY_CANDIDATES: usize = 64;

/// Роль стороны в рукопожатии. Кто первым получил peer-joined, тот и offerer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Снимок состояния соединения с пиром
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerLinkState {
    pub connection_status: PeerConnectionStatus,
    pub remote_identity: Option<PeerIdentity>,
    pub remote_tracks: Vec<RemoteTrackInfo>,
}
