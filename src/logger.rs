use crate::peer::types::RemoteTrack;
use crate::signaling::SignalingConnectionState;
use chrono::{DateTime, Local};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

pub const DEFAULT_LOG_FILTER: &str = "roomcall=debug";

fn logging_enabled() -> bool {
    // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
    crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING
}

/// Ставит fmt-подписчик tracing. Повторный вызов ничего не делает.
pub fn init_logging() {
    if !logging_enabled() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
            init.candidate, init.sdp_mid, init.sdp_mline_index, init.username_fragment
        );
    }
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Информационные сообщения сервера о комнате
#[derive(Debug, Clone, PartialEq)]
pub enum RoomNotice {
    Created(Value),
    Joined(Value),
    Full(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// offer/answer пришёл не в том состоянии и был проигнорирован
    ProtocolViolation,
    /// SDP/ICE шаг упал, соединение разобрано
    NegotiationAnomaly,
    /// Лишний участник при уже занятом слоте
    IgnoredPeer,
    UnknownEvent,
    /// Локальные треки появились уже после начала рукопожатия
    LateLocalMedia,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub at: DateTime<Local>,
    pub kind: DiagnosticKind,
    pub detail: String,
}

/// События звонка для слоя представления
#[derive(Debug, Clone)]
pub enum CallEvent {
    Connected,
    Disconnected,
    ConnectionProblem,
    ConnectionRecovering,
    ConnectionRecovered,
    ConnectionFailed,
    SignalingState(SignalingConnectionState),
    Room(RoomNotice),
    RemoteTrack(RemoteTrack),
    LocalMediaReady,
    ScreenShareEnded,
    Diagnostic(Diagnostic),
    Error(String),
}

/// Раздаёт события всем подписчикам; без подписчиков события теряются
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        debug!("emit {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn emit_connected(&self) {
        info!("Peer connected");
        self.emit(CallEvent::Connected);
    }

    pub fn emit_disconnected(&self) {
        info!("Peer disconnected");
        self.emit(CallEvent::Disconnected);
    }

    pub fn emit_connection_problem(&self) {
        warn!("Connection issues detected");
        self.emit(CallEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovering(&self) {
        info!("Connection is recovering");
        self.emit(CallEvent::ConnectionRecovering);
    }

    pub fn emit_connection_recovered(&self) {
        info!("Connection recovered");
        self.emit(CallEvent::ConnectionRecovered);
    }

    pub fn emit_connection_failed(&self) {
        warn!("Connection recovery failed");
        self.emit(CallEvent::ConnectionFailed);
    }

    pub fn diagnostic(&self, kind: DiagnosticKind, detail: impl Into<String>) {
        let detail = detail.into();
        warn!("{kind:?}: {detail}");
        self.emit(CallEvent::Diagnostic(Diagnostic {
            at: Local::now(),
            kind,
            detail,
        }));
    }
}
