use crate::error::PeerError;
use crate::media::{LocalTrack, MediaKind};
use crate::peer::ice::apply_pending_candidates;
use crate::peer::state::{NegotiationRole, PeerLinkState};
use crate::peer::types::{
    IceCandidate, PeerConnectionStatus, PeerIdentity, RemoteTrack, RemoteTrackInfo,
    SessionDescription,
};
use crate::utils::random_id;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Нижележащее peer connection. Реализация для webrtc-rs в `connection.rs`.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Подмена трека у уже согласованного sender'а, без нового offer/answer
    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self);
}

/// Колбэки соединения приходят сюда, помеченные id соединения
pub type PeerEventSender = mpsc::UnboundedSender<PeerLinkEvent>;

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        link_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[derive(Debug, Clone)]
pub struct PeerLinkEvent {
    pub link_id: String,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerConnectionStatus),
}

/// Локальный кандидат, готовый к отправке конкретному пиру
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCandidate {
    pub candidate: IceCandidate,
    pub target: PeerIdentity,
}

/// Одно соединение с удалённым участником.
///
/// Держит две очереди кандидатов: исходящие ждут, пока станет известен
/// адресат, входящие ждут установки remote description.
pub struct PeerLink {
    id: String,
    conn: Arc<dyn PeerConnection>,
    role: NegotiationRole,
    remote: Option<PeerIdentity>,
    status: PeerConnectionStatus,
    remote_description_set: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
    local_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
    senders: HashSet<MediaKind>,
}

impl PeerLink {
    pub async fn create(
        factory: &dyn PeerConnectionFactory,
        events: PeerEventSender,
        role: NegotiationRole,
    ) -> Result<Self, PeerError> {
        let id = random_id();
        let conn = factory.create(&id, events).await?;
        debug!("Peer link {id} created as {role:?}");
        Ok(Self {
            id,
            conn,
            role,
            remote: None,
            status: PeerConnectionStatus::New,
            remote_description_set: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
            local_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            senders: HashSet::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn status(&self) -> PeerConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerConnectionStatus::Connected
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn has_sender(&self, kind: MediaKind) -> bool {
        self.senders.contains(&kind)
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn snapshot(&self) -> PeerLinkState {
        PeerLinkState {
            connection_status: self.status,
            remote_identity: self.remote.clone(),
            remote_tracks: self.remote_tracks.iter().map(RemoteTrackInfo::from).collect(),
        }
    }

    /// Адресат стал известен: отдаём накопленные исходящие кандидаты
    pub fn set_remote_identity(&mut self, peer: PeerIdentity) -> Vec<OutboundCandidate> {
        self.remote = Some(peer.clone());
        self.pending_local
            .drain(..)
            .map(|candidate| OutboundCandidate {
                candidate,
                target: peer.clone(),
            })
            .collect()
    }

    pub async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), PeerError> {
        if self.status == PeerConnectionStatus::Closed {
            return Err(PeerError::Closed);
        }
        self.conn.add_track(track).await?;
        self.senders.insert(track.kind());
        debug!("Link {}: added local {} track {}", self.id, track.kind().as_str(), track.id());
        Ok(())
    }

    pub async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        if self.status == PeerConnectionStatus::Closed {
            return Err(PeerError::Closed);
        }
        if !self.has_sender(track.kind()) {
            return Err(PeerError::NoSender(track.kind().as_str()));
        }
        self.conn.replace_track(track.kind(), track).await
    }

    /// Offer с уже применённым local description
    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.status = PeerConnectionStatus::Negotiating;
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Применяет чужой offer, затем строит и применяет answer
    pub async fn create_answer(
        &mut self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.status = PeerConnectionStatus::Negotiating;
        self.set_remote_description(remote).await?;
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.conn.set_remote_description(desc).await?;
        self.remote_description_set = true;

        let applied = apply_pending_candidates(self.conn.as_ref(), &mut self.pending_remote).await?;
        if applied > 0 {
            info!("Link {}: replayed {applied} queued remote candidates", self.id);
        }
        Ok(())
    }

    /// До remote description кандидат только ставится в очередь
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.remote_description_set {
            debug!("Link {}: remote description not set yet, queuing candidate", self.id);
            self.pending_remote.push(candidate);
            return Ok(());
        }
        self.conn.add_ice_candidate(candidate).await
    }

    /// Локальный кандидат от ICE. Возвращает готовое к отправке сообщение,
    /// если адресат уже известен.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Option<OutboundCandidate> {
        self.local_candidates.push(candidate.clone());
        match &self.remote {
            Some(target) => Some(OutboundCandidate {
                candidate,
                target: target.clone(),
            }),
            None => {
                self.pending_local.push(candidate);
                None
            }
        }
    }

    pub fn on_remote_track(&mut self, track: RemoteTrack) {
        self.remote_tracks.retain(|t| t.id != track.id);
        self.remote_tracks.push(track);
    }

    /// Возвращает true, если статус действительно изменился
    pub fn on_connection_state(&mut self, status: PeerConnectionStatus) -> bool {
        if self.status == status || self.status == PeerConnectionStatus::Closed {
            return false;
        }
        self.status = status;
        true
    }

    pub async fn close(&mut self) {
        if self.status == PeerConnectionStatus::Closed {
            return;
        }
        self.status = PeerConnectionStatus::Closed;
        self.pending_local.clear();
        self.pending_remote.clear();
        self.remote_tracks.clear();
        self.conn.close().await;
        info!("Peer link {} closed", self.id);
    }
}
