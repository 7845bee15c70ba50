use crate::error::{NegotiationError, PeerError};
use crate::logger::{DiagnosticKind, EventEmitter};
use crate::media::LocalTrack;
use crate::negotiation::state::NegotiationState;
use crate::peer::ice::analyze_candidates;
use crate::peer::link::{
    OutboundCandidate, PeerConnectionFactory, PeerEventKind, PeerEventSender, PeerLink,
    PeerLinkEvent,
};
use crate::peer::state::{NegotiationRole, PeerLinkState, MAX_EARLY_CANDIDATES};
use crate::peer::types::{
    IceCandidate, PeerConnectionStatus, PeerIdentity, RemoteTrack, SessionDescription,
};
use crate::signaling::{ClientMessage, SignalSink};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Что изменилось в соединении после колбэка
#[derive(Debug, Clone)]
pub enum LinkChange {
    Status {
        from: PeerConnectionStatus,
        to: PeerConnectionStatus,
    },
    RemoteTrack(RemoteTrack),
}

/// Ведёт обмен offer/answer/candidate с единственным удалённым участником.
/// Все методы вызываются из одной задачи, по одному событию за раз.
pub struct NegotiationCoordinator {
    state: NegotiationState,
    link: Option<PeerLink>,
    pending_offer: Option<PeerIdentity>,
    early_candidates: Vec<(PeerIdentity, IceCandidate)>,
    signal: Arc<dyn SignalSink>,
    factory: Arc<dyn PeerConnectionFactory>,
    peer_events: PeerEventSender,
    emitter: EventEmitter,
}

impl NegotiationCoordinator {
    pub fn new(
        signal: Arc<dyn SignalSink>,
        factory: Arc<dyn PeerConnectionFactory>,
        peer_events: PeerEventSender,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            state: NegotiationState::Idle,
            link: None,
            pending_offer: None,
            early_candidates: Vec::new(),
            signal,
            factory,
            peer_events,
            emitter,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn link(&self) -> Option<&PeerLink> {
        self.link.as_ref()
    }

    pub fn pending_target(&self) -> Option<&str> {
        self.pending_offer.as_deref()
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.link
            .as_ref()
            .and_then(|l| l.remote())
            .or(self.pending_offer.as_deref())
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_connected())
    }

    pub fn link_state(&self) -> PeerLinkState {
        self.link.as_ref().map(|l| l.snapshot()).unwrap_or_default()
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state != next {
            debug!("Negotiation {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Сигнал присутствия второго участника. `local` есть, только если
    /// локальные треки уже готовы.
    pub async fn peer_joined(
        &mut self,
        peer: PeerIdentity,
        local: Option<Vec<LocalTrack>>,
    ) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::AwaitingLocalMedia => {
                if let Some(previous) = self.pending_offer.replace(peer.clone()) {
                    if previous != peer {
                        info!("Pending offer target {previous} superseded by {peer}");
                    }
                }
                Ok(())
            }
            s if s.is_vacant() => match local {
                Some(tracks) => self.start_offer(peer, tracks).await,
                None => {
                    info!("Peer {peer} joined before local media is ready, deferring offer");
                    self.pending_offer = Some(peer);
                    self.set_state(NegotiationState::AwaitingLocalMedia);
                    Ok(())
                }
            },
            s => {
                self.emitter.diagnostic(
                    DiagnosticKind::IgnoredPeer,
                    format!("peer {peer} joined while {s:?}, slot already taken"),
                );
                Ok(())
            }
        }
    }

    /// Локальные треки готовы: отложенный offer уходит ровно один раз.
    ///
    /// Если рукопожатие уже прошло без них (answerer ответил до готовности
    /// камеры), треки добавляются в соединение без нового offer/answer.
    /// В согласованном SDP для них нет секций, поэтому удалённая сторона их
    /// не получит; об этом сообщает диагностика `LateLocalMedia`.
    pub async fn local_media_ready(
        &mut self,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::AwaitingLocalMedia {
            if let Some(peer) = self.pending_offer.take() {
                return self.start_offer(peer, tracks).await;
            }
            self.set_state(NegotiationState::Idle);
            return Ok(());
        }

        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let missing: Vec<&LocalTrack> = tracks
            .iter()
            .filter(|t| !link.has_sender(t.kind()))
            .collect();
        let mut added = 0;
        let mut failure = None;
        for track in missing {
            if let Err(e) = link.add_local_track(track).await {
                failure = Some(anomaly(link.remote(), "attaching late local media", e));
                break;
            }
            added += 1;
        }
        if let Some(err) = failure {
            return self.abort(err).await;
        }
        if added > 0 {
            self.emitter.diagnostic(
                DiagnosticKind::LateLocalMedia,
                format!("{added} local tracks attached after the handshake, not renegotiated"),
            );
        }
        Ok(())
    }

    async fn start_offer(
        &mut self,
        peer: PeerIdentity,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        self.set_state(NegotiationState::Offering);
        info!("Starting offer to {peer}");

        let result = self.offer_steps(&peer, &tracks).await;
        match result {
            Ok(()) => {
                self.set_state(NegotiationState::AwaitingAnswer);
                Ok(())
            }
            Err(e) => self.abort(e).await,
        }
    }

    async fn offer_steps(
        &mut self,
        peer: &PeerIdentity,
        tracks: &[LocalTrack],
    ) -> Result<(), NegotiationError> {
        let mut link = PeerLink::create(
            self.factory.as_ref(),
            self.peer_events.clone(),
            NegotiationRole::Offerer,
        )
        .await
        .map_err(|e| anomaly(Some(peer.as_str()), "creating peer link", e))?;

        for track in tracks {
            if let Err(e) = link.add_local_track(track).await {
                link.close().await;
                return Err(anomaly(Some(peer.as_str()), "adding local track", e));
            }
        }
        let flushed = link.set_remote_identity(peer.clone());
        self.adopt_early_candidates(&mut link, peer).await;
        self.link = Some(link);
        self.send_candidates(flushed)?;

        let link = self.link_mut()?;
        let offer = link
            .create_offer()
            .await
            .map_err(|e| anomaly(Some(peer.as_str()), "creating offer", e))?;
        self.relay(ClientMessage::Offer {
            offer,
            target: peer.clone(),
        })
    }

    /// Offer от другой стороны принимается только в свободном слоте
    pub async fn remote_offer(
        &mut self,
        from: PeerIdentity,
        offer: SessionDescription,
        local: Option<Vec<LocalTrack>>,
    ) -> Result<(), NegotiationError> {
        if !self.state.is_vacant() {
            self.protocol_violation("offer", &from);
            return Ok(());
        }

        self.set_state(NegotiationState::Answering);
        info!("Answering offer from {from}");
        let tracks = local.unwrap_or_default();
        match self.answer_steps(&from, offer, &tracks).await {
            Ok(()) => {
                self.set_state(NegotiationState::Established);
                Ok(())
            }
            Err(e) => self.abort(e).await,
        }
    }

    async fn answer_steps(
        &mut self,
        from: &PeerIdentity,
        offer: SessionDescription,
        tracks: &[LocalTrack],
    ) -> Result<(), NegotiationError> {
        let mut link = PeerLink::create(
            self.factory.as_ref(),
            self.peer_events.clone(),
            NegotiationRole::Answerer,
        )
        .await
        .map_err(|e| anomaly(Some(from.as_str()), "creating peer link", e))?;

        for track in tracks {
            if let Err(e) = link.add_local_track(track).await {
                link.close().await;
                return Err(anomaly(Some(from.as_str()), "adding local track", e));
            }
        }
        let flushed = link.set_remote_identity(from.clone());
        self.adopt_early_candidates(&mut link, from).await;
        self.link = Some(link);
        self.send_candidates(flushed)?;

        let link = self.link_mut()?;
        let answer = link
            .create_answer(offer)
            .await
            .map_err(|e| anomaly(Some(from.as_str()), "answering offer", e))?;
        self.relay(ClientMessage::Answer {
            answer,
            target: from.clone(),
        })
    }

    pub async fn remote_answer(
        &mut self,
        from: PeerIdentity,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let expected = self.state == NegotiationState::AwaitingAnswer
            && self.link.as_ref().and_then(|l| l.remote()) == Some(from.as_str());
        if !expected {
            self.protocol_violation("answer", &from);
            return Ok(());
        }

        let result = match self.link.as_mut() {
            Some(link) => link
                .set_remote_description(answer)
                .await
                .map_err(|e| anomaly(Some(from.as_str()), "applying answer", e)),
            None => Err(anomaly(Some(from.as_str()), "applying answer", PeerError::Closed)),
        };
        match result {
            Ok(()) => {
                info!("Handshake with {from} complete");
                self.set_state(NegotiationState::Established);
                Ok(())
            }
            Err(e) => self.abort(e).await,
        }
    }

    /// Кандидат от пира. Без соединения он ждёт в очереди ранних кандидатов.
    pub async fn remote_candidate(
        &mut self,
        from: PeerIdentity,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let result = match self.link.as_mut() {
            None => {
                if self.early_candidates.len() >= MAX_EARLY_CANDIDATES {
                    self.early_candidates.remove(0);
                }
                debug!("No peer link yet, holding candidate from {from}");
                self.early_candidates.push((from, candidate));
                return Ok(());
            }
            Some(link) if link.remote() != Some(from.as_str()) => {
                debug!("Dropping candidate from unrelated peer {from}");
                return Ok(());
            }
            Some(link) => link.add_remote_candidate(candidate).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = anomaly(Some(from.as_str()), "adding remote candidate", e);
                self.abort(err).await
            }
        }
    }

    async fn adopt_early_candidates(&mut self, link: &mut PeerLink, peer: &str) {
        let early = std::mem::take(&mut self.early_candidates);
        for (from, candidate) in early {
            if from != peer {
                continue;
            }
            // remote description ещё не установлен: кандидат только встаёт в очередь
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!("Failed to queue early candidate from {from}: {e}");
            }
        }
    }

    /// Пир ушёл. Возвращает true, если было что разбирать.
    pub async fn peer_left(&mut self, peer: Option<PeerIdentity>) -> bool {
        let current = self.remote_peer().map(str::to_owned);
        if let (Some(left), Some(current)) = (&peer, &current) {
            if left != current {
                debug!("Ignoring peer-left for unrelated peer {left}");
                return false;
            }
        }
        if let Some(left) = &peer {
            self.early_candidates.retain(|(from, _)| from != left);
        }
        if current.is_none() && self.link.is_none() {
            return false;
        }
        info!("Peer {} left, closing link", current.as_deref().unwrap_or("?"));
        self.close().await;
        true
    }

    /// Разбирает соединение в любом состоянии, без ошибок
    pub async fn close(&mut self) {
        self.set_state(NegotiationState::Closing);
        self.pending_offer = None;
        self.early_candidates.clear();
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.set_state(NegotiationState::Closed);
    }

    /// Колбэк соединения. События от уже закрытых соединений отбрасываются.
    pub fn link_event(&mut self, event: PeerLinkEvent) -> Option<LinkChange> {
        let link = match self.link.as_mut() {
            Some(link) if link.id() == event.link_id => link,
            _ => {
                debug!("Dropping event from stale peer link {}", event.link_id);
                return None;
            }
        };

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(out) = link.on_local_candidate(candidate) {
                    if let Err(e) = self.send_candidates(vec![out]) {
                        warn!("{e}");
                    }
                }
                None
            }
            PeerEventKind::GatheringComplete => {
                info!("ICE candidate gathering completed");
                analyze_candidates(link.local_candidates());
                None
            }
            PeerEventKind::RemoteTrack(track) => {
                link.on_remote_track(track.clone());
                Some(LinkChange::RemoteTrack(track))
            }
            PeerEventKind::ConnectionState(status) => {
                let from = link.status();
                link.on_connection_state(status)
                    .then_some(LinkChange::Status { from, to: status })
            }
        }
    }

    fn send_candidates(&self, out: Vec<OutboundCandidate>) -> Result<(), NegotiationError> {
        for OutboundCandidate { candidate, target } in out {
            self.relay(ClientMessage::IceCandidate { candidate, target })?;
        }
        Ok(())
    }

    fn relay(&self, msg: ClientMessage) -> Result<(), NegotiationError> {
        let event = msg.event();
        self.signal
            .send(msg)
            .map_err(|e| NegotiationError::Relay(event, e))
    }

    fn link_mut(&mut self) -> Result<&mut PeerLink, NegotiationError> {
        self.link
            .as_mut()
            .ok_or_else(|| anomaly(None, "negotiating", PeerError::Closed))
    }

    fn protocol_violation(&self, what: &str, from: &str) {
        self.emitter.diagnostic(
            DiagnosticKind::ProtocolViolation,
            format!("ignoring {what} from {from} while {:?}", self.state),
        );
    }

    /// Сбой шага: соединение разбирается, слот снова свободен
    async fn abort(&mut self, err: NegotiationError) -> Result<(), NegotiationError> {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.pending_offer = None;
        self.set_state(NegotiationState::Idle);
        self.emitter
            .diagnostic(DiagnosticKind::NegotiationAnomaly, err.to_string());
        Err(err)
    }
}

fn anomaly(peer: Option<&str>, stage: &'static str, source: PeerError) -> NegotiationError {
    NegotiationError::Anomaly {
        peer: peer.unwrap_or("?").to_string(),
        stage,
        source,
    }
}
