use crate::config::CallConfig;
use crate::error::{CallError, NegotiationError, Result};
use crate::logger::{CallEvent, DiagnosticKind, EventEmitter, RoomNotice};
use crate::media::{LocalTrack, MediaController, MediaDevices, MediaEvent};
use crate::negotiation::{LinkChange, NegotiationCoordinator, NegotiationState};
use crate::peer::types::{PeerConnectionStatus, PeerIdentity, RemoteTrackInfo, RoomId};
use crate::peer::{PeerConnectionFactory, PeerLinkEvent, RtcPeerConnectionFactory};
use crate::signaling::{
    ServerMessage, SignalTransport, SignalingChannel, SignalingConnectionState, SignalingEvent,
    SignalingEvents, WsTransport,
};
use crate::utils::signal_ws_url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Производное состояние звонка для слоя представления
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CallStatus {
    pub room: Option<RoomId>,
    pub signaling: SignalingConnectionState,
    pub negotiation: NegotiationState,
    pub is_connected: bool,
    pub local_media_ready: bool,
    pub muted: bool,
    pub video_off: bool,
    pub sharing_screen: bool,
    pub remote_peer: Option<PeerIdentity>,
    pub remote_tracks: Vec<RemoteTrackInfo>,
    pub room_full: bool,
    pub last_error: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    ToggleMute(Reply<bool>),
    ToggleVideo(Reply<bool>),
    StartScreenShare(Reply<()>),
    StopScreenShare(Reply<bool>),
    RetryLocalMedia(Reply<()>),
    Leave(oneshot::Sender<()>),
}

struct Active {
    room: RoomId,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Звонок в одной комнате: сигнальный канал, локальные треки и рукопожатие
/// с единственным пиром. Всё состояние живёт в отдельной задаче; методы
/// только отправляют ей команды.
pub struct CallSession {
    config: CallConfig,
    transport: Arc<dyn SignalTransport>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    emitter: EventEmitter,
    status: Arc<watch::Sender<CallStatus>>,
    active: Mutex<Option<Active>>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalTransport>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (status, _) = watch::channel(CallStatus::default());
        Self {
            config,
            transport,
            devices,
            peers,
            emitter: EventEmitter::default(),
            status: Arc::new(status),
            active: Mutex::new(None),
        }
    }

    /// WebSocket до сигнального сервера и webrtc-rs соединения
    pub fn with_defaults(config: CallConfig, devices: Arc<dyn MediaDevices>) -> Self {
        let peers = Arc::new(RtcPeerConnectionFactory::new(config.ice_servers.clone()));
        Self::new(config, Arc::new(WsTransport), devices, peers)
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.emitter.subscribe()
    }

    /// Подключение к комнате. Захват камеры и подключение к серверу идут
    /// параллельно; метод не ждёт ни того, ни другого.
    pub async fn join(&self, room: impl Into<RoomId>) -> Result<()> {
        let room = room.into();
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if !current.task.is_finished() {
                return if current.room == room {
                    debug!("Already in room {room}");
                    Ok(())
                } else {
                    Err(CallError::AlreadyJoined(current.room.clone()))
                };
            }
        }

        let url = signal_ws_url(&self.config.signal_url)?;
        info!("Joining room {room} via {url}");

        let (channel, signaling) =
            SignalingChannel::connect(url, self.config.reconnect.clone(), self.transport.clone());
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            room: room.clone(),
            grace_period: self.config.peer_grace_period(),
            commands: cmd_rx,
            coordinator: NegotiationCoordinator::new(
                channel.clone(),
                self.peers.clone(),
                peer_tx,
                self.emitter.clone(),
            ),
            channel,
            signaling,
            media: MediaController::new(self.devices.clone(), media_tx),
            media_rx,
            peer_rx,
            emitter: self.emitter.clone(),
            status: self.status.clone(),
            grace_deadline: None,
            share_reply: None,
            was_connected: false,
            room_full: false,
            last_error: None,
        };

        *active = Some(Active {
            room,
            commands: cmd_tx,
            task: tokio::spawn(driver.run()),
        });
        Ok(())
    }

    /// Разбирает звонок в любом состоянии. Повторный вызов и вызов до
    /// `join` ничего не делают.
    pub async fn leave(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        info!("Leaving room {}", active.room);
        let (tx, rx) = oneshot::channel();
        if active.commands.send(Command::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = active.task.await {
            warn!("Call task ended abnormally: {e}");
        }
    }

    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(Command::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(Command::ToggleVideo).await
    }

    /// Ждёт, пока пользователь выберет экран и трек будет подменён
    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(Command::StartScreenShare).await
    }

    /// false, если показа не было
    pub async fn stop_screen_share(&self) -> Result<bool> {
        self.request(Command::StopScreenShare).await
    }

    /// Повторный захват камеры после отказа; результат виден в статусе
    pub async fn retry_local_media(&self) -> Result<()> {
        self.request(Command::RetryLocalMedia).await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let commands = {
            let active = self.active.lock().await;
            active
                .as_ref()
                .map(|a| a.commands.clone())
                .ok_or(CallError::NotJoined)?
        };
        let (tx, rx) = oneshot::channel();
        commands
            .send(make(tx))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }
}

struct Driver {
    room: RoomId,
    grace_period: std::time::Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    channel: Arc<SignalingChannel>,
    signaling: SignalingEvents,
    media: MediaController,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    coordinator: NegotiationCoordinator,
    peer_rx: mpsc::UnboundedReceiver<PeerLinkEvent>,
    emitter: EventEmitter,
    status: Arc<watch::Sender<CallStatus>>,
    /// Отложенная проверка восстановления после disconnected
    grace_deadline: Option<Instant>,
    share_reply: Option<Reply<()>>,
    was_connected: bool,
    room_full: bool,
    last_error: Option<String>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        if let Err(e) = self.channel.join_room(self.room.clone()) {
            self.fail(e.into());
        }
        self.media.spawn_acquisition();
        self.publish();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Leave(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.signaling.recv() => self.on_signaling(event).await,
                Some(event) = self.peer_rx.recv() => self.on_peer_event(event),
                Some(event) = self.media_rx.recv() => self.on_media(event).await,
                _ = sleep_until_opt(self.grace_deadline) => self.on_grace_expired(),
            }
            self.publish();
        }
    }

    fn local_tracks(&self) -> Option<Vec<LocalTrack>> {
        self.media
            .is_ready()
            .then(|| self.media.outgoing_tracks())
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::ToggleMute(reply) => {
                let _ = reply.send(Ok(self.media.toggle_mute()));
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(Ok(self.media.toggle_video()));
            }
            Command::StartScreenShare(reply) => match self.media.start_screen_share() {
                Ok(true) => self.share_reply = Some(reply),
                Ok(false) => {
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    warn!("Screen share not started: {e}");
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::StopScreenShare(reply) => {
                let stopped = self.media.stop_screen_share_and_revert_to_camera();
                if stopped {
                    self.emitter.emit(CallEvent::ScreenShareEnded);
                }
                let _ = reply.send(Ok(stopped));
            }
            Command::RetryLocalMedia(reply) => {
                if self.media.spawn_acquisition() {
                    info!("Retrying local media acquisition");
                }
                let _ = reply.send(Ok(()));
            }
            Command::Leave(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::State(state) => {
                self.emitter.emit(CallEvent::SignalingState(state));
                // после переподключения у нас будет новый id, старое соединение мертво
                let dropped = matches!(
                    state,
                    SignalingConnectionState::Reconnecting | SignalingConnectionState::Failed
                );
                if dropped && !self.coordinator.state().is_vacant() {
                    warn!("Signaling connection lost ({state:?}), closing peer link");
                    self.coordinator.close().await;
                }
            }
            SignalingEvent::Error(e) => self.fail(e.into()),
            SignalingEvent::Message(msg) => self.on_message(msg).await,
        }
    }

    async fn on_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::PeerJoined { peer_id } => {
                info!("Peer {peer_id} joined room {}", self.room);
                let local = self.local_tracks();
                let result = self.coordinator.peer_joined(peer_id, local).await;
                self.record(result);
            }
            ServerMessage::PeerLeft { peer_id } => {
                self.coordinator.peer_left(peer_id).await;
            }
            ServerMessage::Offer { offer, from } => {
                let local = self.local_tracks();
                let result = self.coordinator.remote_offer(from, offer, local).await;
                self.record(result);
            }
            ServerMessage::Answer { answer, from } => {
                let result = self.coordinator.remote_answer(from, answer).await;
                self.record(result);
            }
            ServerMessage::IceCandidate { candidate, from } => {
                let result = self.coordinator.remote_candidate(from, candidate).await;
                self.record(result);
            }
            ServerMessage::RoomCreated(data) => {
                self.room_full = false;
                self.emitter.emit(CallEvent::Room(RoomNotice::Created(data)));
            }
            ServerMessage::RoomJoined(data) => {
                self.room_full = false;
                self.emitter.emit(CallEvent::Room(RoomNotice::Joined(data)));
            }
            ServerMessage::RoomFull(data) => {
                warn!("Room {} is full", self.room);
                self.room_full = true;
                self.last_error = Some(format!("room {} is full", self.room));
                self.emitter.emit(CallEvent::Room(RoomNotice::Full(data)));
            }
            ServerMessage::Unknown { event, .. } => {
                self.emitter
                    .diagnostic(DiagnosticKind::UnknownEvent, format!("unhandled event {event}"));
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerLinkEvent) {
        match self.coordinator.link_event(event) {
            Some(LinkChange::Status { from, to }) => {
                debug!("Peer link status {from:?} -> {to:?}");
                match to {
                    PeerConnectionStatus::Connected => {
                        if self.grace_deadline.take().is_some() {
                            self.emitter.emit_connection_recovered();
                        }
                        self.was_connected = true;
                        self.emitter.emit_connected();
                    }
                    PeerConnectionStatus::Disconnected => {
                        // уже ожидаем? – ничего не делаем
                        if self.grace_deadline.is_none() {
                            self.emitter.emit_connection_problem();
                            self.emitter.emit_connection_recovering();
                            self.grace_deadline = Some(Instant::now() + self.grace_period);
                        }
                    }
                    PeerConnectionStatus::Closed => {
                        self.grace_deadline = None;
                    }
                    _ => {}
                }
            }
            Some(LinkChange::RemoteTrack(track)) => {
                self.emitter.emit(CallEvent::RemoteTrack(track));
            }
            None => {}
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        if self.coordinator.is_connected() {
            info!("Connection recovered during grace period");
        } else {
            self.emitter.emit_connection_failed();
        }
    }

    async fn on_media(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Acquired(result) => match self.media.on_acquired(result) {
                Ok(_) => {
                    self.emitter.emit(CallEvent::LocalMediaReady);
                    let tracks = self.media.outgoing_tracks();
                    let result = self.coordinator.local_media_ready(tracks).await;
                    self.record(result);
                }
                Err(e) => self.fail(e.into()),
            },
            MediaEvent::DisplayAcquired(result) => {
                let installed = self
                    .media
                    .install_screen_share(result, self.coordinator.link())
                    .await
                    .map_err(CallError::from);
                if let Err(e) = &installed {
                    warn!("Screen share failed: {e}");
                }
                match self.share_reply.take() {
                    Some(reply) => {
                        let _ = reply.send(installed);
                    }
                    None => debug!("Screen share result without a waiting caller"),
                }
            }
            MediaEvent::CameraReacquired(result) => {
                if let Err(e) = self
                    .media
                    .revert_to_camera(result, self.coordinator.link())
                    .await
                {
                    self.fail(e.into());
                }
            }
            MediaEvent::ScreenShareEnded { generation } => {
                if self.media.on_screen_share_ended(generation) {
                    self.emitter.emit(CallEvent::ScreenShareEnded);
                }
            }
        }
    }

    fn record(&mut self, result: std::result::Result<(), NegotiationError>) {
        if let Err(e) = result {
            self.fail(e.into());
        }
    }

    /// Ошибки не завершают звонок: только статус и событие
    fn fail(&mut self, err: CallError) {
        warn!("{err}");
        let message = err.to_string();
        self.last_error = Some(message.clone());
        self.emitter.emit(CallEvent::Error(message));
    }

    fn publish(&mut self) {
        let linked = self.coordinator.link().is_some();
        if self.was_connected && !linked {
            self.was_connected = false;
            self.grace_deadline = None;
            self.emitter.emit_disconnected();
        }

        let media = self.media.state();
        let link = self.coordinator.link_state();
        let next = CallStatus {
            room: Some(self.room.clone()),
            signaling: self.channel.state(),
            negotiation: self.coordinator.state(),
            is_connected: self.coordinator.is_connected(),
            local_media_ready: media.ready,
            muted: media.muted,
            video_off: media.video_off,
            sharing_screen: media.sharing_screen,
            remote_peer: self.coordinator.remote_peer().map(str::to_owned),
            remote_tracks: link.remote_tracks,
            room_full: self.room_full,
            last_error: self.last_error.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        self.coordinator.close().await;
        self.media.release();
        while let Ok(event) = self.media_rx.try_recv() {
            event.discard();
        }
        if let Some(reply) = self.share_reply.take() {
            let _ = reply.send(Err(CallError::SessionClosed));
        }
        let _ = self.channel.leave_room();
        self.channel.close();

        if self.was_connected {
            self.emitter.emit_disconnected();
        }
        self.was_connected = false;
        self.grace_deadline = None;

        let media = self.media.state();
        self.status.send_replace(CallStatus {
            negotiation: self.coordinator.state(),
            muted: media.muted,
            video_off: media.video_off,
            ..CallStatus::default()
        });
        info!("Left room {}", self.room);
    }
}
