#![allow(dead_code)]

use async_trait::async_trait;
use roomcall::error::{MediaError, PeerError, TransportError};
use roomcall::media::{LocalStream, LocalTrack, MediaDevices, MediaKind, TrackSource};
use roomcall::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerConnectionStatus, PeerEventKind,
    PeerEventSender, PeerLinkEvent, SessionDescription,
};
use roomcall::signaling::{ClientMessage, Frame, ServerMessage, SignalConnection, SignalTransport};
use roomcall::{CallConfig, CallSession, CallStatus, ReconnectConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn setup() {
    roomcall::init_logging();
}

pub fn test_config() -> CallConfig {
    CallConfig {
        signal_url: "ws://relay.test".into(),
        reconnect: ReconnectConfig {
            max_attempts: 2,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            randomization_factor: 0.0,
            server_restart_delay_ms: 10,
        },
        peer_grace_period_ms: 100,
        ..CallConfig::default()
    }
}

/// Ждёт статуса, удовлетворяющего условию
pub async fn wait_status(
    session: &CallSession,
    what: &str,
    pred: impl FnMut(&CallStatus) -> bool,
) -> CallStatus {
    let mut rx = session.watch_status();
    let result = tokio::time::timeout(WAIT, rx.wait_for(pred)).await;
    match result {
        Ok(Ok(status)) => status.clone(),
        _ => panic!("timed out waiting for {what}: {:?}", session.status()),
    }
}

/// Опрос условия, которое не отражается в статусе
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------- сигнальный сервер в памяти ----------

#[derive(Default)]
struct RelayState {
    next_id: usize,
    clients: HashMap<String, mpsc::UnboundedSender<Frame>>,
    rooms: HashMap<String, Vec<String>>,
    received: Vec<(String, ClientMessage)>,
    refuse: bool,
    connects: usize,
}

impl RelayState {
    fn push(&self, to: &str, msg: ServerMessage) {
        if let Some(tx) = self.clients.get(to) {
            let _ = tx.send(Frame::Text(msg.to_frame().unwrap()));
        }
    }

    fn leave(&mut self, id: &str) {
        let mut notify = Vec::new();
        for members in self.rooms.values_mut() {
            if let Some(pos) = members.iter().position(|m| m == id) {
                members.remove(pos);
                notify.extend(members.iter().cloned());
            }
        }
        for other in notify {
            self.push(
                &other,
                ServerMessage::PeerLeft {
                    peer_id: Some(id.to_string()),
                },
            );
        }
    }

    fn handle(&mut self, from: &str, msg: ClientMessage) {
        self.received.push((from.to_string(), msg.clone()));
        match msg {
            ClientMessage::JoinRoom(room) => {
                let existing = self.rooms.get(&room).cloned().unwrap_or_default();
                if existing.iter().any(|m| m == from) {
                    return;
                }
                if existing.len() >= 2 {
                    self.push(from, ServerMessage::RoomFull(json!({ "roomId": room })));
                    return;
                }
                self.rooms
                    .entry(room.clone())
                    .or_default()
                    .push(from.to_string());
                if existing.is_empty() {
                    self.push(from, ServerMessage::RoomCreated(json!({ "roomId": room })));
                } else {
                    self.push(from, ServerMessage::RoomJoined(json!({ "roomId": room })));
                    for other in &existing {
                        self.push(
                            other,
                            ServerMessage::PeerJoined {
                                peer_id: from.to_string(),
                            },
                        );
                    }
                }
            }
            ClientMessage::Leave => self.leave(from),
            ClientMessage::Offer { offer, target } => self.push(
                &target,
                ServerMessage::Offer {
                    offer,
                    from: from.to_string(),
                },
            ),
            ClientMessage::Answer { answer, target } => self.push(
                &target,
                ServerMessage::Answer {
                    answer,
                    from: from.to_string(),
                },
            ),
            ClientMessage::IceCandidate { candidate, target } => self.push(
                &target,
                ServerMessage::IceCandidate {
                    candidate,
                    from: from.to_string(),
                },
            ),
        }
    }
}

/// Сигнальный сервер: комнаты максимум на двоих, пересылка с `from`
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub fn received(&self) -> Vec<(String, ClientMessage)> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn sent_by(&self, id: &str) -> Vec<ClientMessage> {
        self.received()
            .into_iter()
            .filter(|(from, _)| from == id)
            .map(|(_, msg)| msg)
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.received()
            .iter()
            .filter(|(_, msg)| msg.event() == event)
            .count()
    }

    /// Обрыв транспорта без close-кадра
    pub fn drop_client(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.leave(id);
        state.clients.remove(id);
    }

    /// Сервер сам закрывает соединение (например, перезапуск)
    pub fn server_close(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.clients.get(id) {
            let _ = tx.send(Frame::ServerClose(Some("restart".into())));
        }
        state.leave(id);
        state.clients.remove(id);
    }
}

#[async_trait]
impl SignalTransport for MemoryRelay {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalConnection>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }
        state.next_id += 1;
        state.connects += 1;
        let id = format!("peer-{}", state.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(id.clone(), tx);
        Ok(Box::new(MemoryConnection {
            id,
            relay: self.clone(),
            rx,
        }))
    }
}

struct MemoryConnection {
    id: String,
    relay: MemoryRelay,
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl SignalConnection for MemoryConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let msg = ClientMessage::parse(&text)?;
        let mut state = self.relay.state.lock().unwrap();
        if !state.clients.contains_key(&self.id) {
            return Err(TransportError::Send("connection closed".into()));
        }
        state.handle(&self.id, msg);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, TransportError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Dropped("relay closed the socket".into()))
    }

    async fn close(&mut self) {
        let mut state = self.relay.state.lock().unwrap();
        state.leave(&self.id);
        state.clients.remove(&self.id);
    }
}

// ---------- peer connection по сценарию ----------

/// Записывает вызовы по порядку. После set_local отдаёт один host-кандидат,
/// после обоих описаний сообщает connected.
pub struct ScriptedConnection {
    link_id: String,
    events: PeerEventSender,
    calls: Mutex<Vec<String>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    fail_on: Option<&'static str>,
}

impl ScriptedConnection {
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Событие от имени соединения
    pub fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerLinkEvent {
            link_id: self.link_id.clone(),
            kind,
        });
    }

    fn record(&self, call: impl Into<String>, op: &'static str) -> Result<(), PeerError> {
        self.calls.lock().unwrap().push(call.into());
        if self.fail_on == Some(op) {
            return Err(PeerError::op(op, "scripted failure"));
        }
        Ok(())
    }

    fn maybe_connected(&self) {
        if self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            self.emit(PeerEventKind::ConnectionState(PeerConnectionStatus::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for ScriptedConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(format!("add_track:{}", track.kind().as_str()), "add_track")
    }

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(
            format!("replace_track:{}:{}", kind.as_str(), track.id()),
            "replace_track",
        )
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_offer", "create_offer")?;
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.link_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer", "create_answer")?;
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.link_id)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), PeerError> {
        self.record("set_local", "set_local")?;
        self.has_local.store(true, Ordering::SeqCst);
        self.emit(PeerEventKind::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 50000 typ host", self.link_id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.emit(PeerEventKind::GatheringComplete);
        self.maybe_connected();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), PeerError> {
        self.record("set_remote", "set_remote")?;
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(format!("candidate:{}", candidate.candidate), "candidate")
    }

    async fn close(&self) {
        let _ = self.record("close", "close");
        self.emit(PeerEventKind::ConnectionState(PeerConnectionStatus::Closed));
    }
}

#[derive(Default)]
pub struct ScriptedPeers {
    created: Mutex<Vec<Arc<ScriptedConnection>>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl ScriptedPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, op: Option<&'static str>) {
        *self.fail_on.lock().unwrap() = op;
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<ScriptedConnection> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection created")
    }

    pub fn all(&self) -> Vec<Arc<ScriptedConnection>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for ScriptedPeers {
    async fn create(
        &self,
        link_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let conn = Arc::new(ScriptedConnection {
            link_id: link_id.to_string(),
            events,
            calls: Mutex::new(Vec::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            fail_on: *self.fail_on.lock().unwrap(),
        });
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

// ---------- устройства ----------

#[derive(Default)]
pub struct FakeDevices {
    deny_user: AtomicBool,
    deny_display: AtomicBool,
    issued: Mutex<Vec<LocalStream>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        let devices = Self::default();
        devices.deny_user.store(true, Ordering::SeqCst);
        Arc::new(devices)
    }

    pub fn set_deny_user(&self, deny: bool) {
        self.deny_user.store(deny, Ordering::SeqCst);
    }

    pub fn set_deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .flat_map(|s| s.tracks.clone())
            .collect()
    }

    pub fn live_display(&self) -> Option<LocalTrack> {
        self.issued_tracks()
            .into_iter()
            .find(|t| t.source() == TrackSource::Display && t.is_live())
    }

    /// Пользователь нажал «остановить показ» в системном интерфейсе
    pub fn end_screen_share(&self) -> bool {
        match self.live_display() {
            Some(track) => {
                track.end();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(&self) -> Result<LocalStream, MediaError> {
        if self.deny_user.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera and microphone".into()));
        }
        let stream = LocalStream::camera_and_microphone();
        self.issued.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<LocalStream, MediaError> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("display".into()));
        }
        let stream = LocalStream::screen();
        self.issued.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// Участник звонка со своими устройствами и соединениями
pub struct Party {
    pub session: CallSession,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<ScriptedPeers>,
}

impl Party {
    pub fn new(relay: &Arc<MemoryRelay>) -> Self {
        Self::with_devices(relay, FakeDevices::new())
    }

    pub fn with_devices(relay: &Arc<MemoryRelay>, devices: Arc<FakeDevices>) -> Self {
        let peers = ScriptedPeers::new();
        let session = CallSession::new(test_config(), relay.clone(), devices.clone(), peers.clone());
        Self {
            session,
            devices,
            peers,
        }
    }
}
