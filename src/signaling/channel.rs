use crate::config::ReconnectConfig;
use crate::error::TransportError;
use crate::peer::types::RoomId;
use crate::signaling::backoff::ReconnectPolicy;
use crate::signaling::messages::{ClientMessage, ServerMessage};
use crate::signaling::transport::{Frame, SignalConnection, SignalTransport};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    State(SignalingConnectionState),
    Message(ServerMessage),
    Error(TransportError),
}

/// Куда координатор отправляет сообщения для второго участника
pub trait SignalSink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError>;
}

#[derive(Debug)]
enum ChannelCommand {
    JoinRoom(RoomId),
    LeaveRoom,
    Send(ClientMessage),
    Close,
}

/// Поток событий канала; единственный потребитель
pub struct SignalingEvents {
    rx: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl SignalingEvents {
    pub async fn recv(&mut self) -> Option<SignalingEvent> {
        self.rx.recv().await
    }
}

/// Соединение с сигнальным сервером. Работает в отдельной задаче:
/// переподключается по политике, восстанавливает комнату, буферизует
/// исходящие сообщения, пока связи нет.
pub struct SignalingChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Receiver<SignalingConnectionState>,
}

impl SignalingChannel {
    pub fn connect(
        url: impl Into<String>,
        reconnect: ReconnectConfig,
        transport: Arc<dyn SignalTransport>,
    ) -> (Arc<Self>, SignalingEvents) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SignalingConnectionState::Disconnected);

        let task = ChannelTask {
            url: url.into(),
            policy: ReconnectPolicy::new(reconnect),
            transport,
            commands: cmd_rx,
            events: event_tx,
            state: state_tx,
            room: None,
            outbox: VecDeque::new(),
        };
        tokio::spawn(task.run());

        (
            Arc::new(Self {
                commands: cmd_tx,
                state: state_rx,
            }),
            SignalingEvents { rx: event_rx },
        )
    }

    pub fn state(&self) -> SignalingConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SignalingConnectionState> {
        self.state.clone()
    }

    /// Комната запоминается и повторно запрашивается после каждого переподключения
    pub fn join_room(&self, room: impl Into<RoomId>) -> Result<(), TransportError> {
        self.command(ChannelCommand::JoinRoom(room.into()))
    }

    pub fn leave_room(&self) -> Result<(), TransportError> {
        self.command(ChannelCommand::LeaveRoom)
    }

    pub fn close(&self) {
        let _ = self.command(ChannelCommand::Close);
    }

    fn command(&self, cmd: ChannelCommand) -> Result<(), TransportError> {
        self.commands.send(cmd).map_err(|_| TransportError::Closed)
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        self.command(ChannelCommand::Send(msg))
    }
}

enum Connect {
    Established(Box<dyn SignalConnection>),
    Failed(TransportError),
    Closed,
}

enum Disconnect {
    Graceful,
    Transport(TransportError),
    Server(Option<String>),
}

struct ChannelTask {
    url: String,
    policy: ReconnectPolicy,
    transport: Arc<dyn SignalTransport>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: watch::Sender<SignalingConnectionState>,
    room: Option<RoomId>,
    outbox: VecDeque<ClientMessage>,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut delay: Option<Duration> = None;
        // попытки переподключения с момента последней успешной связи
        let mut attempts: u32 = 0;
        self.set_state(SignalingConnectionState::Connecting);

        loop {
            if let Some(d) = delay.take() {
                debug!("Reconnecting to signaling server in {} ms", d.as_millis());
                if self.wait(d).await.is_break() {
                    return self.finish();
                }
            }

            let conn = match self.connect().await {
                Connect::Established(conn) => conn,
                Connect::Closed => return self.finish(),
                Connect::Failed(err) => {
                    warn!("Signaling connect failed: {err}");
                    if attempts >= self.policy.max_attempts() {
                        error!("Signaling reconnection failed completely after {attempts} attempts");
                        self.emit(SignalingEvent::Error(TransportError::RetriesExhausted(
                            attempts,
                        )));
                        self.set_state(SignalingConnectionState::Failed);
                        return;
                    }
                    delay = Some(self.policy.delay(attempts));
                    attempts += 1;
                    self.set_state(SignalingConnectionState::Reconnecting);
                    continue;
                }
            };

            match self.serve(conn).await {
                Disconnect::Graceful => return,
                Disconnect::Transport(err) => {
                    warn!("Signaling transport dropped: {err}");
                    self.emit(SignalingEvent::Error(err));
                    self.set_state(SignalingConnectionState::Reconnecting);
                    delay = Some(self.policy.delay(0));
                    attempts = 1;
                }
                Disconnect::Server(reason) => {
                    info!("Signaling server closed the connection ({reason:?}), reconnecting");
                    self.set_state(SignalingConnectionState::Reconnecting);
                    delay = Some(self.policy.server_restart_delay());
                    attempts = 0;
                }
            }
        }
    }

    fn finish(&mut self) {
        self.outbox.clear();
        self.set_state(SignalingConnectionState::Disconnected);
    }

    async fn connect(&mut self) -> Connect {
        let transport = self.transport.clone();
        let url = self.url.clone();
        let connecting = transport.connect(&url);
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                res = &mut connecting => {
                    return match res {
                        Ok(conn) => Connect::Established(conn),
                        Err(e) => Connect::Failed(e),
                    };
                }
                cmd = self.commands.recv() => {
                    if self.apply_offline(cmd).is_break() {
                        return Connect::Closed;
                    }
                }
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> ControlFlow<()> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return ControlFlow::Continue(()),
                cmd = self.commands.recv() => {
                    if self.apply_offline(cmd).is_break() {
                        return ControlFlow::Break(());
                    }
                }
            }
        }
    }

    /// Команды, пришедшие без связи: комната запоминается, сообщения копятся
    fn apply_offline(&mut self, cmd: Option<ChannelCommand>) -> ControlFlow<()> {
        match cmd {
            None | Some(ChannelCommand::Close) => return ControlFlow::Break(()),
            Some(ChannelCommand::JoinRoom(room)) => self.room = Some(room),
            Some(ChannelCommand::LeaveRoom) => {
                self.room = None;
                self.outbox.clear();
            }
            Some(ChannelCommand::Send(msg)) => {
                debug!("Queuing {} while signaling is offline", msg.event());
                self.outbox.push_back(msg);
            }
        }
        ControlFlow::Continue(())
    }

    async fn serve(&mut self, mut conn: Box<dyn SignalConnection>) -> Disconnect {
        self.set_state(SignalingConnectionState::Connected);

        if let Some(room) = self.room.clone() {
            info!("Joining room {room}");
            if let Err(e) = send_on(&mut conn, &ClientMessage::JoinRoom(room)).await {
                return Disconnect::Transport(e);
            }
        }

        while let Some(msg) = self.outbox.pop_front() {
            if let Err(e) = send_on(&mut conn, &msg).await {
                self.outbox.push_front(msg);
                return Disconnect::Transport(e);
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(ChannelCommand::Close) => {
                        if self.room.take().is_some() {
                            let _ = send_on(&mut conn, &ClientMessage::Leave).await;
                        }
                        conn.close().await;
                        self.finish();
                        return Disconnect::Graceful;
                    }
                    Some(ChannelCommand::JoinRoom(room)) => {
                        self.room = Some(room.clone());
                        if let Err(e) = send_on(&mut conn, &ClientMessage::JoinRoom(room)).await {
                            return Disconnect::Transport(e);
                        }
                    }
                    Some(ChannelCommand::LeaveRoom) => {
                        if self.room.take().is_some() {
                            if let Err(e) = send_on(&mut conn, &ClientMessage::Leave).await {
                                return Disconnect::Transport(e);
                            }
                        }
                    }
                    Some(ChannelCommand::Send(msg)) => {
                        if let Err(e) = send_on(&mut conn, &msg).await {
                            self.outbox.push_front(msg);
                            return Disconnect::Transport(e);
                        }
                    }
                },
                frame = conn.recv() => match frame {
                    Ok(Frame::Text(text)) => match ServerMessage::parse(&text) {
                        Ok(msg) => self.emit(SignalingEvent::Message(msg)),
                        Err(e) => warn!("Ignoring malformed signaling frame: {e}"),
                    },
                    Ok(Frame::ServerClose(reason)) => return Disconnect::Server(reason),
                    Err(e) => return Disconnect::Transport(e),
                },
            }
        }
    }

    fn set_state(&mut self, next: SignalingConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Signaling state -> {next:?}");
            self.emit(SignalingEvent::State(next));
        }
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }
}

async fn send_on(
    conn: &mut Box<dyn SignalConnection>,
    msg: &ClientMessage,
) -> Result<(), TransportError> {
    let frame = msg.to_frame()?;
    conn.send(frame).await
}
