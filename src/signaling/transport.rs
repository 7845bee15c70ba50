use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Входящий кадр транспорта
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Сервер сам закрыл соединение (например, перезапуск)
    ServerClose(Option<String>),
}

/// Установленное соединение с сигнальным сервером.
/// `recv` возвращает ошибку при обрыве транспорта без close-кадра.
#[async_trait]
pub trait SignalConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Frame, TransportError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalConnection>, TransportError>;
}

/// Транспорт поверх WebSocket
#[derive(Debug, Default, Clone)]
pub struct WsTransport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsConnection {
    ws: WsStream,
}

#[async_trait]
impl SignalTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalConnection>, TransportError> {
        debug!("Connecting to signaling server {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        info!("Signaling socket connected to {url}");
        Ok(Box::new(WsConnection { ws }))
    }
}

#[async_trait]
impl SignalConnection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Frame::ServerClose(
                        frame.map(|f| f.reason.as_str().to_owned()),
                    ))
                }
                // ping/pong отвечает сам tungstenite, бинарные кадры протокол не использует
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Dropped(e.to_string())),
                None => return Err(TransportError::Dropped("stream ended".into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("Signaling socket close error: {e}");
        }
    }
}
