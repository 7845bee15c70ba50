use crate::error::TransportError;
use crate::peer::types::{IceCandidate, PeerIdentity, RoomId, SessionDescription};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Кадр сигнального сервера: `{"event": "...", "data": ...}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Envelope {
    event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

/// Сообщения клиент → сервер
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRoom(RoomId),
    Leave,
    Offer {
        offer: SessionDescription,
        target: PeerIdentity,
    },
    Answer {
        answer: SessionDescription,
        target: PeerIdentity,
    },
    IceCandidate {
        candidate: IceCandidate,
        target: PeerIdentity,
    },
}

#[derive(Serialize)]
struct OfferOut<'a> {
    offer: &'a SessionDescription,
    target: &'a str,
}

#[derive(Serialize)]
struct AnswerOut<'a> {
    answer: &'a SessionDescription,
    target: &'a str,
}

#[derive(Serialize)]
struct CandidateOut<'a> {
    candidate: &'a IceCandidate,
    target: &'a str,
}

impl ClientMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "join-room",
            ClientMessage::Leave => "leave",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            ClientMessage::Offer { target, .. }
            | ClientMessage::Answer { target, .. }
            | ClientMessage::IceCandidate { target, .. } => Some(target),
            _ => None,
        }
    }

    /// JSON-текст для отправки
    pub fn to_frame(&self) -> Result<String, TransportError> {
        let data = match self {
            ClientMessage::JoinRoom(room) => Value::String(room.clone()),
            ClientMessage::Leave => Value::Null,
            ClientMessage::Offer { offer, target } => to_value(&OfferOut { offer, target })?,
            ClientMessage::Answer { answer, target } => to_value(&AnswerOut { answer, target })?,
            ClientMessage::IceCandidate { candidate, target } => {
                to_value(&CandidateOut { candidate, target })?
            }
        };
        let envelope = Envelope {
            event: self.event().to_string(),
            data,
        };
        serde_json::to_string(&envelope).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    /// Разбор кадра, пришедшего от клиента (нужно серверной стороне и тестам)
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let envelope: Envelope = from_str(text)?;
        let msg = match envelope.event.as_str() {
            "join-room" => ClientMessage::JoinRoom(payload(envelope.data)?),
            "leave" => ClientMessage::Leave,
            "offer" => {
                let p: OfferIn = payload(envelope.data)?;
                ClientMessage::Offer {
                    offer: p.offer,
                    target: p.target,
                }
            }
            "answer" => {
                let p: AnswerIn = payload(envelope.data)?;
                ClientMessage::Answer {
                    answer: p.answer,
                    target: p.target,
                }
            }
            "ice-candidate" => {
                let p: CandidateIn = payload(envelope.data)?;
                ClientMessage::IceCandidate {
                    candidate: p.candidate,
                    target: p.target,
                }
            }
            other => {
                return Err(TransportError::Malformed(format!(
                    "unknown client event {other}"
                )))
            }
        };
        Ok(msg)
    }
}

#[derive(Deserialize)]
struct OfferIn {
    offer: SessionDescription,
    target: PeerIdentity,
}

#[derive(Deserialize)]
struct AnswerIn {
    answer: SessionDescription,
    target: PeerIdentity,
}

#[derive(Deserialize)]
struct CandidateIn {
    candidate: IceCandidate,
    target: PeerIdentity,
}

#[derive(Deserialize)]
struct PeerJoinedIn {
    #[serde(rename = "peerId")]
    peer_id: PeerIdentity,
}

#[derive(Deserialize, Default)]
struct PeerLeftIn {
    #[serde(default, rename = "peerId")]
    peer_id: Option<PeerIdentity>,
}

#[derive(Deserialize)]
struct RelayedOffer {
    offer: SessionDescription,
    from: PeerIdentity,
}

#[derive(Deserialize)]
struct RelayedAnswer {
    answer: SessionDescription,
    from: PeerIdentity,
}

#[derive(Deserialize)]
struct RelayedCandidate {
    candidate: IceCandidate,
    from: PeerIdentity,
}

/// Сообщения сервер → клиент
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    PeerJoined {
        peer_id: PeerIdentity,
    },
    PeerLeft {
        peer_id: Option<PeerIdentity>,
    },
    Offer {
        offer: SessionDescription,
        from: PeerIdentity,
    },
    Answer {
        answer: SessionDescription,
        from: PeerIdentity,
    },
    IceCandidate {
        candidate: IceCandidate,
        from: PeerIdentity,
    },
    RoomCreated(Value),
    RoomJoined(Value),
    RoomFull(Value),
    Unknown {
        event: String,
        data: Value,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let envelope: Envelope = from_str(text)?;
        let msg = match envelope.event.as_str() {
            "peer-joined" => {
                let p: PeerJoinedIn = payload(envelope.data)?;
                ServerMessage::PeerJoined { peer_id: p.peer_id }
            }
            "peer-left" => {
                let p: PeerLeftIn = if envelope.data.is_object() {
                    payload(envelope.data)?
                } else {
                    PeerLeftIn::default()
                };
                ServerMessage::PeerLeft { peer_id: p.peer_id }
            }
            "offer" => {
                let p: RelayedOffer = payload(envelope.data)?;
                ServerMessage::Offer {
                    offer: p.offer,
                    from: p.from,
                }
            }
            "answer" => {
                let p: RelayedAnswer = payload(envelope.data)?;
                ServerMessage::Answer {
                    answer: p.answer,
                    from: p.from,
                }
            }
            "ice-candidate" => {
                let p: RelayedCandidate = payload(envelope.data)?;
                ServerMessage::IceCandidate {
                    candidate: p.candidate,
                    from: p.from,
                }
            }
            "room-created" => ServerMessage::RoomCreated(envelope.data),
            "room-joined" => ServerMessage::RoomJoined(envelope.data),
            "room-full" => ServerMessage::RoomFull(envelope.data),
            _ => ServerMessage::Unknown {
                event: envelope.event,
                data: envelope.data,
            },
        };
        Ok(msg)
    }

    /// Кадр в том виде, в каком его шлёт сервер
    pub fn to_frame(&self) -> Result<String, TransportError> {
        let (event, data) = match self {
            ServerMessage::PeerJoined { peer_id } => {
                ("peer-joined", serde_json::json!({ "peerId": peer_id }))
            }
            ServerMessage::PeerLeft { peer_id } => (
                "peer-left",
                peer_id
                    .as_ref()
                    .map(|id| serde_json::json!({ "peerId": id }))
                    .unwrap_or(Value::Null),
            ),
            ServerMessage::Offer { offer, from } => {
                ("offer", serde_json::json!({ "offer": offer, "from": from }))
            }
            ServerMessage::Answer { answer, from } => {
                ("answer", serde_json::json!({ "answer": answer, "from": from }))
            }
            ServerMessage::IceCandidate { candidate, from } => (
                "ice-candidate",
                serde_json::json!({ "candidate": candidate, "from": from }),
            ),
            ServerMessage::RoomCreated(v) => ("room-created", v.clone()),
            ServerMessage::RoomJoined(v) => ("room-joined", v.clone()),
            ServerMessage::RoomFull(v) => ("room-full", v.clone()),
            ServerMessage::Unknown { event, data } => (event.as_str(), data.clone()),
        };
        serde_json::to_string(&Envelope {
            event: event.to_string(),
            data,
        })
        .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

fn from_str<T: DeserializeOwned>(text: &str) -> Result<T, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, TransportError> {
    serde_json::from_value(data).map_err(|e| TransportError::Malformed(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(|e| TransportError::Malformed(e.to_string()))
}
