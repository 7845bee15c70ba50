pub mod backoff;
pub mod channel;
pub mod messages;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use channel::{
    SignalSink, SignalingChannel, SignalingConnectionState, SignalingEvent, SignalingEvents,
};
pub use messages::{ClientMessage, ServerMessage};
pub use transport::{Frame, SignalConnection, SignalTransport, WsTransport};
