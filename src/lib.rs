pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{CallConfig, ReconnectConfig};
pub use error::{CallError, MediaError, NegotiationError, PeerError, Result, TransportError};
pub use logger::{init_logging, CallEvent, Diagnostic, DiagnosticKind, EventEmitter, RoomNotice};
pub use media::{LocalMediaState, LocalStream, LocalTrack, MediaDevices, MediaKind};
pub use negotiation::NegotiationState;
pub use session::{CallSession, CallStatus};
pub use signaling::{SignalingChannel, SignalingConnectionState};
