pub mod connection;
pub mod ice;
pub mod link;
pub mod state;
pub mod types;

pub use connection::{RtcPeerConnection, RtcPeerConnectionFactory};
pub use link::{
    OutboundCandidate, PeerConnection, PeerConnectionFactory, PeerEventKind, PeerEventSender,
    PeerLink, PeerLinkEvent,
};
pub use state::{NegotiationRole, PeerLinkState, GRACE_PERIOD};
pub use types::{
    IceCandidate, PeerConnectionStatus, PeerIdentity, RemoteTrack, RemoteTrackInfo, RoomId,
    SdpType, ServerConfig, SessionDescription,
};
