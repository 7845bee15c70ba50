use crate::error::PeerError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, MediaKind};
use crate::peer::link::{
    PeerConnection, PeerConnectionFactory, PeerEventKind, PeerEventSender, PeerLinkEvent,
};
use crate::peer::types::{
    IceCandidate, PeerConnectionStatus, RemoteTrack, SdpType, ServerConfig, SessionDescription,
    DEFAULT_ICE_SERVERS,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// Фабрика соединений webrtc-rs с заданными ICE серверами
#[derive(Debug, Clone)]
pub struct RtcPeerConnectionFactory {
    ice_servers: Vec<ServerConfig>,
}

impl Default for RtcPeerConnectionFactory {
    fn default() -> Self {
        Self::new(DEFAULT_ICE_SERVERS.clone())
    }
}

impl RtcPeerConnectionFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        link_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| PeerError::Setup(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| PeerError::Setup(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&self.ice_servers))
                .await
                .map_err(|e| PeerError::Setup(e.to_string()))?,
        );

        install_handlers(&pc, link_id.to_string(), events);
        info!("Peer connection {link_id} created");

        Ok(Arc::new(RtcPeerConnection {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, link_id: String, events: PeerEventSender) {
    let emit = {
        let link_id = link_id.clone();
        move |tx: &PeerEventSender, kind: PeerEventKind| {
            let _ = tx.send(PeerLinkEvent {
                link_id: link_id.clone(),
                kind,
            });
        }
    };

    {
        let tx = events.clone();
        let emit = emit.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let emit = emit.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c);
                        match c.to_json() {
                            Ok(init) => {
                                emit(&tx, PeerEventKind::LocalCandidate(IceCandidate::from(init)))
                            }
                            Err(e) => warn!("Failed to serialize local candidate: {e}"),
                        }
                    }
                    // None означает конец сбора
                    None => emit(&tx, PeerEventKind::GatheringComplete),
                }
            })
        }));
    }

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {state:?}");
        Box::pin(async {})
    }));

    {
        let tx = events.clone();
        let emit = emit.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                info!(
                    "Remote {} track {} in stream {}",
                    kind.as_str(),
                    track.id(),
                    track.stream_id()
                );
                emit(
                    &tx,
                    PeerEventKind::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        handle: Some(track),
                    }),
                );
            }
            Box::pin(async {})
        }));
    }

    // слабая ссылка, чтобы обработчик не держал соединение живым
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!("Peer connection {link_id} state changed to: {st:?}");

        let status = match st {
            RTCPeerConnectionState::New => Some(PeerConnectionStatus::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionStatus::Negotiating),
            RTCPeerConnectionState::Connected => Some(PeerConnectionStatus::Connected),
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
                Some(PeerConnectionStatus::Disconnected)
            }
            RTCPeerConnectionState::Closed => Some(PeerConnectionStatus::Closed),
            _ => None,
        };

        if let Some(status) = status {
            emit(&events, PeerEventKind::ConnectionState(status));
        }
        Box::pin(async {})
    }));
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// `PeerConnection` поверх `RTCPeerConnection`
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| PeerError::op("parse sdp", e))
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(track.rtc_track())
            .await
            .map_err(|e| PeerError::op("add track", e))?;

        // RTCP надо вычитывать, иначе интерсепторы не работают
        let reader = sender.clone();
        tokio::spawn(async move {
            while reader.read_rtcp().await.is_ok() {}
        });

        self.senders.lock().await.insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&kind)
            .cloned()
            .ok_or(PeerError::NoSender(kind.as_str()))?;
        sender
            .replace_track(Some(track.rtc_track()))
            .await
            .map_err(|e| PeerError::op("replace track", e))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::op("create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::op("create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::op("set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::op("set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::op("add ice candidate", e))
    }

    async fn close(&self) {
        self.senders.lock().await.clear();
        if let Err(e) = self.pc.close().await {
            warn!("Peer connection close error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_scheme_and_credentials() {
        let servers = vec![
            ServerConfig {
                id: "stun".into(),
                r#type: "stun".into(),
                url: "stun.example.com:3478".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "turn".into(),
                r#type: "turn".into(),
                url: "turn.example.com:3478".into(),
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ];
        let rtc = get_user_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.com:3478".to_string()]);
        assert_eq!(rtc[1].urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(rtc[1].username, "user");
        assert_eq!(rtc[1].credential, "secret");
    }

    #[tokio::test]
    async fn factory_builds_connection_and_offers_with_tracks() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let factory = RtcPeerConnectionFactory::new(vec![]);
        let conn = factory.create("test-link", tx).await.unwrap();

        let mic = LocalTrack::microphone("s");
        conn.add_track(&mic).await.unwrap();
        let offer = conn.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));

        let other = LocalTrack::microphone("s");
        assert!(conn.replace_track(MediaKind::Audio, &other).await.is_ok());
        assert_eq!(
            conn.replace_track(MediaKind::Video, &other).await,
            Err(PeerError::NoSender("video"))
        );
        conn.close().await;
    }
}
