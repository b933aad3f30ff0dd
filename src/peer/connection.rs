use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
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
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::link::{PeerEventSink, PeerFactory, PeerLink, RtcSettings};
use super::types::{IceCandidate, PeerState, RemoteTrack, SdpKind, ServerConfig, SessionDescription};
use crate::error::Result;
use crate::logger::dump_selected_pair;
use crate::media::LocalTrack;
use crate::utils::add_ice_url_scheme;

/// Фабрика соединений на webrtc-rs с кодеками и интерсепторами по умолчанию
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(settings: &RtcSettings) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&settings.ice_servers),
        ice_candidate_pool_size: settings.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn peer_state(st: RTCPeerConnectionState) -> PeerState {
    match st {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, settings: &RtcSettings, events: PeerEventSink) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(settings)).await?);
        let participant = events.participant().clone();

        // Обработчик локальных кандидатов (Trickle-ICE)
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => sink.local_candidate(init.into()),
                    Err(e) => warn!("Failed to serialize local candidate: {:?}", e),
                },
                // None означает конец сбора
                None => sink.gathering_complete(),
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                sink.remote_track(RemoteTrack {
                    id: track.id(),
                    kind: track.kind().into(),
                    stream_id: track.stream_id(),
                    source: Some(track),
                });
                Box::pin(async {})
            },
        ));

        let sink = events;
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {:?}", st);
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            sink.state_changed(peer_state(st));
            Box::pin(async {})
        }));

        info!("Created peer connection for {}", participant);
        Ok(Arc::new(RtcPeer { pc }))
    }
}

/// Соединение webrtc-rs
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerLink for RtcPeer {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<()> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self.pc.add_track(rtc).await?;

        // RTCP нужно вычитывать, иначе интерсепторы не работают
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: &Arc<LocalTrack>) -> Result<bool> {
        for sender in self.pc.get_senders().await {
            let is_video = match sender.track().await {
                Some(current) => current.kind() == RTPCodecType::Video,
                None => false,
            };
            if is_video {
                let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
                sender.replace_track(Some(rtc)).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
