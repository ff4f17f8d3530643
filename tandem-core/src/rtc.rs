//! WebRTC peer sessions
//!
//! [`RtcPeerFactory`] backs [`PeerSession`] with a real `RTCPeerConnection`
//! from the `webrtc` crate: local tracks are added as Opus/VP8 sample
//! tracks, trickled ICE candidates and remote tracks are reported through
//! [`PeerEvents`], and the connection state drives connectivity.

use crate::negotiation::{
    NegotiationError, PeerEvent, PeerEvents, PeerSession, PeerSessionFactory,
};
use crate::signaling::CandidatePayload;
use crate::types::{LocalTrackInfo, MediaType, RemoteTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Public STUN servers used when none are configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl RtcConfig {
    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// Creates `RTCPeerConnection`-backed sessions
pub struct RtcPeerFactory {
    api: API,
    config: RtcConfig,
}

impl RtcPeerFactory {
    /// Create a factory with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if the media engine cannot be set up
    pub fn new(config: RtcConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Transport(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Transport(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }

    fn local_track(track: &LocalTrackInfo) -> Arc<dyn TrackLocal + Send + Sync> {
        let codec = match track.kind {
            MediaType::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaType::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id.clone(),
            "tandem".to_string(),
        ))
    }
}

#[async_trait]
impl PeerSessionFactory for RtcPeerFactory {
    #[tracing::instrument(skip(self, local_tracks, events), fields(tracks = local_tracks.len()))]
    async fn open(
        &self,
        local_tracks: &[LocalTrackInfo],
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(self.config.rtc_configuration())
                .await
                .map_err(|e| NegotiationError::Transport(e.to_string()))?,
        );

        for track in local_tracks {
            peer.add_track(Self::local_track(track))
                .await
                .map_err(|e| NegotiationError::Transport(e.to_string()))?;
        }

        let candidates = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(PeerEvent::LocalCandidate(CandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Local candidate not serializable"),
                }
            })
        }));

        let states = events.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = states.clone();
            Box::pin(async move {
                tracing::debug!(state = %state, "Peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        events.emit(PeerEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        events.emit(PeerEvent::Failed);
                    }
                    _ => {}
                }
            })
        }));

        let tracks = events;
        peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = tracks.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaType::Audio,
                        RTPCodecType::Video => MediaType::Video,
                        _ => return,
                    };
                    events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        kind,
                    }));
                })
            },
        ));

        Ok(Arc::new(RtcPeerSession { peer }))
    }
}

struct RtcPeerSession {
    peer: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.peer
            .set_local_description(offer)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        Ok(sdp)
    }

    async fn create_answer(&self, offer: &str) -> Result<String, NegotiationError> {
        let offer = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        self.peer
            .set_remote_description(offer)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;

        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.peer
            .set_local_description(answer)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        Ok(sdp)
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))
    }

    async fn add_remote_candidate(
        &self,
        candidate: CandidatePayload,
    ) -> Result<(), NegotiationError> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            tracing::debug!(error = %e, "Peer connection close failed");
        }
    }
}
