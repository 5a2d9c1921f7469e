use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::codecs::{h264::H264Packet, opus::OpusPacket};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectivityState, NegotiationError, PeerConnectionAdapter, PeerConnectionFactory, PeerEvent,
};
use crate::media::rtp_track::RtpTrack;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::codec::{IceCandidate, SessionDescription};
use crate::signaling::resolver::ConnectivityServer;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

fn setup_err(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}

/// Codecs are pinned so the video bitstream can be forwarded as-is.
fn media_engine() -> Result<MediaEngine, webrtc::Error> {
    let mut engine = MediaEngine::default();
    let video_feedback = vec![
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
    ];
    engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                rtcp_feedback: video_feedback,
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: OPUS_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(engine)
}

fn ice_servers(servers: &[ConnectivityServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn connectivity_state(state: RTCIceConnectionState) -> ConnectivityState {
    match state {
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => ConnectivityState::New,
    }
}

/// Kind of track read for a negotiated codec; matches what `media_engine` registers.
fn supported_kind(mime_type: &str) -> Option<TrackKind> {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        Some(TrackKind::Video)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
        Some(TrackKind::Audio)
    } else {
        None
    }
}

/// Wraps a remote track in a depacketizing reader, if its codec is known.
fn media_track(remote: Arc<TrackRemote>) -> Option<Box<dyn MediaTrack>> {
    let mime_type = remote.codec().capability.mime_type;
    let track: Box<dyn MediaTrack> = match supported_kind(&mime_type) {
        Some(TrackKind::Video) => {
            Box::new(RtpTrack::new(remote, TrackKind::Video, H264Packet::default()))
        }
        Some(TrackKind::Audio) => {
            Box::new(RtpTrack::new(remote, TrackKind::Audio, OpusPacket::default()))
        }
        None => {
            tracing::warn!(target: "kvs_agent::peer", mime_type = %mime_type, "unsupported track codec; ignoring");
            return None;
        }
    };
    Some(track)
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    local_candidates: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
}

impl WebRtcPeer {
    pub async fn new(
        servers: &[ConnectivityServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, NegotiationError> {
        let mut engine = media_engine().map_err(setup_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut engine).map_err(setup_err)?;
        let api = APIBuilder::new()
            .with_media_engine(engine)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: ice_servers(servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup_err)?);

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    tracing::info!(
                        target: "kvs_agent::peer",
                        kind = %track.kind(),
                        id = %track.id(),
                        codec = %track.codec().capability.mime_type,
                        "remote track arrived"
                    );
                    if let Some(track) = media_track(track) {
                        let _ = events.send(PeerEvent::TrackArrived(track));
                    }
                })
            },
        ));

        let state_events = events;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let _ = state_events.send(PeerEvent::ConnectivityStateChanged(connectivity_state(
                state,
            )));
            Box::pin(async {})
        }));

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target: "kvs_agent::peer", "local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target: "kvs_agent::peer", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        Ok(Self {
            pc,
            local_candidates: Mutex::new(Some(candidate_rx)),
        })
    }
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcPeer {
    async fn add_recv_transceivers(&self) -> Result<(), NegotiationError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            self.pc
                .add_transceiver_from_kind(kind, Some(init))
                .await
                .map_err(setup_err)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::Offer(err.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(
        &self,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let local_err = |err: webrtc::Error| NegotiationError::LocalDescription(err.to_string());
        let description = RTCSessionDescription::offer(offer.sdp).map_err(local_err)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(local_err)
    }

    async fn set_remote_description(
        &self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let remote_err = |err: webrtc::Error| NegotiationError::RemoteDescription(err.to_string());
        let description = RTCSessionDescription::answer(answer.sdp).map_err(remote_err)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(remote_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn wait_gathering_complete(&self) {
        let mut gather = self.pc.gathering_complete_promise().await;
        let _ = gather.recv().await;
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|description| SessionDescription::offer(description.sdp))
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.local_candidates
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|err| NegotiationError::Close(err.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        servers: &[ConnectivityServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionAdapter>, NegotiationError> {
        Ok(Arc::new(WebRtcPeer::new(servers, events).await?))
    }
}
