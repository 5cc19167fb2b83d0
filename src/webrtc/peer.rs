//! One viewer's WebRTC peer connection.
//!
//! Each session owns a send-only H.264 video track, packetizes shared
//! access units onto it with its own SSRC and timestamps, and surfaces its
//! negotiation state through a signaling callback. RTCP sender reports and
//! NACK handling come from the default interceptor chain.

use crate::config::WebRtcConfig;
use crate::errors::StreamError;
use crate::ingest::annexb;
use crate::webrtc::packetizer::H264Packetizer;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// Process-wide SSRC allocator. Starts at 42 and never wraps; uniqueness
/// holds for the first 2^32 - 42 sessions, far beyond any deployment.
static NEXT_SSRC: AtomicU32 = AtomicU32::new(42);

/// fmtp offered for the single H.264 codec entry
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Stream identifier shared by every session's track
const TRACK_MSID: &str = "stream-server";

/// Invoked with `(type, payload)` where type is "offer", "answer", or
/// "candidate"; payload is raw SDP or a JSON candidate object
pub type SignalingCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub rtp_packets_sent: u64,
    pub bytes_sent: u64,
    pub state: String,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            rtp_packets_sent: 0,
            bytes_sent: 0,
            state: "new".to_string(),
        }
    }
}

pub struct PeerSession {
    peer_id: String,
    ssrc: u32,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    packetizer: Mutex<H264Packetizer>,
    signaling_cb: SignalingCallback,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    needs_keyframe: Arc<AtomicBool>,
    stats: Arc<Mutex<PeerStats>>,
}

impl PeerSession {
    pub async fn new(
        peer_id: String,
        config: &WebRtcConfig,
        signaling_cb: SignalingCallback,
    ) -> Result<Self, StreamError> {
        let ssrc = NEXT_SSRC.fetch_add(1, Ordering::SeqCst);

        let mut media = MediaEngine::default();
        media.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: config.video.clock_rate,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: config.video.payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| StreamError::PeerError(format!("interceptor setup failed: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers_from(config),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: config.video.clock_rate,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            TRACK_MSID.to_owned(),
        ));

        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain sender RTCP so the interceptors (SR, NACK) actually run
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });

        let connected = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let needs_keyframe = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(PeerStats::default()));

        {
            let peer_id = peer_id.clone();
            let connected = Arc::clone(&connected);
            let closed = Arc::clone(&closed);
            let stats = Arc::clone(&stats);
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let name = state_name(state);
                log::info!("[{}] Connection state: {}", peer_id, name);
                connected.store(state == RTCPeerConnectionState::Connected, Ordering::SeqCst);
                if matches!(
                    state,
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
                ) {
                    closed.store(true, Ordering::SeqCst);
                }
                stats.lock().unwrap().state = name.to_string();
                Box::pin(async {})
            }));
        }

        {
            let peer_id = peer_id.clone();
            let cb = Arc::clone(&signaling_cb);
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            log::debug!("[{}] Local ICE candidate: {}", peer_id, init.candidate);
                            let payload = serde_json::json!({
                                "candidate": init.candidate,
                                "sdpMid": init.sdp_mid.unwrap_or_else(|| "0".to_string()),
                            });
                            cb("candidate", &payload.to_string());
                        }
                        Err(e) => {
                            log::warn!("[{}] Failed to serialize candidate: {}", peer_id, e)
                        }
                    }
                }
                Box::pin(async {})
            }));
        }

        {
            let peer_id = peer_id.clone();
            pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                if state == RTCIceGathererState::Complete {
                    log::info!("[{}] ICE gathering complete", peer_id);
                }
                Box::pin(async {})
            }));
        }

        log::info!("[{}] Peer connection created (SSRC={})", peer_id, ssrc);

        Ok(Self {
            packetizer: Mutex::new(H264Packetizer::new(config.video.payload_type, ssrc)),
            peer_id,
            ssrc,
            pc,
            track,
            signaling_cb,
            connected,
            closed,
            needs_keyframe,
            stats,
        })
    }

    /// Generate and install the local offer, then hand its SDP to the
    /// signaling callback. The server offers because it owns the sendonly
    /// track.
    pub async fn start_offer(&self) -> Result<(), StreamError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;

        if let Some(local) = self.pc.local_description().await {
            (self.signaling_cb)("offer", &local.sdp);
            log::info!("[{}] Created and sent SDP offer", self.peer_id);
        }
        Ok(())
    }

    /// Apply the browser's answer
    pub async fn handle_answer(&self, sdp: &str) -> Result<(), StreamError> {
        log::debug!("[{}] Received SDP answer", self.peer_id);
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        self.needs_keyframe.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Apply a remote ICE candidate; malformed candidates are logged and
    /// dropped rather than failing the session
    pub async fn handle_candidate(&self, candidate: &str, mid: &str) {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: Some(mid.to_string()),
            sdp_mline_index: None,
            username_fragment: None,
        };
        match self.pc.add_ice_candidate(init).await {
            Ok(()) => log::debug!("[{}] Added remote ICE candidate", self.peer_id),
            Err(e) => log::warn!("[{}] Failed to add ICE candidate: {}", self.peer_id, e),
        }
    }

    /// Packetize and send one access unit. No-op unless connected; the
    /// write is a non-blocking UDP send per packet.
    pub async fn send_h264_nal(&self, data: &[u8], timestamp_us: u64) {
        if !self.is_connected() || self.is_closed() {
            return;
        }

        let packets = match self.packetizer.lock().unwrap().packetize(data, timestamp_us) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("[{}] Packetization failed: {}", self.peer_id, e);
                return;
            }
        };

        if self.needs_keyframe.load(Ordering::SeqCst) && annexb::contains_idr(data) {
            self.needs_keyframe.store(false, Ordering::SeqCst);
        }

        let mut sent = 0u64;
        for packet in &packets {
            match self.track.write_rtp(packet).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    log::warn!("[{}] Failed to send RTP: {}", self.peer_id, e);
                    break;
                }
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.rtp_packets_sent += sent;
        stats.bytes_sent += data.len() as u64;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn needs_keyframe(&self) -> bool {
        self.needs_keyframe.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> PeerStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Close the underlying connection; the closed flag is terminal
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.pc.close().await {
            log::warn!("[{}] Close failed: {}", self.peer_id, e);
        }
    }
}

fn ice_servers_from(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_server.is_empty() {
        servers.push(RTCIceServer {
            urls: vec![config.stun_server.clone()],
            ..Default::default()
        });
    }
    if !config.turn_server.is_empty() {
        servers.push(RTCIceServer {
            urls: vec![config.turn_server.clone()],
            username: config.turn_username.clone(),
            credential: config.turn_credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn state_name(state: RTCPeerConnectionState) -> &'static str {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => "new",
        RTCPeerConnectionState::Connecting => "connecting",
        RTCPeerConnectionState::Connected => "connected",
        RTCPeerConnectionState::Disconnected => "disconnected",
        RTCPeerConnectionState::Failed => "failed",
        RTCPeerConnectionState::Closed => "closed",
    }
}
