//! WebRTC peer fanout, built on the pure-Rust `webrtc` crate
//! (webrtc-rs/webrtc).
//!
//! - Peer connections via `webrtc::peer_connection::RTCPeerConnection`
//! - One send-only H.264 track per viewer (`TrackLocalStaticRTP`)
//! - RTP packetization in-session; RTCP SR/NACK via default interceptors
//! - The registry owns sessions and serializes the media fanout

pub mod packetizer;
pub mod peer;
pub mod registry;

pub use packetizer::H264Packetizer;
pub use peer::{PeerSession, PeerStats, SignalingCallback};
pub use registry::{PeerRegistry, RegistryStats};
