//! JSON-over-WebSocket signaling: per-client peer binding and envelope
//! routing between browsers and the peer registry.

pub mod broker;
pub mod protocol;

pub use broker::SignalingBroker;
pub use protocol::{CandidateData, ServerMessage};
