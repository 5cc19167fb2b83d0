//! JSON wire protocol for the signaling WebSocket.
//!
//! Field names and casing (`peerId`, `iceServers`, `sdpMid`) are part of the
//! browser contract and must survive serde round-trips unchanged.

use crate::types::IceServerEntry;
use serde::{Deserialize, Serialize};

/// Server → client envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServerEntry>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    /// `data` is the candidate object as produced by the peer session; a
    /// payload that fails to parse as JSON is forwarded as a raw string
    Candidate {
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// Envelope for a peer-session signaling event `(type, payload)`
    pub fn from_signaling_event(kind: &str, payload: &str) -> Option<Self> {
        match kind {
            "offer" => Some(ServerMessage::Offer {
                sdp: payload.to_string(),
            }),
            "answer" => Some(ServerMessage::Answer {
                sdp: payload.to_string(),
            }),
            "candidate" => {
                let data = serde_json::from_str(payload)
                    .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
                Some(ServerMessage::Candidate { data })
            }
            other => {
                log::debug!("Unmapped signaling event type: {}", other);
                None
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server envelope serializes")
    }
}

/// The capacity-rejection envelope text is part of the protocol
pub fn server_full_message() -> ServerMessage {
    ServerMessage::Error {
        message: "Server full, max peers reached".to_string(),
    }
}

/// Payload of an incoming candidate envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateData {
    #[serde(default)]
    pub candidate: String,
    #[serde(rename = "sdpMid", default = "default_mid")]
    pub sdp_mid: String,
}

fn default_mid() -> String {
    "0".to_string()
}
