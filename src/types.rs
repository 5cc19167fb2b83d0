//! Shared data types used across the ingest, fanout, and signaling layers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// One H.264 access unit in Annex-B byte-stream form (4-byte start codes),
/// stamped with a monotonic presentation time in microseconds.
#[derive(Debug, Clone)]
pub struct NalBatch {
    pub data: Bytes,
    pub timestamp_us: u64,
}

impl NalBatch {
    pub fn new(data: Bytes, timestamp_us: u64) -> Self {
        Self { data, timestamp_us }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Sink for access units produced by the ingest pipeline, in the boxed
/// future shape the webrtc crate uses for its handlers. The tap task awaits
/// the returned future before delivering the next unit, which keeps the
/// fanout in timestamp order; the slice must not be retained past the call,
/// so implementations copy what the future needs.
pub type NalCallback =
    Arc<dyn Fn(&[u8], u64) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Sink for browser-originated bitrate hints, in kbps.
pub type BitrateCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// One ICE server entry as advertised to browsers in the welcome envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
