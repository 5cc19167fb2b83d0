//! crabstream: RTSP-to-WebRTC video bridge.
//!
//! Pulls H.264 from an RTSP camera (or synthesizes a test pattern), keeps
//! the ingest alive across upstream failures, and fans the stream out to
//! multiple browsers over WebRTC with per-viewer RTP senders and
//! JSON-over-WebSocket signaling.
//!
//! # Architecture
//! - [`ingest`]: supervised media source with reconnect and dynamic bitrate
//! - [`webrtc`]: per-viewer peer sessions and the owning registry
//! - [`signaling`]: WebSocket broker binding each browser to one peer
//! - [`supervisor`]: wiring, watchdog, and orderly shutdown
//!
//! # Usage
//! ```rust,no_run
//! use crabstream::config::AppConfig;
//! use crabstream::supervisor::Supervisor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::load_from_file("crabstream.toml").unwrap();
//!     let supervisor = Supervisor::new(config);
//!     supervisor.start().await.unwrap();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     supervisor.stop().await;
//! }
//! ```

pub mod config;
pub mod errors;
pub mod ingest;
pub mod signaling;
pub mod supervisor;
pub mod testing;
pub mod types;
pub mod webrtc;

// Re-exports for convenience; the peer types use an explicit crate path
// because the module shares its name with the webrtc crate
pub use config::AppConfig;
pub use crate::webrtc::{PeerRegistry, PeerSession};
pub use errors::StreamError;
pub use ingest::{IngestPipeline, PipelineState, PipelineStats};
pub use supervisor::Supervisor;
