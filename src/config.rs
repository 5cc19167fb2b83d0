//! Configuration management for crabstream.
//!
//! Loads a TOML config file with serde, falls back to defaults when the file
//! is absent, and applies the documented environment variable overrides so
//! containerized deployments can tune the bridge without editing files.

use crate::errors::StreamError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rtsp: RtspConfig,
    pub webrtc: WebRtcConfig,
    pub encoding: EncodingConfig,
    pub logging: LoggingConfig,
}

/// Network listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket signaling port
    pub signaling_port: u16,
}

/// Upstream RTSP source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// Camera URL; empty selects the synthetic test pattern source
    pub url: String,
    /// "tcp" or "udp"
    pub transport: String,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    /// Consecutive failed rebuilds before giving up; 0 = unlimited
    pub reconnect_max_attempts: u32,
}

/// WebRTC peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_server: String,
    pub turn_server: String,
    pub turn_username: String,
    pub turn_credential: String,
    /// Registry capacity; new clients beyond this are refused
    pub max_peers: usize,
    pub video: VideoConfig,
}

/// Video track parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

/// Encoder behavior flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Selects bits-per-second units on the encoder handle (the hardware
    /// encoder contract); encoding itself is always served in software
    pub hw_encode: bool,
    /// Relay upstream H.264 without re-encoding; bitrate control disabled
    pub passthrough: bool,
    /// Keyframe interval in frames for the encoder paths
    pub idr_interval: u32,
    /// Inject cached SPS/PPS ahead of IDRs on the passthrough path
    pub insert_sps_pps: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, or error
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signaling_port: 8080,
        }
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            transport: "tcp".to_string(),
            reconnect_interval_ms: 3000,
            reconnect_max_attempts: 0,
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_server: "stun:stun.cloudflare.com:3478".to_string(),
            turn_server: String::new(),
            turn_username: String::new(),
            turn_credential: String::new(),
            max_peers: 4,
            video: VideoConfig::default(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            payload_type: 96,
            clock_rate: 90_000,
            bitrate_kbps: 4000,
            max_bitrate_kbps: 8000,
            min_bitrate_kbps: 500,
            fps: 30,
            width: 1280,
            height: 720,
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            hw_encode: false,
            passthrough: true,
            idr_interval: 30,
            insert_sps_pps: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn env_or(name: &str, fallback: String) -> String {
    env::var(name).unwrap_or(fallback)
}

fn env_parse_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// an unreadable or unparsable file is fatal.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                StreamError::ConfigError(format!("Failed to read config file: {}", e))
            })?;
            toml::from_str(&contents).map_err(|e| {
                StreamError::ConfigError(format!("Failed to parse config file: {}", e))
            })?
        } else {
            log::info!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides for container and systemd deployments
    pub fn apply_env_overrides(&mut self) {
        self.rtsp.url = env_or("RTSP_URL", self.rtsp.url.clone());
        self.server.signaling_port = env_parse_or("SIGNALING_PORT", self.server.signaling_port);
        self.webrtc.stun_server = env_or("STUN_SERVER", self.webrtc.stun_server.clone());
        self.webrtc.turn_server = env_or("TURN_SERVER", self.webrtc.turn_server.clone());
        self.webrtc.turn_username = env_or("TURN_USERNAME", self.webrtc.turn_username.clone());
        self.webrtc.turn_credential =
            env_or("TURN_CREDENTIAL", self.webrtc.turn_credential.clone());
        self.webrtc.video.bitrate_kbps =
            env_parse_or("VIDEO_BITRATE_KBPS", self.webrtc.video.bitrate_kbps);
        self.webrtc.video.max_bitrate_kbps =
            env_parse_or("VIDEO_MAX_BITRATE_KBPS", self.webrtc.video.max_bitrate_kbps);
        self.logging.level = env_or("LOG_LEVEL", self.logging.level.clone());
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.server.signaling_port == 0 {
            return Err(StreamError::ConfigError(
                "signaling_port must be non-zero".to_string(),
            ));
        }
        if self.rtsp.transport != "tcp" && self.rtsp.transport != "udp" {
            return Err(StreamError::ConfigError(format!(
                "rtsp transport must be tcp or udp, got {}",
                self.rtsp.transport
            )));
        }
        if self.webrtc.max_peers == 0 {
            return Err(StreamError::ConfigError(
                "max_peers must be at least 1".to_string(),
            ));
        }
        let v = &self.webrtc.video;
        if v.min_bitrate_kbps > v.max_bitrate_kbps {
            return Err(StreamError::ConfigError(format!(
                "min_bitrate_kbps {} exceeds max_bitrate_kbps {}",
                v.min_bitrate_kbps, v.max_bitrate_kbps
            )));
        }
        if v.fps == 0 || v.fps > 240 {
            return Err(StreamError::ConfigError(
                "fps must be between 1 and 240".to_string(),
            ));
        }
        if v.width == 0 || v.height == 0 {
            return Err(StreamError::ConfigError(
                "video dimensions must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// True when no RTSP URL is configured and the synthetic source runs
    pub fn test_mode(&self) -> bool {
        self.rtsp.url.is_empty()
    }

    /// ICE server entries as advertised to browsers
    pub fn ice_servers(&self) -> Vec<crate::types::IceServerEntry> {
        let mut servers = Vec::new();
        if !self.webrtc.stun_server.is_empty() {
            servers.push(crate::types::IceServerEntry {
                urls: self.webrtc.stun_server.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.webrtc.turn_server.is_empty() {
            servers.push(crate::types::IceServerEntry {
                urls: self.webrtc.turn_server.clone(),
                username: Some(self.webrtc.turn_username.clone()),
                credential: Some(self.webrtc.turn_credential.clone()),
            });
        }
        servers
    }
}
