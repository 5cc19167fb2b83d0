use std::fmt;

#[derive(Debug)]
pub enum StreamError {
    ConfigError(String),
    PipelineError(String),
    EncodingError(String),
    PeerError(String),
    SignalingError(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            StreamError::PipelineError(msg) => write!(f, "Pipeline error: {}", msg),
            StreamError::EncodingError(msg) => write!(f, "Encoding error: {}", msg),
            StreamError::PeerError(msg) => write!(f, "Peer connection error: {}", msg),
            StreamError::SignalingError(msg) => write!(f, "Signaling error: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<webrtc::Error> for StreamError {
    fn from(e: webrtc::Error) -> Self {
        StreamError::PeerError(e.to_string())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::SignalingError(e.to_string())
    }
}
