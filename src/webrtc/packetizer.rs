//! Per-session H.264 RTP packetization.
//!
//! Fragments Annex-B access units (3- or 4-byte start codes) into RTP
//! packets carrying the session's SSRC and payload type, an absolute 90 kHz
//! timestamp derived from the source presentation time, and the marker bit
//! on the final packet of each access unit. RTCP sender reports and NACK
//! retransmission ride the peer connection's interceptor chain.

use crate::errors::StreamError;
use bytes::Bytes;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;

/// Outbound MTU budget, matching the webrtc-rs default
pub const RTP_MTU: usize = 1200;

/// RTP header bytes reserved out of the MTU
const RTP_HEADER_LEN: usize = 12;

/// H.264 RTP clock rate (RFC 6184)
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

pub struct H264Packetizer {
    payloader: H264Payloader,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    mtu: usize,
}

impl H264Packetizer {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payloader: H264Payloader::default(),
            payload_type,
            ssrc,
            sequence_number: 0,
            mtu: RTP_MTU,
        }
    }

    /// 90 kHz RTP timestamp for a microsecond presentation time,
    /// truncated modulo 2^32
    pub fn rtp_timestamp(timestamp_us: u64) -> u32 {
        ((timestamp_us as u128 * VIDEO_CLOCK_RATE as u128) / 1_000_000) as u32
    }

    /// Packetize one access unit. All packets share the unit's timestamp;
    /// sequence numbers continue across calls and wrap at 2^16.
    pub fn packetize(
        &mut self,
        access_unit: &[u8],
        timestamp_us: u64,
    ) -> Result<Vec<Packet>, StreamError> {
        let payloads = self
            .payloader
            .payload(
                self.mtu - RTP_HEADER_LEN,
                &Bytes::copy_from_slice(access_unit),
            )
            .map_err(|e| StreamError::PeerError(format!("H.264 payload failed: {}", e)))?;

        let timestamp = Self::rtp_timestamp(timestamp_us);
        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);

        for (i, payload) in payloads.into_iter().enumerate() {
            let header = Header {
                version: 2,
                marker: i + 1 == count,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);
            packets.push(Packet { header, payload });
        }

        Ok(packets)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}
