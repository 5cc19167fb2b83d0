//! H.264 software encoder wrapper using openh264, plus the shared handle
//! that carries dynamic bitrate targets from the signaling plane into the
//! running encoder.

use crate::errors::StreamError;
use openh264::encoder::{Encoder, EncoderConfig, FrameType, RateControlMode};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One encoded access unit in Annex-B form
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// H.264 encoder for the test-pattern and re-encode paths
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    fps: u32,
    idr_interval: u32,
    frame_count: u64,
    pending_idr: bool,
}

impl H264Encoder {
    pub fn new(
        width: u32,
        height: u32,
        fps: u32,
        bitrate_kbps: u32,
        idr_interval: u32,
    ) -> Result<Self, StreamError> {
        // Dimensions come from the YUV source at encode time; the config
        // carries rate control only
        let config = EncoderConfig::new()
            .max_frame_rate(fps as f32)
            .rate_control_mode(RateControlMode::Bitrate)
            .set_bitrate_bps(bitrate_kbps.saturating_mul(1000))
            .enable_skip_frame(false);

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| StreamError::EncodingError(format!("Failed to create encoder: {}", e)))?;

        Ok(Self {
            encoder,
            width,
            height,
            fps,
            idr_interval: idr_interval.max(1),
            frame_count: 0,
            pending_idr: false,
        })
    }

    /// Encode an RGB24 frame to an H.264 access unit
    pub fn encode_rgb(&mut self, rgb_data: &[u8]) -> Result<EncodedFrame, StreamError> {
        let expected = (self.width * self.height * 3) as usize;
        if rgb_data.len() != expected {
            return Err(StreamError::EncodingError(format!(
                "Invalid frame size: expected {} bytes, got {}",
                expected,
                rgb_data.len()
            )));
        }

        let yuv = rgb_to_yuv420(rgb_data, self.width, self.height);
        self.encode_yuv(yuv)
    }

    /// Encode a packed I420 frame to an H.264 access unit
    pub fn encode_yuv(&mut self, yuv_data: Vec<u8>) -> Result<EncodedFrame, StreamError> {
        if self.pending_idr || self.frame_count % u64::from(self.idr_interval) == 0 {
            self.encoder.force_intra_frame();
            self.pending_idr = false;
        }

        let yuv_buffer =
            YUVBuffer::from_vec(yuv_data, self.width as usize, self.height as usize);

        let bitstream = self
            .encoder
            .encode(&yuv_buffer)
            .map_err(|e| StreamError::EncodingError(format!("Encoding failed: {}", e)))?;

        self.frame_count += 1;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);

        Ok(EncodedFrame {
            data: bitstream.to_vec(),
            is_keyframe,
        })
    }

    /// Force the next encoded frame to be an IDR
    pub fn force_keyframe(&mut self) {
        self.pending_idr = true;
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }
}

/// Unit contract for the dynamic bitrate property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMode {
    /// x264-style property: kilobits per second
    Software,
    /// NVENC-style property: bits per second
    Hardware,
}

/// Shared handle over the running encoder's bitrate target.
///
/// `set_bitrate` records the property in the mode's native units and flags
/// the encoder loop, which rebuilds its encoder at the next frame boundary.
#[derive(Debug)]
pub struct EncoderHandle {
    mode: EncoderMode,
    /// Last value written, in the mode's units
    property: AtomicU32,
    /// Normalized target in kbps, for encoder rebuilds
    target_kbps: AtomicU32,
    dirty: AtomicBool,
    idr_requested: AtomicBool,
}

impl EncoderHandle {
    pub fn new(mode: EncoderMode, initial_kbps: u32) -> Self {
        let property = match mode {
            EncoderMode::Software => initial_kbps,
            EncoderMode::Hardware => initial_kbps.saturating_mul(1000),
        };
        Self {
            mode,
            property: AtomicU32::new(property),
            target_kbps: AtomicU32::new(initial_kbps),
            dirty: AtomicBool::new(false),
            idr_requested: AtomicBool::new(false),
        }
    }

    /// Write the bitrate property. The caller passes kbps; hardware mode
    /// converts to bps internally.
    pub fn set_bitrate(&self, kbps: u32) {
        let value = match self.mode {
            EncoderMode::Software => kbps,
            EncoderMode::Hardware => kbps.saturating_mul(1000),
        };
        self.property.store(value, Ordering::SeqCst);
        self.target_kbps.store(kbps, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Last property value written, in the mode's native units
    pub fn bitrate_property(&self) -> u32 {
        self.property.load(Ordering::SeqCst)
    }

    pub fn target_kbps(&self) -> u32 {
        self.target_kbps.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> EncoderMode {
        self.mode
    }

    /// True once after each `set_bitrate`; the encoder loop polls this to
    /// decide when to rebuild
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Ask the encoder loop to emit an IDR at the next frame
    pub fn request_idr(&self) {
        self.idr_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_idr_request(&self) -> bool {
        self.idr_requested.swap(false, Ordering::SeqCst)
    }
}

/// Convert RGB24 to packed YUV420 (BT.601)
pub fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let rgb_idx = (y * w + x) * 3;
            let r = rgb[rgb_idx] as i32;
            let g = rgb[rgb_idx + 1] as i32;
            let b = rgb[rgb_idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            // Subsample U and V over 2x2 blocks
            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv_conversion_size_and_range() {
        let rgb = vec![128u8; 64 * 48 * 3];
        let yuv = rgb_to_yuv420(&rgb, 64, 48);
        assert_eq!(yuv.len(), 64 * 48 * 3 / 2);
        // Uniform gray input lands near mid-range luma
        assert!(yuv[0] > 100 && yuv[0] < 160);
    }

    #[test]
    fn software_handle_records_kbps() {
        let handle = EncoderHandle::new(EncoderMode::Software, 4000);
        assert_eq!(handle.bitrate_property(), 4000);
        handle.set_bitrate(500);
        assert_eq!(handle.bitrate_property(), 500);
        assert_eq!(handle.target_kbps(), 500);
        assert!(handle.take_dirty());
        assert!(!handle.take_dirty());
    }

    #[test]
    fn hardware_handle_records_bps() {
        let handle = EncoderHandle::new(EncoderMode::Hardware, 4000);
        assert_eq!(handle.bitrate_property(), 4_000_000);
        handle.set_bitrate(8000);
        assert_eq!(handle.bitrate_property(), 8_000_000);
        assert_eq!(handle.target_kbps(), 8000);
    }

    #[test]
    fn encoder_rejects_wrong_frame_size() {
        if let Ok(mut enc) = H264Encoder::new(64, 48, 30, 500, 30) {
            let too_small = vec![0u8; 16];
            assert!(enc.encode_rgb(&too_small).is_err());
        }
    }

    #[test]
    fn encoder_emits_keyframe_first() {
        let Ok(mut enc) = H264Encoder::new(64, 48, 30, 500, 30) else {
            // Encoder unavailable in this environment; nothing to verify
            return;
        };
        let rgb = vec![90u8; 64 * 48 * 3];
        let frame = enc.encode_rgb(&rgb).expect("encode");
        assert!(frame.is_keyframe);
        assert!(!frame.data.is_empty());
        assert!(crate::ingest::annexb::contains_sps(&frame.data));
    }
}
