//! `VideoEncoder` trait (§9: "treat the encoder as a trait producing an
//! iterator of `(bytes, is_keyframe)`") and its VP8 implementation (§4.4).
//! Tracks `(encoder_instance, last_width, last_height, rtp_timestamp,
//! rtp_sequence)` and re-initializes on a dimension change, exactly as
//! specified; sequence/timestamp bookkeeping beyond that is delegated to
//! `webrtc-rs`'s `TrackLocalStaticSample`, which already packetizes
//! whatever bytes it's handed according to the track's negotiated codec —
//! the same division of labor the teacher's H.264 `peer.rs` track relies on.

use tracing::{info, warn};

pub const CLOCK_RATE_HZ: u32 = 90_000;
pub const TARGET_FPS: u32 = 30;
/// RTP timestamp increment per frame at 90 kHz / 30 fps.
pub const TIMESTAMP_INCREMENT: u32 = CLOCK_RATE_HZ / TARGET_FPS;

pub struct EncodedFragment {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

pub trait VideoEncoder: Send {
    /// Encode one BGRA8 frame. Returns `Err` on encoder failure (§7
    /// `EncodeUnavailable`); the orchestrator falls back to the still-image
    /// path over the data channel when this happens repeatedly.
    fn encode(&mut self, bgra: &[u8], width: u32, height: u32) -> anyhow::Result<EncodedFragment>;

    /// Force the next encoded fragment to be a keyframe (PLI/FIR response).
    fn force_keyframe(&mut self);
}

pub struct Vp8Encoder {
    inner: Option<vpx_encode::Encoder>,
    width: u32,
    height: u32,
    sequence: u32,
    force_next_keyframe: bool,
}

impl Vp8Encoder {
    pub fn new() -> Self {
        Self { inner: None, width: 0, height: 0, sequence: 0, force_next_keyframe: true }
    }

    fn ensure_initialized(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if self.inner.is_some() && self.width == width && self.height == height {
            return Ok(());
        }

        info!(width, height, "(re)initializing VP8 encoder for new frame dimensions");
        let config = vpx_encode::Config {
            width,
            height,
            timebase: [1, CLOCK_RATE_HZ as i32],
            bitrate: 4_000, // kbps; adaptive bitrate is out of scope (§1 Non-goals)
            codec: vpx_encode::VideoCodecId::VP8,
        };
        let encoder = vpx_encode::Encoder::new(config)
            .map_err(|e| anyhow::anyhow!("vpx encoder init failed: {e:?}"))?;

        self.inner = Some(encoder);
        self.width = width;
        self.height = height;
        self.force_next_keyframe = true;
        Ok(())
    }
}

impl Default for Vp8Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for Vp8Encoder {
    fn encode(&mut self, bgra: &[u8], width: u32, height: u32) -> anyhow::Result<EncodedFragment> {
        self.ensure_initialized(width, height)?;
        let yuv = bgra_to_i420(bgra, width, height);

        let encoder = self.inner.as_mut().expect("just ensured initialized");
        let pts = self.sequence as i64;
        let flags = if self.force_next_keyframe {
            self.force_next_keyframe = false;
            vpx_encode::EncodeFlags::FORCE_KEYFRAME
        } else {
            vpx_encode::EncodeFlags::empty()
        };

        let mut is_keyframe = false;
        let mut data = Vec::new();
        for packet in encoder
            .encode(pts, &yuv, flags)
            .map_err(|e| anyhow::anyhow!("vpx encode failed: {e:?}"))?
        {
            if let vpx_encode::Packet::Frame(frame) = packet {
                is_keyframe |= frame.key;
                data.extend_from_slice(frame.data);
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        Ok(EncodedFragment { data, is_keyframe })
    }

    fn force_keyframe(&mut self) {
        self.force_next_keyframe = true;
    }
}

/// BGRA8 → I420 (YUV 4:2:0) conversion. VP8 encoders operate on planar YUV;
/// capture produces packed BGRA, so this sits between the two unconditionally.
fn bgra_to_i420(bgra: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let chroma_w = w.div_ceil(2);
    let chroma_h = h.div_ceil(2);
    let mut out = vec![0u8; y_size + 2 * chroma_w * chroma_h];
    let (y_plane, rest) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = rest.split_at_mut(chroma_w * chroma_h);

    for row in 0..h {
        for col in 0..w {
            let px = (row * w + col) * 4;
            let (b, g, r) = (bgra[px] as f32, bgra[px + 1] as f32, bgra[px + 2] as f32);
            let y = 0.299 * r + 0.587 * g + 0.114 * b;
            y_plane[row * w + col] = y.round().clamp(0.0, 255.0) as u8;

            if row % 2 == 0 && col % 2 == 0 {
                let u = -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
                let v = 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
                let ci = (row / 2) * chroma_w + (col / 2);
                u_plane[ci] = u.round().clamp(0.0, 255.0) as u8;
                v_plane[ci] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Synthetic in-memory encoder for tests: never touches libvpx, marks every
/// Nth fragment (or any fragment after `force_keyframe`) as a keyframe.
#[derive(Default)]
pub struct FakeVideoEncoder {
    pub frames_encoded: u64,
    force_next: bool,
}

impl VideoEncoder for FakeVideoEncoder {
    fn encode(&mut self, bgra: &[u8], _width: u32, _height: u32) -> anyhow::Result<EncodedFragment> {
        self.frames_encoded += 1;
        let is_keyframe = self.force_next || self.frames_encoded == 1;
        self.force_next = false;
        Ok(EncodedFragment { data: bgra.to_vec(), is_keyframe })
    }

    fn force_keyframe(&mut self) {
        self.force_next = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_increment_matches_spec_constant() {
        assert_eq!(TIMESTAMP_INCREMENT, 3_000);
    }

    #[test]
    fn bgra_to_i420_produces_expected_plane_sizes() {
        let bgra = vec![0u8; (4 * 4 * 4) as usize];
        let yuv = bgra_to_i420(&bgra, 4, 4);
        assert_eq!(yuv.len(), 4 * 4 + 2 * 2 * 2 * 2);
    }

    #[test]
    fn fake_encoder_marks_first_frame_as_keyframe() {
        let mut encoder = FakeVideoEncoder::default();
        let fragment = encoder.encode(&[0u8; 16], 2, 2).unwrap();
        assert!(fragment.is_keyframe);
    }

    #[test]
    fn fake_encoder_marks_subsequent_frames_non_keyframe() {
        let mut encoder = FakeVideoEncoder::default();
        encoder.encode(&[0u8; 16], 2, 2).unwrap();
        let second = encoder.encode(&[0u8; 16], 2, 2).unwrap();
        assert!(!second.is_keyframe);
    }

    #[test]
    fn force_keyframe_marks_next_encode() {
        let mut encoder = FakeVideoEncoder::default();
        encoder.encode(&[0u8; 16], 2, 2).unwrap();
        encoder.force_keyframe();
        let third = encoder.encode(&[0u8; 16], 2, 2).unwrap();
        assert!(third.is_keyframe);
    }

    #[test]
    fn white_pixel_maps_to_near_max_luma() {
        let bgra = [255u8, 255, 255, 255];
        let yuv = bgra_to_i420(&bgra, 1, 1);
        assert!(yuv[0] > 250);
    }

    #[test]
    fn black_pixel_maps_to_near_zero_luma() {
        let bgra = [0u8, 0, 0, 255];
        let yuv = bgra_to_i420(&bgra, 1, 1);
        assert!(yuv[0] < 5);
    }
}
