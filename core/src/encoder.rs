//! Per-subscription encoder pipeline (§4.7): capture → encode → wire frame.
//!
//! Hardware H.264 encoder probing (nvenc/qsv/amf) is a capability trait so
//! the default build runs the always-available `openh264` software path
//! and a platform build can supply real hardware bindings without touching
//! the session/encoder contract (§9 capability-interface re-architecture).

use crate::protocol::{Codec, Frame, Subscription};
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVBuffer;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One captured frame handed to an encoder: raw RGB24, top-left origin.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Screen capture capability interface (§4.7, §9). The `agent` binary wires
/// in a native OS capture implementation; this crate only ships a mock.
pub trait CaptureSource: Send + Sync {
    /// Current primary (or selected monitor's) dimensions.
    fn dimensions(&self, monitor_index: u32) -> (u32, u32);
    /// Grab one frame from the given monitor (0 = primary/all).
    fn capture(&self, monitor_index: u32) -> Option<CapturedFrame>;
    /// Number of available monitors, for `request_monitors`.
    fn monitor_count(&self) -> u32;
}

/// Fixed-size solid-color source for tests.
#[derive(Debug)]
pub struct MockCaptureSource {
    pub width: u32,
    pub height: u32,
}

impl CaptureSource for MockCaptureSource {
    fn dimensions(&self, _monitor_index: u32) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&self, _monitor_index: u32) -> Option<CapturedFrame> {
        Some(CapturedFrame {
            width: self.width,
            height: self.height,
            rgb: vec![0u8; (self.width * self.height * 3) as usize],
        })
    }

    fn monitor_count(&self) -> u32 {
        1
    }
}

/// A hardware H.264 encoder candidate probed in preference order
/// (`nvenc → qsv → amf`) before falling back to software.
pub trait HardwareEncoder: Send + Sync {
    fn name(&self) -> &'static str;
    /// Attempt to initialize against this frame size; `None` on failure.
    fn try_init(&self, width: u32, height: u32, crf: u8, gop_size: u32) -> Option<Box<dyn HwEncoderSession>>;
}

pub trait HwEncoderSession: Send {
    /// Encode one frame, returning NAL-unit bytes (keyframe or delta).
    fn encode(&mut self, frame: &CapturedFrame, force_keyframe: bool) -> Option<(bool, Vec<u8>)>;
}

/// Quantization derivation from a 1..=100 quality value (§4.7).
pub fn quality_to_crf(quality: u32) -> u8 {
    let crf = 51.0 - (f64::from(quality.clamp(1, 100)) / 100.0) * 41.0;
    crf.clamp(0.0, 51.0).round() as u8
}

/// Target bitrate for the software H.264 path, derived from the same
/// 1..=100 quality value as [`quality_to_crf`]. `openh264`'s `EncoderConfig`
/// has no direct CRF knob, so quality is expressed as bitrate instead,
/// scaled by frame area the way a CRF-equivalent bits-per-pixel budget
/// would be.
fn quality_to_bitrate_bps(quality: u32, width: u32, height: u32) -> u32 {
    let crf = quality_to_crf(quality);
    let bits_per_pixel = 0.22 * (1.0 - f64::from(crf) / 51.0).max(0.03);
    let pixels = f64::from(width.max(1)) * f64::from(height.max(1));
    ((pixels * bits_per_pixel * 30.0) as u32).clamp(200_000, 20_000_000)
}

fn build_software_config(subscription: &Subscription, width: u32, height: u32) -> EncoderConfig {
    let bitrate_bps = quality_to_bitrate_bps(subscription.quality, width, height);
    EncoderConfig::new()
        .max_frame_rate(subscription.fps as f32)
        .rate_control_mode(openh264::encoder::RateControlMode::Bitrate)
        .bitrate(openh264::encoder::BitRate::from_bps(bitrate_bps))
}

enum ActiveEncoder {
    Hardware(&'static str, Box<dyn HwEncoderSession>),
    SoftwareH264(Box<Encoder>),
    Mjpeg,
}

/// Negotiated result of `start_stream`: the codec and encoder name actually
/// in use, for the `stream_started` reply.
pub struct NegotiatedEncoder {
    pub codec: Codec,
    pub encoder_name: String,
    encoder: ActiveEncoder,
    width: u32,
    height: u32,
    fps: u32,
    keyframe_interval: u32,
    frames_since_keyframe: u32,
}

impl std::fmt::Debug for NegotiatedEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedEncoder")
            .field("codec", &self.codec)
            .field("encoder_name", &self.encoder_name)
            .finish()
    }
}

impl NegotiatedEncoder {
    /// Negotiate an encoder for `subscription`, probing `hw_candidates` in
    /// order when H.264 is requested and falling back to software
    /// `openh264`, or to MJPEG entirely if even that fails to construct.
    pub fn negotiate(
        subscription: &Subscription,
        width: u32,
        height: u32,
        hw_candidates: &[Box<dyn HardwareEncoder>],
    ) -> Self {
        let crf = quality_to_crf(subscription.quality);

        if subscription.codec == Codec::H264 {
            for candidate in hw_candidates {
                if let Some(session) = candidate.try_init(width, height, crf, subscription.keyframe_interval) {
                    return Self {
                        codec: Codec::H264,
                        encoder_name: candidate.name().to_string(),
                        encoder: ActiveEncoder::Hardware(candidate.name(), session),
                        width,
                        height,
                        fps: subscription.fps,
                        keyframe_interval: subscription.keyframe_interval,
                        frames_since_keyframe: 0,
                    };
                }
            }

            let config = build_software_config(subscription, width, height);
            if let Ok(encoder) = Encoder::with_api_config(openh264::OpenH264API::from_source(), config) {
                return Self {
                    codec: Codec::H264,
                    encoder_name: "software-x264".to_string(),
                    encoder: ActiveEncoder::SoftwareH264(Box::new(encoder)),
                    width,
                    height,
                    fps: subscription.fps,
                    keyframe_interval: subscription.keyframe_interval,
                    frames_since_keyframe: 0,
                };
            }

            log::warn!("encoder: no H.264 backend available, falling back to MJPEG");
        }

        Self {
            codec: Codec::Mjpeg,
            encoder_name: "mjpeg".to_string(),
            encoder: ActiveEncoder::Mjpeg,
            width,
            height,
            fps: subscription.fps,
            keyframe_interval: subscription.keyframe_interval,
            frames_since_keyframe: 0,
        }
    }

    /// Encode one captured frame into a wire [`Frame`] with the appropriate
    /// header byte, per §4.7's framing table.
    pub fn encode(
        &mut self,
        frame: &CapturedFrame,
        sequence: u32,
        quality: u32,
        force_keyframe: bool,
    ) -> Option<Frame> {
        // GOP enforcement: openh264's software encoder has no periodic
        // IDR scheduler of its own, so `keyframe_interval` (gop_size) is
        // honored here by forcing one manually once `frames_since_keyframe`
        // reaches it, the same mechanism `request_keyframe` already uses.
        let gop_due = self.keyframe_interval > 0 && self.frames_since_keyframe >= self.keyframe_interval;
        let force_keyframe = force_keyframe || gop_due;

        match &mut self.encoder {
            ActiveEncoder::Hardware(_, session) => {
                let (is_keyframe, payload) = session.encode(frame, force_keyframe)?;
                if is_keyframe {
                    self.frames_since_keyframe = 0;
                } else {
                    self.frames_since_keyframe += 1;
                }
                Some(Frame {
                    sequence,
                    is_keyframe,
                    codec_header_byte: if is_keyframe { 0x03 } else { 0x04 },
                    payload,
                })
            }
            ActiveEncoder::SoftwareH264(encoder) => {
                // `update_stream{quality}` has no live-tunable rate-control
                // knob on this encoder, so a quality change is applied by
                // rebuilding the encoder with a fresh bitrate at the next
                // keyframe boundary (the caller also requests a keyframe
                // whenever quality changes, so this lands within one frame).
                if force_keyframe {
                    let subscription = Subscription::new(self.fps, quality, Codec::H264, self.keyframe_interval);
                    let config = build_software_config(&subscription, self.width, self.height);
                    match Encoder::with_api_config(openh264::OpenH264API::from_source(), config) {
                        Ok(rebuilt) => *encoder = Box::new(rebuilt),
                        Err(e) => log::warn!("encoder: failed to rebuild h264 encoder for new quality: {e}"),
                    }
                }
                let yuv = YUVBuffer::with_rgb(
                    frame.width as usize,
                    frame.height as usize,
                    &frame.rgb,
                );
                if force_keyframe {
                    encoder.force_intra_frame();
                }
                let bitstream = encoder.encode(&yuv).ok()?;
                let is_keyframe = force_keyframe || bitstream.frame_type() == openh264::encoder::FrameType::IDR;
                if is_keyframe {
                    self.frames_since_keyframe = 0;
                } else {
                    self.frames_since_keyframe += 1;
                }
                Some(Frame {
                    sequence,
                    is_keyframe,
                    codec_header_byte: if is_keyframe { 0x03 } else { 0x04 },
                    payload: bitstream.to_vec(),
                })
            }
            ActiveEncoder::Mjpeg => {
                let img = image::RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())?;
                let mut buf = Vec::new();
                let mut cursor = std::io::Cursor::new(&mut buf);
                let mut jpeg_encoder =
                    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100) as u8);
                jpeg_encoder.encode_image(&img).ok()?;
                Some(Frame {
                    sequence,
                    is_keyframe: true,
                    codec_header_byte: 0x02,
                    payload: buf,
                })
            }
        }
    }
}

/// Live-mutable state for one active encoder task, read at the top of every
/// iteration (§4.7 "live updates", §5 single-writer ownership).
#[derive(Debug)]
pub struct EncoderControl {
    fps: AtomicU32,
    quality: AtomicU32,
    keyframe_requested: AtomicBool,
    stopped: Arc<AtomicBool>,
}

impl EncoderControl {
    pub fn new(subscription: &Subscription) -> Self {
        Self {
            fps: AtomicU32::new(subscription.fps),
            quality: AtomicU32::new(subscription.quality),
            keyframe_requested: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_fps(&self, fps: u32) {
        self.fps.store(fps.clamp(1, 60), Ordering::Relaxed);
    }

    pub fn set_quality(&self, quality: u32) {
        self.quality.store(quality.clamp(1, 100), Ordering::Relaxed);
    }

    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Relaxed);
    }

    /// Read and clear the keyframe flag (§4.7: "read and cleared before the
    /// next encode").
    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::Relaxed)
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    pub fn quality(&self) -> u32 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crf_formula_matches_spec_bounds() {
        assert_eq!(quality_to_crf(100), 10);
        assert_eq!(quality_to_crf(0), 51);
        assert_eq!(quality_to_crf(1), 51);
    }

    #[test]
    fn keyframe_request_is_read_once() {
        let control = EncoderControl::new(&Subscription::new(30, 80, Codec::H264, 60));
        assert!(!control.take_keyframe_request());
        control.request_keyframe();
        assert!(control.take_keyframe_request());
        assert!(!control.take_keyframe_request());
    }

    #[test]
    fn fps_and_quality_updates_are_clamped() {
        let control = EncoderControl::new(&Subscription::new(30, 80, Codec::H264, 60));
        control.set_fps(9000);
        assert_eq!(control.fps(), 60);
        control.set_quality(0);
        assert_eq!(control.quality(), 1);
    }
}
