//! Decoder pipeline (§4.8, manager side): gap detection, keyframe-wait
//! recovery, and error-count-driven decoder resets.

use crate::protocol::Codec;
use openh264::decoder::Decoder;
use openh264::OpenH264API;

const RESET_THRESHOLD: u32 = 3;
const RESTART_THRESHOLD: u32 = 5;

/// One decoded image handed to the display surface.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// What the pipeline did with one incoming frame; useful for tests and
/// logging without re-deriving it from decoder side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded,
    DroppedWaitingForKeyframe,
    GapDetectedWaitingForKeyframe,
    DecoderReset,
    DecoderRestarted,
    DecodeError,
}

/// Stateful H.264 decoder with the recovery rules of §4.8.
pub struct H264Decoder {
    decoder: Decoder,
    last_seq: Option<u32>,
    waiting_for_keyframe: bool,
    consecutive_errors: u32,
}

impl std::fmt::Debug for H264Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H264Decoder")
            .field("last_seq", &self.last_seq)
            .field("waiting_for_keyframe", &self.waiting_for_keyframe)
            .field("consecutive_errors", &self.consecutive_errors)
            .finish()
    }
}

impl H264Decoder {
    pub fn new() -> Result<Self, String> {
        let decoder = Decoder::new(OpenH264API::from_source()).map_err(|e| format!("{e}"))?;
        Ok(Self {
            decoder,
            last_seq: None,
            waiting_for_keyframe: false,
            consecutive_errors: 0,
        })
    }

    fn recreate(&mut self) {
        match Decoder::new(OpenH264API::from_source()) {
            Ok(decoder) => self.decoder = decoder,
            Err(e) => log::error!("decoder: failed to recreate H.264 decoder: {e}"),
        }
    }

    /// Feed one NAL unit. `is_keyframe` is taken from the wire header byte
    /// (0x03 key / 0x04 delta), `sequence` from the frame's seq field.
    ///
    /// Returns the decode outcome and, if a full image resulted, the
    /// decoded RGB image.
    pub fn feed(
        &mut self,
        sequence: u32,
        is_keyframe: bool,
        nal: &[u8],
    ) -> (DecodeOutcome, Option<DecodedImage>) {
        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            if sequence != expected && !is_keyframe {
                log::warn!("decoder: sequence gap, expected {expected} got {sequence}");
                self.waiting_for_keyframe = true;
                return (DecodeOutcome::GapDetectedWaitingForKeyframe, None);
            }
        }

        if self.waiting_for_keyframe {
            if !is_keyframe {
                return (DecodeOutcome::DroppedWaitingForKeyframe, None);
            }
            self.recreate();
            self.waiting_for_keyframe = false;
            self.consecutive_errors = 0;
        }

        self.last_seq = Some(sequence);

        match self.decoder.decode(nal) {
            Ok(Some(yuv)) => {
                let (width, height) = yuv.dimensions();
                let mut rgb = vec![0u8; width * height * 3];
                yuv.write_rgb8(&mut rgb);
                (
                    DecodeOutcome::Decoded,
                    Some(DecodedImage {
                        width: width as u32,
                        height: height as u32,
                        rgb,
                    }),
                )
            }
            Ok(None) => (DecodeOutcome::Decoded, None),
            Err(e) => {
                log::warn!("decoder: decode error: {e}");
                self.consecutive_errors += 1;
                if self.consecutive_errors >= RESTART_THRESHOLD {
                    self.recreate();
                    self.waiting_for_keyframe = true;
                    self.consecutive_errors = 0;
                    return (DecodeOutcome::DecoderRestarted, None);
                }
                if self.consecutive_errors >= RESET_THRESHOLD {
                    self.recreate();
                    self.waiting_for_keyframe = true;
                    return (DecodeOutcome::DecoderReset, None);
                }
                (DecodeOutcome::DecodeError, None)
            }
        }
    }

    pub fn request_keyframe(&mut self) {
        self.waiting_for_keyframe = true;
    }
}

/// MJPEG frames are self-contained; no gap handling needed (§4.8).
pub fn decode_mjpeg(jpeg: &[u8]) -> Result<DecodedImage, String> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| format!("mjpeg decode error: {e}"))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok(DecodedImage {
        width,
        height,
        rgb: img.into_raw(),
    })
}

/// Dispatch by codec header byte to the right decode path, used by the
/// session/decoder-owning task.
pub fn codec_for_header_byte(byte: u8) -> Option<Codec> {
    match byte {
        0x02 => Some(Codec::Mjpeg),
        0x03 | 0x04 => Some(Codec::H264),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_byte_maps_to_codec() {
        assert_eq!(codec_for_header_byte(0x02), Some(Codec::Mjpeg));
        assert_eq!(codec_for_header_byte(0x03), Some(Codec::H264));
        assert_eq!(codec_for_header_byte(0x04), Some(Codec::H264));
        assert_eq!(codec_for_header_byte(0xFF), None);
    }

    /// P5 (decoder recovery): a sequence gap on a delta frame sets
    /// waiting_for_keyframe and drops subsequent deltas until a keyframe
    /// arrives.
    #[test]
    fn gap_on_delta_frame_enters_waiting_state() {
        let mut decoder = match H264Decoder::new() {
            Ok(d) => d,
            Err(_) => return, // openh264 native lib unavailable in this environment
        };
        decoder.last_seq = Some(10);
        let (outcome, _) = decoder.feed(15, false, &[]);
        assert_eq!(outcome, DecodeOutcome::GapDetectedWaitingForKeyframe);
        assert!(decoder.waiting_for_keyframe);

        let (outcome, _) = decoder.feed(16, false, &[]);
        assert_eq!(outcome, DecodeOutcome::DroppedWaitingForKeyframe);
    }
}
