//! Control-message and session-data types (§3, §4.6, §6).
//!
//! Control messages are tagged JSON sums, replacing the dynamic `type`-string
//! dispatch of the source with a central router and an explicit `Unknown`
//! case (§9 re-architecture note).

use serde::{Deserialize, Serialize};

/// Codec preference for a streaming subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Mjpeg,
}

/// Per-session mutable streaming settings (§3 Subscription).
///
/// Changing `fps`/`quality` is live; changing `codec` or `monitor` restarts
/// the encoder task.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Target frames per second, clamped to 1..=60.
    pub fps: u32,
    /// Target quality, clamped to 1..=100.
    pub quality: u32,
    pub codec: Codec,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    /// 0 = all monitors.
    pub monitor_index: u32,
}

impl Subscription {
    pub fn new(fps: u32, quality: u32, codec: Codec, keyframe_interval: u32) -> Self {
        Self {
            fps: fps.clamp(1, 60),
            quality: quality.clamp(1, 100),
            codec,
            keyframe_interval,
            monitor_index: 0,
        }
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.fps = fps.clamp(1, 60);
    }

    pub fn set_quality(&mut self, quality: u32) {
        self.quality = quality.clamp(1, 100);
    }
}

/// A unit the encoder emits (§3 Frame).
#[derive(Debug, Clone)]
pub struct Frame {
    /// 32-bit wrapping counter, monotonic per session.
    pub sequence: u32,
    pub is_keyframe: bool,
    /// Wire header byte: 0x02 MJPEG, 0x03 H264 key, 0x04 H264 delta.
    pub codec_header_byte: u8,
    pub payload: Vec<u8>,
}

/// Per-session inbound file transfer state (§3, §4.9).
///
/// At most one concurrent inbound transfer per session; enforced by the
/// session core holding `Option<FileTransferState>`.
#[derive(Debug)]
pub struct FileTransferState {
    pub target_name: String,
    pub declared_size: u64,
    pub bytes_received: u64,
}

impl FileTransferState {
    pub fn new(target_name: String, declared_size: u64) -> Self {
        Self {
            target_name,
            declared_size,
            bytes_received: 0,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.declared_size == 0 {
            return 0.0;
        }
        (self.bytes_received as f64 / self.declared_size as f64).min(1.0)
    }
}

/// 16-byte opaque value minted by the NAT-punch initiator (§3 Punch token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PunchToken(pub [u8; 16]);

impl PunchToken {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rngs::ThreadRng::default().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(hex_pair, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

/// Modifier keys held for the duration of a single `press`.
pub type Modifiers = Vec<String>;

/// Input action kind (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputAction {
    Press,
    Release,
    Click,
    DoubleClick,
    Move,
    Scroll,
}

/// Clipboard payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardFormat {
    Text,
    Image,
}

/// A control message, delivered reliably over the UDP channel's `CONTROL`
/// type or over a WebSocket text frame (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Auth {
        manager_id: String,
        token: String,
    },
    AuthOk {
        agent_id: String,
        hostname: String,
        os_info: String,
        screen_width: u32,
        screen_height: u32,
    },
    AuthFail {
        reason: String,
    },
    Ping,
    Pong,
    RequestThumbnail,
    Thumbnail {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    StartStream {
        fps: u32,
        quality: u32,
        codec: Codec,
        keyframe_interval: u32,
    },
    StreamStarted {
        codec: Codec,
        encoder: String,
        width: u32,
        height: u32,
        fps: u32,
        quality: u32,
    },
    UpdateStream {
        #[serde(default)]
        fps: Option<u32>,
        #[serde(default)]
        quality: Option<u32>,
    },
    StopStream,
    RequestKeyframe,
    StartThumbnailPush {
        interval: f64,
    },
    StopThumbnailPush,
    KeyEvent {
        key: String,
        action: InputAction,
        modifiers: Modifiers,
    },
    MouseEvent {
        x: i32,
        y: i32,
        button: String,
        action: InputAction,
        scroll_delta: i32,
    },
    SpecialKey {
        combo: String,
    },
    Clipboard {
        format: ClipboardFormat,
        data: String,
    },
    GetClipboard,
    FileStart {
        name: String,
        size: u64,
    },
    FileAck {
        ready: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileEnd,
    FileComplete {
        path: String,
        status: String,
    },
    FileProgress {
        received: u64,
        total: u64,
    },
    Execute {
        command: String,
    },
    ExecuteResult {
        stdout: String,
        stderr: String,
        returncode: i32,
    },
    UpdateRequest,
    UpdateStarted,
    RequestMonitors,
    SelectMonitor {
        id: u32,
    },
    StartAudioStream,
    StopAudioStream,
    ConnectionModeChanged {
        mode: String,
    },
    /// Catch-all for any `type` the router doesn't recognise (§9).
    #[serde(other)]
    Unknown,
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_round_trips_through_json() {
        let msg = ControlMessage::StartStream {
            fps: 30,
            quality: 80,
            codec: Codec::H264,
            keyframe_interval: 60,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        match back {
            ControlMessage::StartStream { fps, quality, .. } => {
                assert_eq!(fps, 30);
                assert_eq!(quality, 80);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_decodes_to_unknown_variant() {
        let json = r#"{"type":"some_future_message","foo":1}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ControlMessage::Unknown));
    }

    #[test]
    fn subscription_clamps_fps_and_quality() {
        let mut sub = Subscription::new(1000, 0, Codec::Mjpeg, 30);
        assert_eq!(sub.fps, 60);
        assert_eq!(sub.quality, 1);
        sub.set_fps(0);
        assert_eq!(sub.fps, 1);
        sub.set_quality(500);
        assert_eq!(sub.quality, 100);
    }

    #[test]
    fn punch_token_hex_round_trips() {
        let token = PunchToken::random();
        let hex = token.to_hex();
        assert_eq!(hex.len(), 32);
        let back = PunchToken::from_hex(&hex).unwrap();
        assert_eq!(token, back);
    }

    #[test]
    fn file_transfer_progress_clamped() {
        let mut state = FileTransferState::new("x.bin".into(), 100);
        state.bytes_received = 50;
        assert!((state.progress() - 0.5).abs() < f64::EPSILON);
        state.bytes_received = 1000;
        assert!((state.progress() - 1.0).abs() < f64::EPSILON);
    }
}
