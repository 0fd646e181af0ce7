//! Session core (§4.6): handshake, per-session subscription/transfer state,
//! and the control-message routing table.
//!
//! Grounded on the teacher's per-peer task-ownership pattern (one task per
//! peer, subscriptions mutated only by the owning task,§5): here, one
//! [`Session`] owns exactly the mutable state a single manager connection
//! needs, with no locking since only the session's own task touches it.

use crate::clipboard::{ClipboardBridge, ClipboardContent};
use crate::encoder::{CaptureSource, EncoderControl, NegotiatedEncoder};
use crate::error::{CoreError, CoreResult};
use crate::file_transfer::FileReceiver;
use crate::identity::CapabilityDescriptor;
use crate::input::Injector;
use crate::protocol::{ClipboardFormat, Codec, ControlMessage, InputAction, Subscription};
use std::sync::Arc;

const THUMBNAIL_PUSH_MIN: f64 = 0.2;
const THUMBNAIL_PUSH_MAX: f64 = 5.0;

/// Why a session's handshake failed; maps directly to §4.6 step 1 and the
/// `auth_fail` / close-code-4001 behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Directory rejected the token, or it could not be validated and a
    /// directory URL is configured (so dev-mode acceptance does not apply).
    TokenRejected(String),
}

/// Result of a successful handshake (§4.6 step 3 `auth_ok` payload).
#[derive(Debug, Clone)]
pub struct AuthOk {
    pub agent_id: String,
    pub hostname: String,
    pub os_info: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

const EXECUTE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Run `command` through the platform shell with a 30 s timeout (§4.6
/// `execute`), returning the `execute_result` reply. Spawn failure and
/// timeout both map to a reply rather than propagating, matching the
/// router's "never closes a session" contract.
pub async fn run_execute(command: &str) -> ControlMessage {
    let mut cmd = if cfg!(windows) {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(command);
        c
    };
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    match tokio::time::timeout(EXECUTE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => ControlMessage::ExecuteResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            returncode: output.status.code().unwrap_or(-1),
        },
        Ok(Err(e)) => ControlMessage::ExecuteResult {
            stdout: String::new(),
            stderr: format!("failed to spawn command: {e}"),
            returncode: -1,
        },
        Err(_) => ControlMessage::ExecuteResult {
            stdout: String::new(),
            stderr: "command timed out after 30s".to_string(),
            returncode: -1,
        },
    }
}

/// Validate `token` against the directory, or accept unconditionally in
/// dev mode (no directory URL configured) per §4.6 step 1.
pub async fn authenticate(
    directory: Option<&crate::directory_client::DirectoryClient>,
    token: &str,
) -> Result<(), AuthError> {
    match directory {
        None => Ok(()), // dev mode: no directory configured, accept
        Some(client) => client
            .validate_token(token)
            .await
            .map(|_| ())
            .map_err(|e| AuthError::TokenRejected(e.to_string())),
    }
}

/// One live manager↔agent session: owns subscriptions, the in-flight file
/// transfer (if any), and the capability trait objects it dispatches to.
pub struct Session {
    pub manager_id: String,
    capability: CapabilityDescriptor,
    capture: Arc<dyn CaptureSource>,
    injector: Arc<dyn Injector>,
    clipboard: Arc<dyn ClipboardBridge>,
    encoder: Option<NegotiatedEncoder>,
    encoder_control: Option<Arc<EncoderControl>>,
    monitor_index: u32,
    file_receiver: FileReceiver,
    thumbnail_push_interval: Option<f64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("manager_id", &self.manager_id)
            .field("has_encoder", &self.encoder.is_some())
            .field("is_receiving_file", &self.file_receiver.is_receiving())
            .finish()
    }
}

impl Session {
    pub fn new(
        manager_id: String,
        capability: CapabilityDescriptor,
        capture: Arc<dyn CaptureSource>,
        injector: Arc<dyn Injector>,
        clipboard: Arc<dyn ClipboardBridge>,
        save_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            manager_id,
            capability,
            capture,
            injector,
            clipboard,
            encoder: None,
            encoder_control: None,
            monitor_index: 0,
            file_receiver: FileReceiver::new(save_dir),
            thumbnail_push_interval: None,
        }
    }

    /// Whether an encoder task should currently be driven by the owning
    /// transport loop.
    pub fn is_streaming(&self) -> bool {
        self.encoder.is_some() && self.encoder_control.as_ref().is_some_and(|c| !c.is_stopped())
    }

    /// Target frame interval for the active stream, if any.
    pub fn stream_fps(&self) -> Option<u32> {
        self.encoder_control.as_ref().map(|c| c.fps())
    }

    /// Active thumbnail-push interval in seconds, if `start_thumbnail_push`
    /// is in effect.
    pub fn thumbnail_push_interval(&self) -> Option<f64> {
        self.thumbnail_push_interval
    }

    /// Capture, encode, and wire-frame one tick of the active stream
    /// (§4.7's per-iteration loop body): read live fps/quality/keyframe
    /// state, encode, and return the frame the owning transport should send.
    pub fn encode_tick(&mut self, sequence: u32) -> Option<crate::protocol::Frame> {
        let control = self.encoder_control.as_ref()?;
        if control.is_stopped() {
            return None;
        }
        let quality = control.quality();
        let force_keyframe = control.take_keyframe_request();
        let frame = self.capture.capture(self.monitor_index)?;
        self.encoder.as_mut()?.encode(&frame, sequence, quality, force_keyframe)
    }

    pub fn auth_ok(&self, agent_id: &str, hostname: &str) -> AuthOk {
        AuthOk {
            agent_id: agent_id.to_string(),
            hostname: hostname.to_string(),
            os_info: self.capability.os.clone(),
            screen_width: self.capability.screen_width,
            screen_height: self.capability.screen_height,
        }
    }

    /// Dispatch one decoded control message (§4.6's table), returning the
    /// replies to send back (zero, one, or several — e.g. file progress and
    /// eventual completion are two separate replies to the same binary
    /// stream of chunks, but control messages reply 1:1 here).
    pub fn handle(&mut self, message: ControlMessage) -> Vec<ControlMessage> {
        match message {
            ControlMessage::Ping => vec![ControlMessage::Pong],

            ControlMessage::RequestThumbnail => self.handle_request_thumbnail(),

            ControlMessage::StartStream {
                fps,
                quality,
                codec,
                keyframe_interval,
            } => self.handle_start_stream(fps, quality, codec, keyframe_interval),

            ControlMessage::UpdateStream { fps, quality } => {
                if let Some(control) = &self.encoder_control {
                    if let Some(fps) = fps {
                        control.set_fps(fps);
                    }
                    if let Some(quality) = quality {
                        control.set_quality(quality);
                        // H.264's rate control is only re-applied on a
                        // keyframe boundary; force one so the new quality
                        // takes effect within one frame as MJPEG's does.
                        control.request_keyframe();
                    }
                }
                Vec::new()
            }

            ControlMessage::StopStream => {
                if let Some(control) = self.encoder_control.take() {
                    control.stop();
                }
                self.encoder = None;
                Vec::new()
            }

            ControlMessage::RequestKeyframe => {
                if let Some(control) = &self.encoder_control {
                    control.request_keyframe();
                }
                Vec::new()
            }

            ControlMessage::StartThumbnailPush { interval } => {
                self.thumbnail_push_interval = Some(interval.clamp(THUMBNAIL_PUSH_MIN, THUMBNAIL_PUSH_MAX));
                Vec::new()
            }

            ControlMessage::StopThumbnailPush => {
                self.thumbnail_push_interval = None;
                Vec::new()
            }

            ControlMessage::KeyEvent {
                key,
                action,
                modifiers,
            } => {
                self.injector.key(&key, action, &modifiers);
                Vec::new()
            }

            ControlMessage::MouseEvent {
                x,
                y,
                button,
                action,
                scroll_delta,
            } => {
                self.injector.mouse(x, y, &button, action, scroll_delta);
                Vec::new()
            }

            ControlMessage::SpecialKey { combo } => {
                self.injector.special_key(&combo);
                Vec::new()
            }

            ControlMessage::Clipboard { format, data } => {
                self.clipboard.write(&ClipboardContent { format, data });
                Vec::new()
            }

            ControlMessage::GetClipboard => match self.clipboard.read() {
                Some(content) => vec![ControlMessage::Clipboard {
                    format: content.format,
                    data: content.data,
                }],
                None => vec![ControlMessage::Clipboard {
                    format: ClipboardFormat::Text,
                    data: String::new(),
                }],
            },

            ControlMessage::FileStart { name, size } => self.handle_file_start(&name, size),

            ControlMessage::FileEnd => self.handle_file_end(),

            ControlMessage::RequestMonitors => {
                vec![ControlMessage::ConnectionModeChanged {
                    mode: format!("monitors:{}", self.capture.monitor_count()),
                }]
            }

            ControlMessage::SelectMonitor { id } => {
                self.monitor_index = id;
                Vec::new()
            }

            ControlMessage::Unknown => vec![ControlMessage::AuthFail {
                reason: "unknown_type".to_string(),
            }],

            // Execute/update_request are intercepted by the owning async
            // transport loop before reaching this synchronous router (see
            // `session_runner::dispatch_text`); they only land here if
            // dispatched directly, in which case dropping them is still
            // correct since that caller owns the real reply. Audio toggles
            // stay no-ops: no audio capability interface is defined anywhere
            // in this codebase, unlike the explicit injector/clipboard/file
            // traits. Auth/auth_ok/... are transport-level and never reach
            // `handle`.
            _ => Vec::new(),
        }
    }

    fn handle_request_thumbnail(&self) -> Vec<ControlMessage> {
        match self.capture.capture(0) {
            Some(frame) => {
                let img = match image::RgbImage::from_raw(frame.width, frame.height, frame.rgb) {
                    Some(img) => img,
                    None => return Vec::new(),
                };
                let mut buf = Vec::new();
                let mut cursor = std::io::Cursor::new(&mut buf);
                let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, 70);
                if encoder.encode_image(&img).is_err() {
                    return Vec::new();
                }
                vec![ControlMessage::Thumbnail { data: buf }]
            }
            None => Vec::new(),
        }
    }

    fn handle_start_stream(
        &mut self,
        fps: u32,
        quality: u32,
        codec: Codec,
        keyframe_interval: u32,
    ) -> Vec<ControlMessage> {
        let subscription = Subscription::new(fps, quality, codec, keyframe_interval);
        let (width, height) = self.capture.dimensions(self.monitor_index);
        let negotiated = NegotiatedEncoder::negotiate(&subscription, width, height, &[]);
        let reply = ControlMessage::StreamStarted {
            codec: negotiated.codec,
            encoder: negotiated.encoder_name.clone(),
            width,
            height,
            fps: subscription.fps,
            quality: subscription.quality,
        };
        self.encoder_control = Some(Arc::new(EncoderControl::new(&subscription)));
        self.encoder = Some(negotiated);
        vec![reply]
    }

    fn handle_file_start(&mut self, name: &str, size: u64) -> Vec<ControlMessage> {
        match self.file_receiver.begin_file(name, size) {
            Ok(()) => vec![ControlMessage::FileAck {
                ready: true,
                error: None,
            }],
            Err(e) => vec![ControlMessage::FileAck {
                ready: false,
                error: Some(e.to_string()),
            }],
        }
    }

    /// Append a binary chunk to the in-flight transfer (§4.6 "binary frame
    /// during transfer"), returning the progress reply.
    pub fn handle_file_chunk(&mut self, data: &[u8]) -> Option<ControlMessage> {
        let total = self.file_receiver.declared_size()?;
        let received = self.file_receiver.write_chunk(data).ok()?;
        Some(ControlMessage::FileProgress { received, total })
    }

    fn handle_file_end(&mut self) -> Vec<ControlMessage> {
        match self.file_receiver.finish_file() {
            Ok(path) => vec![ControlMessage::FileComplete {
                path: path.to_string_lossy().to_string(),
                status: "ok".to_string(),
            }],
            Err(e) => vec![ControlMessage::FileComplete {
                path: String::new(),
                status: format!("error: {e}"),
            }],
        }
    }

    /// Cancel any in-flight transfer and stop the encoder; called when the
    /// session is superseded or closed (§4.6 step 2, §5 cancellation).
    pub fn close(&mut self) {
        if let Some(control) = self.encoder_control.take() {
            control.stop();
        }
        self.encoder = None;
        self.file_receiver.cancel();
    }

    pub fn declare_auth_fail(reason: impl Into<String>) -> ControlMessage {
        ControlMessage::AuthFail {
            reason: reason.into(),
        }
    }
}

/// Error reported when a control message is invalid for CoreError-wrapping
/// call sites (the router itself is infallible: routing never closes a
/// session, per §7's "Protocol violation ⇒ drop message, don't close").
pub fn protocol_violation(detail: impl Into<String>) -> CoreError {
    CoreError::Protocol(detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MockClipboardBridge;
    use crate::encoder::MockCaptureSource;
    use crate::input::MockInjector;

    fn make_session() -> Session {
        Session::new(
            "manager-1".to_string(),
            CapabilityDescriptor {
                os: "linux".into(),
                screen_width: 1920,
                screen_height: 1080,
                agent_version: "0.1.0".into(),
                hardware_summary: "test".into(),
            },
            Arc::new(MockCaptureSource {
                width: 1920,
                height: 1080,
            }),
            Arc::new(MockInjector::new()),
            Arc::new(MockClipboardBridge::new()),
            tempfile::tempdir().unwrap().keep(),
        )
    }

    #[test]
    fn ping_replies_pong() {
        let mut session = make_session();
        let replies = session.handle(ControlMessage::Ping);
        assert!(matches!(replies.as_slice(), [ControlMessage::Pong]));
    }

    #[test]
    fn start_stream_negotiates_and_replies_stream_started() {
        let mut session = make_session();
        let replies = session.handle(ControlMessage::StartStream {
            fps: 30,
            quality: 80,
            codec: Codec::Mjpeg,
            keyframe_interval: 60,
        });
        match &replies[..] {
            [ControlMessage::StreamStarted { codec, width, height, .. }] => {
                assert_eq!(*codec, Codec::Mjpeg);
                assert_eq!(*width, 1920);
                assert_eq!(*height, 1080);
            }
            other => panic!("unexpected replies: {other:?}"),
        }
        assert!(session.encoder.is_some());
        assert!(session.is_streaming());

        session.handle(ControlMessage::StopStream);
        assert!(session.encoder.is_none());
        assert!(!session.is_streaming());
    }

    #[test]
    fn encode_tick_produces_frames_until_stopped() {
        let mut session = make_session();
        session.handle(ControlMessage::StartStream {
            fps: 30,
            quality: 80,
            codec: Codec::Mjpeg,
            keyframe_interval: 60,
        });
        let frame = session.encode_tick(1).expect("mjpeg encode should succeed");
        assert_eq!(frame.codec_header_byte, 0x02);
        assert_eq!(frame.sequence, 1);

        session.handle(ControlMessage::StopStream);
        assert!(session.encode_tick(2).is_none());
    }

    #[test]
    fn unknown_message_replies_auth_fail_with_unknown_type() {
        let mut session = make_session();
        let replies = session.handle(ControlMessage::Unknown);
        match &replies[..] {
            [ControlMessage::AuthFail { reason }] => assert_eq!(reason, "unknown_type"),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[test]
    fn file_transfer_round_trips_through_session() {
        let mut session = make_session();
        let replies = session.handle(ControlMessage::FileStart {
            name: "x.bin".into(),
            size: 4,
        });
        assert!(matches!(
            replies.as_slice(),
            [ControlMessage::FileAck { ready: true, .. }]
        ));

        let progress = session.handle_file_chunk(b"data").unwrap();
        assert!(matches!(progress, ControlMessage::FileProgress { received: 4, .. }));

        let replies = session.handle(ControlMessage::FileEnd);
        match &replies[..] {
            [ControlMessage::FileComplete { status, .. }] => assert_eq!(status, "ok"),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[test]
    fn clipboard_write_then_read_round_trips() {
        let mut session = make_session();
        session.handle(ControlMessage::Clipboard {
            format: ClipboardFormat::Text,
            data: "hello".into(),
        });
        let replies = session.handle(ControlMessage::GetClipboard);
        match &replies[..] {
            [ControlMessage::Clipboard { data, .. }] => assert_eq!(data, "hello"),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_execute_captures_stdout_and_exit_code() {
        let shell_cmd = if cfg!(windows) { "echo hello" } else { "echo hello" };
        let reply = run_execute(shell_cmd).await;
        match reply {
            ControlMessage::ExecuteResult { stdout, returncode, .. } => {
                assert!(stdout.contains("hello"));
                assert_eq!(returncode, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_execute_reports_nonzero_exit_code() {
        let shell_cmd = if cfg!(windows) { "exit 3" } else { "exit 3" };
        let reply = run_execute(shell_cmd).await;
        match reply {
            ControlMessage::ExecuteResult { returncode, .. } => assert_eq!(returncode, 3),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn key_and_mouse_events_dispatch_to_injector() {
        let mut session = make_session();
        session.handle(ControlMessage::KeyEvent {
            key: "a".into(),
            action: InputAction::Press,
            modifiers: vec![],
        });
        session.handle(ControlMessage::MouseEvent {
            x: 1,
            y: 2,
            button: "left".into(),
            action: InputAction::Click,
            scroll_delta: 0,
        });
        // No panics and no replies expected; dispatch happened synchronously.
    }
}
