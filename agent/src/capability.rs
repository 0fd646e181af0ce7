//! Capability implementations the session core dispatches to.
//!
//! Screen capture and input injection are OS-specific bindings explicitly
//! abstracted as capability interfaces and out of scope for this transport;
//! [`SyntheticCapture`] and [`LoggingInjector`] satisfy the trait contract
//! with deterministic, dependency-free behavior so the rest of the agent
//! (encoder negotiation, streaming, routing) is fully exercised without a
//! platform-specific capture/injection backend. The clipboard bridge is in
//! scope and backed by `arboard`, matching the pack's confirmed use of that
//! crate for cross-platform text clipboard access.

use std::sync::atomic::{AtomicU32, Ordering};
use wellcom_core::clipboard::{ClipboardBridge, ClipboardContent, EchoGuard};
use wellcom_core::encoder::{CapturedFrame, CaptureSource};
use wellcom_core::input::Injector;
use wellcom_core::protocol::{ClipboardFormat, InputAction, Modifiers};

/// Procedurally generated frame source: a drifting color gradient at the
/// configured resolution. Stands in for a real OS capture backend.
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    tick: AtomicU32,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: AtomicU32::new(0),
        }
    }
}

impl CaptureSource for SyntheticCapture {
    fn dimensions(&self, _monitor_index: u32) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&self, _monitor_index: u32) -> Option<CapturedFrame> {
        let phase = self.tick.fetch_add(1, Ordering::Relaxed) as u8;
        let mut rgb = vec![0u8; (self.width * self.height * 3) as usize];
        for (i, px) in rgb.chunks_mut(3).enumerate() {
            let x = (i as u32 % self.width) as u8;
            let y = (i as u32 / self.width) as u8;
            px[0] = x.wrapping_add(phase);
            px[1] = y.wrapping_add(phase);
            px[2] = phase;
        }
        Some(CapturedFrame {
            width: self.width,
            height: self.height,
            rgb,
        })
    }

    fn monitor_count(&self) -> u32 {
        1
    }
}

/// Logs every dispatched action instead of touching the OS input stack.
#[derive(Debug, Default)]
pub struct LoggingInjector;

impl Injector for LoggingInjector {
    fn key(&self, key: &str, action: InputAction, modifiers: &Modifiers) {
        log::debug!("injector: key {key} {action:?} modifiers={modifiers:?}");
    }

    fn mouse(&self, x: i32, y: i32, button: &str, action: InputAction, scroll_delta: i32) {
        log::debug!("injector: mouse ({x},{y}) {button} {action:?} scroll={scroll_delta}");
    }

    fn special_key(&self, combo: &str) {
        log::debug!("injector: special_key {combo}");
    }
}

/// OS clipboard bridge backed by `arboard`, text only (image clipboard
/// format conversion is out of scope).
pub struct ArboardClipboard {
    echo_guard: EchoGuard,
}

impl ArboardClipboard {
    pub fn new() -> Self {
        Self {
            echo_guard: EchoGuard::new(),
        }
    }

    /// Poll the OS clipboard and return new content if it changed and the
    /// change is not the echo of our own last remote write.
    pub fn poll_for_change(&self, last_seen: &str) -> Option<ClipboardContent> {
        let mut clipboard = arboard::Clipboard::new().ok()?;
        let text = clipboard.get_text().ok()?;
        if text == last_seen {
            return None;
        }
        if self.echo_guard.should_suppress() {
            return None;
        }
        Some(ClipboardContent {
            format: ClipboardFormat::Text,
            data: text,
        })
    }
}

impl Default for ArboardClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardBridge for ArboardClipboard {
    fn read(&self) -> Option<ClipboardContent> {
        let mut clipboard = arboard::Clipboard::new().ok()?;
        let text = clipboard.get_text().ok()?;
        Some(ClipboardContent {
            format: ClipboardFormat::Text,
            data: text,
        })
    }

    fn write(&self, content: &ClipboardContent) {
        if content.format != ClipboardFormat::Text {
            log::warn!("clipboard: dropping non-text remote write (image conversion out of scope)");
            return;
        }
        match arboard::Clipboard::new() {
            Ok(mut clipboard) => {
                if let Err(e) = clipboard.set_text(content.data.clone()) {
                    log::warn!("clipboard: failed to set OS clipboard: {e}");
                    return;
                }
                self.echo_guard.arm();
            }
            Err(e) => log::warn!("clipboard: failed to open OS clipboard: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_capture_reports_configured_dimensions() {
        let capture = SyntheticCapture::new(640, 480);
        assert_eq!(capture.dimensions(0), (640, 480));
        assert_eq!(capture.monitor_count(), 1);
    }

    #[test]
    fn synthetic_capture_produces_a_full_frame_each_tick() {
        let capture = SyntheticCapture::new(16, 9);
        let frame = capture.capture(0).unwrap();
        assert_eq!(frame.width, 16);
        assert_eq!(frame.height, 9);
        assert_eq!(frame.rgb.len(), 16 * 9 * 3);
    }

    #[test]
    fn synthetic_capture_phase_advances_between_calls() {
        let capture = SyntheticCapture::new(4, 4);
        let first = capture.capture(0).unwrap();
        let second = capture.capture(0).unwrap();
        // Same pixel position, later tick: the blue channel (phase) differs.
        assert_ne!(first.rgb[2], second.rgb[2]);
    }
}
