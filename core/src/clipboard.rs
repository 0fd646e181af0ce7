//! Clipboard bridge capability interface (§4.9) with echo suppression (§9).
//!
//! A remote-originated clipboard write must not be observed and re-broadcast
//! as if the local user had copied it. We model that with an explicit
//! `EchoGuard` state the bridge consults before firing its change callback,
//! rather than the source's looser "just compare to last seen" approach.

use crate::protocol::ClipboardFormat;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const ECHO_SUPPRESS_WINDOW: Duration = Duration::from_millis(500);

/// Local clipboard content observed or set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardContent {
    pub format: ClipboardFormat,
    pub data: String,
}

/// Reads and writes the OS clipboard. The `agent` binary wires in a native
/// implementation (`arboard`); this crate only ships a mock for tests.
pub trait ClipboardBridge: Send + Sync {
    fn read(&self) -> Option<ClipboardContent>;
    fn write(&self, content: &ClipboardContent);
}

/// Suppresses exactly one clipboard-changed notification after a
/// remote-originated write, then auto-clears (§9). Cleared early if
/// `ECHO_SUPPRESS_WINDOW` elapses without the expected notification, so a
/// missed OS event can't permanently swallow future local copies.
#[derive(Debug)]
pub struct EchoGuard {
    armed_at: Mutex<Option<Instant>>,
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self {
            armed_at: Mutex::new(None),
        }
    }
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call immediately after writing remote content to the local clipboard.
    pub fn arm(&self) {
        *self.armed_at.lock().expect("echo guard mutex poisoned") = Some(Instant::now());
    }

    /// Call when the OS reports a clipboard change. Returns `true` if this
    /// change should be suppressed (not broadcast) because it is the echo
    /// of our own remote write.
    pub fn should_suppress(&self) -> bool {
        let mut guard = self.armed_at.lock().expect("echo guard mutex poisoned");
        match *guard {
            Some(armed_at) if armed_at.elapsed() <= ECHO_SUPPRESS_WINDOW => {
                *guard = None;
                true
            }
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }
}

/// In-memory clipboard for tests; `write` arms the supplied [`EchoGuard`]
/// the way a native implementation would after a remote-originated write.
#[derive(Debug)]
pub struct MockClipboardBridge {
    content: Mutex<Option<ClipboardContent>>,
}

impl Default for MockClipboardBridge {
    fn default() -> Self {
        Self {
            content: Mutex::new(None),
        }
    }
}

impl MockClipboardBridge {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClipboardBridge for MockClipboardBridge {
    fn read(&self) -> Option<ClipboardContent> {
        self.content.lock().expect("mock clipboard mutex poisoned").clone()
    }

    fn write(&self, content: &ClipboardContent) {
        *self.content.lock().expect("mock clipboard mutex poisoned") = Some(content.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// P8: a remote-originated clipboard write does not round-trip back out
    /// as a local change notification.
    #[test]
    fn armed_guard_suppresses_next_change_once() {
        let guard = EchoGuard::new();
        guard.arm();
        assert!(guard.should_suppress());
        assert!(!guard.should_suppress());
    }

    #[test]
    fn unarmed_guard_never_suppresses() {
        let guard = EchoGuard::new();
        assert!(!guard.should_suppress());
    }

    #[test]
    fn mock_clipboard_round_trips_content() {
        let bridge = MockClipboardBridge::new();
        assert!(bridge.read().is_none());
        let content = ClipboardContent {
            format: ClipboardFormat::Text,
            data: "hello".into(),
        };
        bridge.write(&content);
        assert_eq!(bridge.read(), Some(content));
    }
}
