//! Input injector capability interface (§4.9).
//!
//! OS-specific key/mouse injection is abstracted behind [`Injector`] so the
//! session core stays platform-agnostic; the `agent` binary wires in a
//! native implementation (`enigo`), this crate only ships a mock for tests.

use crate::protocol::{InputAction, Modifiers};

/// Injects keyboard and mouse events into the local desktop session.
pub trait Injector: Send + Sync {
    /// Dispatch a key event. Unknown key names are logged and dropped by
    /// the implementation, not the caller.
    fn key(&self, key: &str, action: InputAction, modifiers: &Modifiers);

    /// Dispatch a mouse event. `scroll_delta` is only meaningful for
    /// `InputAction::Scroll`.
    fn mouse(&self, x: i32, y: i32, button: &str, action: InputAction, scroll_delta: i32);

    /// Dispatch a platform key combo, e.g. `"ctrl+alt+delete"`.
    fn special_key(&self, combo: &str);
}

/// Records every call instead of touching the OS; used by session/unit tests.
#[derive(Debug, Default)]
pub struct MockInjector {
    pub calls: std::sync::Mutex<Vec<String>>,
}

impl MockInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock injector mutex poisoned").clone()
    }
}

impl Injector for MockInjector {
    fn key(&self, key: &str, action: InputAction, modifiers: &Modifiers) {
        self.calls
            .lock()
            .expect("mock injector mutex poisoned")
            .push(format!("key({key}, {action:?}, {modifiers:?})"));
    }

    fn mouse(&self, x: i32, y: i32, button: &str, action: InputAction, scroll_delta: i32) {
        self.calls
            .lock()
            .expect("mock injector mutex poisoned")
            .push(format!("mouse({x}, {y}, {button}, {action:?}, {scroll_delta})"));
    }

    fn special_key(&self, combo: &str) {
        self.calls
            .lock()
            .expect("mock injector mutex poisoned")
            .push(format!("special_key({combo})"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_injector_records_calls_in_order() {
        let injector = MockInjector::new();
        injector.key("a", InputAction::Press, &vec!["shift".to_string()]);
        injector.mouse(10, 20, "left", InputAction::Click, 0);
        injector.special_key("ctrl+alt+delete");

        let calls = injector.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("key(a"));
        assert!(calls[1].starts_with("mouse(10, 20"));
        assert_eq!(calls[2], "special_key(ctrl+alt+delete)");
    }
}
