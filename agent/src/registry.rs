//! Per-manager session supersession (§3 invariant i, §8 P6): at most one
//! live session per (agent, manager-id); a new handshake closes the old
//! transport within 1 s.
//!
//! Backed by a `watch` channel rather than `Notify`: `watch::Sender::send`
//! marks the channel changed regardless of whether the receiver is
//! currently polling, so a supersession signal sent between the old
//! session's select-loop iterations is never lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

struct Entry {
    id: u64,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

/// A registered session's cancellation handle, returned by `register` and
/// passed back to `unregister`.
pub struct Registration {
    id: u64,
    pub cancel_rx: watch::Receiver<bool>,
}

impl SessionRegistry {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Register a new session for `manager_id`, superseding any prior one
    /// by flipping its `cancel_rx` to `true`.
    pub fn register(&self, manager_id: &str) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut live = self.live.lock().expect("session registry mutex poisoned");
        if let Some(old) = live.insert(manager_id.to_string(), Entry { id, cancel_tx }) {
            let _ = old.cancel_tx.send(true);
        }
        Registration { id, cancel_rx }
    }

    /// Remove `manager_id`'s entry if `registration` is still the current
    /// one (i.e. this session wasn't itself already superseded).
    pub fn unregister(&self, manager_id: &str, registration: &Registration) {
        let mut live = self.live.lock().expect("session registry mutex poisoned");
        if live.get(manager_id).is_some_and(|e| e.id == registration.id) {
            live.remove(manager_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.live.lock().expect("session registry mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_register_signals_first_receiver() {
        let registry = SessionRegistry::new();
        let mut first = registry.register("manager-1");
        assert!(!*first.cancel_rx.borrow());

        let _second = registry.register("manager-1");
        first.cancel_rx.changed().await.unwrap();
        assert!(*first.cancel_rx.borrow());
    }

    #[tokio::test]
    async fn unregister_drops_entry_when_not_superseded() {
        let registry = SessionRegistry::new();
        let reg = registry.register("manager-1");
        assert_eq!(registry.active_count(), 1);
        registry.unregister("manager-1", &reg);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn unregister_is_noop_after_supersession() {
        let registry = SessionRegistry::new();
        let first = registry.register("manager-1");
        let _second = registry.register("manager-1");
        registry.unregister("manager-1", &first);
        assert_eq!(registry.active_count(), 1);
    }
}
