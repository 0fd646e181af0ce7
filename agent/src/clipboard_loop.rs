//! Polls the OS clipboard for local changes (§4.6, §4.9) and broadcasts
//! them to every live session, which echoes the change out as an
//! outbound `clipboard` frame. `arboard` has no native change-notification
//! API, so this polls on an interval the way the rest of the agent polls
//! for stream/thumbnail ticks in [`crate::session_runner::run`].

use crate::capability::ArboardClipboard;
use std::sync::Arc;
use std::time::Duration;
use wellcom_core::clipboard::ClipboardContent;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(clipboard: Arc<ArboardClipboard>, tx: tokio::sync::broadcast::Sender<ClipboardContent>) {
    let mut last_seen = String::new();
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if let Some(content) = clipboard.poll_for_change(&last_seen) {
            last_seen = content.data.clone();
            // No receivers just means no session is currently connected.
            let _ = tx.send(content);
        }
    }
}
