//! Directory registration/heartbeat loop (§6, §4.4 signaling availability).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wellcom_core::directory_client::DirectoryClient;
use wellcom_core::identity::CapabilityDescriptor;

/// Runs forever: register once, then heartbeat every `interval`. Flips
/// `signaling_available` to false on repeated auth failure so the
/// connection manager (manager side) knows not to expect punch/relay.
pub async fn run(
    directory: Arc<DirectoryClient>,
    token: String,
    agent_id: String,
    hostname: String,
    capability: CapabilityDescriptor,
    heartbeat_interval: Duration,
    signaling_available: Arc<AtomicBool>,
) {
    loop {
        match directory.register(&token, &agent_id, &hostname, &capability).await {
            Ok(()) => {
                signaling_available.store(true, Ordering::Relaxed);
                break;
            }
            Err(e) => {
                log::warn!("directory: registration failed, retrying in 10s: {e}");
                signaling_available.store(false, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    }

    let mut ticker = tokio::time::interval(heartbeat_interval);
    loop {
        ticker.tick().await;
        match directory.heartbeat(&token, &agent_id).await {
            Ok(()) => signaling_available.store(true, Ordering::Relaxed),
            Err(e) => {
                log::warn!("directory: heartbeat failed: {e}");
                signaling_available.store(false, Ordering::Relaxed);
            }
        }
    }
}
