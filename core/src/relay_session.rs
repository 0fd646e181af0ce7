//! Relay WebSocket session (§4.5, agent side): outbound-maintained
//! persistent connection to the directory's relay endpoint used for
//! signaling and data fallback.
//!
//! Grounded on the teacher's `relay/connection.rs` shape: an `mpsc` output
//! channel drained by a `tokio::select!` loop, with a `oneshot` the caller
//! can await for shutdown. Unlike the teacher, which speaks
//! `ActionCableChannel` with Signal-protocol encryption, this session speaks
//! `tokio-tungstenite` directly since TLS alone is in scope (no E2E
//! encryption beyond TLS/JWT).

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(20);
const RECONNECT_WAIT: Duration = Duration::from_secs(30);

/// An outbound frame queued for the relay.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// An inbound frame the relay delivered, addressed to this agent.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Handle for queuing frames to the relay session's outbound side.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl std::fmt::Debug for RelaySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySender").finish_non_exhaustive()
    }
}

impl RelaySender {
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(OutboundFrame::Text(text.into())).await.is_ok()
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> bool {
        self.tx.send(OutboundFrame::Binary(data)).await.is_ok()
    }
}

/// Why the relay session loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    NetworkError,
    ServerRejected,
    Shutdown,
}

/// Connect to the relay, send `agent_hello`, and run the select loop until
/// the connection drops or the caller signals shutdown (§4.5).
///
/// Returns a sender for outbound frames, a receiver for inbound frames, and
/// a receiver that resolves with the [`CloseReason`] when the loop exits.
/// The caller is responsible for the 30 s reconnect-after-failure policy;
/// this function performs exactly one connection attempt and one run.
pub async fn connect(
    relay_url: &str,
    agent_id: &str,
    token: &str,
) -> Result<(RelaySender, mpsc::Receiver<InboundFrame>, oneshot::Receiver<CloseReason>), String> {
    let url = format!(
        "{relay_url}?token={token}",
        relay_url = relay_url.trim_end_matches('/')
    );
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| format!("relay connect failed: {e}"))?;
    let (mut write, mut read) = ws_stream.split();

    let hello = serde_json::json!({"type": "agent_hello", "agent_id": agent_id}).to_string();
    write
        .send(Message::Text(hello))
        .await
        .map_err(|e| format!("agent_hello send failed: {e}"))?;

    let ack = tokio::time::timeout(Duration::from_secs(5), read.next())
        .await
        .map_err(|_| "timed out waiting for relay_ok".to_string())?
        .ok_or_else(|| "relay closed before relay_ok".to_string())?
        .map_err(|e| format!("relay read error: {e}"))?;

    let ack_text = match ack {
        Message::Text(t) => t,
        other => return Err(format!("expected relay_ok, got {other:?}")),
    };
    let ack_json: serde_json::Value = serde_json::from_str(&ack_text)
        .map_err(|e| format!("relay_ok not valid JSON: {e}"))?;
    if ack_json.get("type").and_then(|v| v.as_str()) != Some("relay_ok") {
        return Err(format!("relay rejected hello: {ack_text}"));
    }

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(256);
    let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(256);
    let (close_tx, close_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        let mut last_pong = tokio::time::Instant::now();
        let mut close_reason = CloseReason::NetworkError;

        loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    if last_pong.elapsed() > PONG_TIMEOUT {
                        log::warn!("relay_session[{agent_id}]: pong timeout");
                        close_reason = CloseReason::NetworkError;
                        break;
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        close_reason = CloseReason::NetworkError;
                        break;
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(OutboundFrame::Text(text)) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                close_reason = CloseReason::NetworkError;
                                break;
                            }
                        }
                        Some(OutboundFrame::Binary(data)) => {
                            if write.send(Message::Binary(data)).await.is_err() {
                                close_reason = CloseReason::NetworkError;
                                break;
                            }
                        }
                        None => {
                            close_reason = CloseReason::Shutdown;
                            break;
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(InboundFrame::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if in_tx.send(InboundFrame::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            close_reason = CloseReason::ServerRejected;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("relay_session[{agent_id}]: read error: {e}");
                            close_reason = CloseReason::NetworkError;
                            break;
                        }
                    }
                }
            }
        }

        let _ = close_tx.send(close_reason);
    });

    Ok((RelaySender { tx: out_tx }, in_rx, close_rx))
}

/// How long to wait before retrying after a closed relay session (§4.5).
pub fn reconnect_wait() -> Duration {
    RECONNECT_WAIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_wait_matches_spec() {
        assert_eq!(reconnect_wait(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = RelaySender { tx };
        assert!(!sender.send_text("hi").await);
    }
}
