//! Relay WebSocket session (§4.5, manager side): a short-lived connection
//! that opens, sends `manager_hello` naming the target agent, then runs the
//! same text/binary frame loop as [`wellcom_core::relay_session`]'s agent
//! side. Kept in this crate since the hello payload and routing direction
//! differ from the agent's persistent, agent-id-keyed connection.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

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

/// Connect to the relay and open a channel targeting `agent_id` (§4.5).
pub async fn connect(
    relay_url: &str,
    manager_id: &str,
    agent_id: &str,
    token: &str,
) -> Result<(RelaySender, mpsc::Receiver<InboundFrame>), String> {
    let url = format!(
        "{relay_url}?token={token}",
        relay_url = relay_url.trim_end_matches('/')
    );
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| format!("relay connect failed: {e}"))?;
    let (mut write, mut read) = ws_stream.split();

    let hello = serde_json::json!({
        "type": "manager_hello",
        "manager_id": manager_id,
        "agent_id": agent_id,
    })
    .to_string();
    write
        .send(Message::Text(hello))
        .await
        .map_err(|e| format!("manager_hello send failed: {e}"))?;

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
    let agent_id = agent_id.to_string();

    tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        let mut last_pong = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    if last_pong.elapsed() > PONG_TIMEOUT {
                        log::warn!("relay_client[{agent_id}]: pong timeout");
                        break;
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(OutboundFrame::Text(text)) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundFrame::Binary(data)) => {
                            if write.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
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
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("relay_client[{agent_id}]: read error: {e}");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok((RelaySender { tx: out_tx }, in_rx))
}
