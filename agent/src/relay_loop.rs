//! Relay fallback (§4.5): one persistent relay connection per agent,
//! demultiplexed into one [`session_runner::run`] task per manager.
//!
//! The relay carries every manager's frames over a single WebSocket, so
//! each frame is tagged with the originating `manager_id`: text frames get
//! it merged into the JSON object, binary frames get a one-byte-length-
//! prefixed tag ahead of the wire payload. This is simpler than giving the
//! relay its own framing layer, at the cost of assuming `manager_id`
//! strings stay under 255 bytes.

use crate::session_runner::{self, AgentContext, Inbound};
use crate::transport::RelayTransport;
use crate::udp_rendezvous;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use wellcom_core::relay_session::{self, InboundFrame, RelaySender};
use wellcom_core::rendezvous::Rendezvous;

pub async fn run(ctx: Arc<AgentContext>, relay_url: String, agent_id: String, token: String) {
    loop {
        match relay_session::connect(&relay_url, &agent_id, &token).await {
            Ok((sender, mut in_rx, _close_rx)) => {
                log::info!("relay_loop: connected to {relay_url}");
                let mut sessions: HashMap<String, mpsc::Sender<Inbound>> = HashMap::new();

                while let Some(frame) = in_rx.recv().await {
                    match frame {
                        InboundFrame::Text(text) => {
                            dispatch_text(&ctx, &sender, &mut sessions, text);
                        }
                        InboundFrame::Binary(data) => {
                            dispatch_binary(&mut sessions, data);
                        }
                    }
                }
                log::info!("relay_loop: connection closed, {} sessions dropped", sessions.len());
            }
            Err(e) => {
                log::warn!("relay_loop: connect failed: {e}");
            }
        }
        tokio::time::sleep(relay_session::reconnect_wait()).await;
    }
}

fn dispatch_text(
    ctx: &Arc<AgentContext>,
    sender: &RelaySender,
    sessions: &mut HashMap<String, mpsc::Sender<Inbound>>,
    text: String,
) {
    if let Ok(Rendezvous::UdpRendezvousRequest {
        manager_id,
        token,
        ip,
        port,
        port2,
        nat_type,
    }) = serde_json::from_str::<Rendezvous>(&text)
    {
        let ctx = ctx.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            udp_rendezvous::handle_request(ctx, sender, manager_id, token, ip, port, port2, &nat_type).await;
        });
        return;
    }

    let Some(manager_id) = extract_manager_id(&text) else {
        log::debug!("relay_loop: text frame missing manager_id, dropping");
        return;
    };

    if !sessions.contains_key(&manager_id) {
        let (tx, rx) = mpsc::channel(64);
        let transport = RelayTransport {
            sender: sender.clone(),
            manager_id: manager_id.clone(),
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            session_runner::run(ctx, rx, transport).await;
        });
        sessions.insert(manager_id.clone(), tx);
    }

    let drop_session = match sessions.get(&manager_id) {
        Some(tx) => tx.try_send(Inbound::Text(text)).is_err(),
        None => false,
    };
    if drop_session {
        log::debug!("relay_loop: session channel closed for {manager_id}");
        sessions.remove(&manager_id);
    }
}

fn dispatch_binary(sessions: &mut HashMap<String, mpsc::Sender<Inbound>>, data: Vec<u8>) {
    let Some(&id_len) = data.first() else { return };
    let id_len = id_len as usize;
    if data.len() < 1 + id_len {
        return;
    }
    let Ok(manager_id) = std::str::from_utf8(&data[1..1 + id_len]) else {
        return;
    };
    let payload = data[1 + id_len..].to_vec();

    let drop_session = match sessions.get(manager_id) {
        Some(tx) => tx.try_send(Inbound::Binary(payload)).is_err(),
        None => false,
    };
    if drop_session {
        sessions.remove(manager_id);
    }
}

fn extract_manager_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("manager_id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_manager_id_reads_the_tagged_field() {
        let text = r#"{"type":"auth","manager_id":"m1","token":"abc"}"#;
        assert_eq!(extract_manager_id(text), Some("m1".to_string()));
    }

    #[test]
    fn extract_manager_id_is_none_when_missing_or_not_json() {
        assert_eq!(extract_manager_id(r#"{"type":"auth"}"#), None);
        assert_eq!(extract_manager_id("not json"), None);
    }

    #[test]
    fn dispatch_binary_drops_frames_for_unknown_sessions() {
        let mut sessions: HashMap<String, mpsc::Sender<Inbound>> = HashMap::new();
        let manager_id = b"m1";
        let mut wire = vec![manager_id.len() as u8];
        wire.extend_from_slice(manager_id);
        wire.extend_from_slice(b"payload");

        // No session registered for "m1" yet: dispatch is a no-op, not a panic.
        dispatch_binary(&mut sessions, wire);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn dispatch_binary_routes_to_the_tagged_session_and_strips_the_tag() {
        let mut sessions: HashMap<String, mpsc::Sender<Inbound>> = HashMap::new();
        let (tx, mut rx) = mpsc::channel(4);
        sessions.insert("m1".to_string(), tx);

        let mut wire = vec![2u8];
        wire.extend_from_slice(b"m1");
        wire.extend_from_slice(b"binary-payload");
        dispatch_binary(&mut sessions, wire);

        match rx.try_recv().unwrap() {
            Inbound::Binary(data) => assert_eq!(data, b"binary-payload"),
            Inbound::Text(_) => panic!("expected a binary frame"),
        }
    }

    #[test]
    fn dispatch_binary_ignores_truncated_tag_length() {
        let mut sessions: HashMap<String, mpsc::Sender<Inbound>> = HashMap::new();
        sessions.insert("m1".to_string(), mpsc::channel(1).0);
        // Claims a 10-byte id tag but the frame is shorter than that.
        let wire = vec![10u8, b'm', b'1'];
        dispatch_binary(&mut sessions, wire);
        assert!(sessions.contains_key("m1"));
    }
}
