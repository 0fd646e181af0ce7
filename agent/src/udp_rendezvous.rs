//! Agent side of udp-p2p session setup (§3, §4.3, §4.4): answers a
//! rendezvous request relayed from the manager, hole-punches, and hands the
//! resulting channel to the same session state machine every other
//! transport uses.

use crate::session_runner::{self, AgentContext, Inbound};
use crate::transport::UdpTransport;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use wellcom_core::nat_punch::{self, Role};
use wellcom_core::relay_session::RelaySender;
use wellcom_core::rendezvous::{nat_type_from_str, nat_type_to_str, Rendezvous};
use wellcom_core::stun;
use wellcom_core::udp_channel::{ChannelEvent, UdpChannel};

const STUN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
const BIND_ADDR: &str = "0.0.0.0:0";

/// Handle one `udp_rendezvous_request`: classify our own NAT, reply with our
/// observed address, punch, and drop into the ordinary session loop over the
/// punched socket.
#[allow(clippy::too_many_arguments)]
pub async fn handle_request(
    ctx: Arc<AgentContext>,
    relay_sender: RelaySender,
    manager_id: String,
    token_hex: String,
    manager_ip: IpAddr,
    manager_port: u16,
    manager_port2: Option<u16>,
    manager_nat_type: &str,
) {
    let Some(token) = wellcom_core::protocol::PunchToken::from_hex(&token_hex) else {
        log::warn!("udp_rendezvous[{manager_id}]: malformed punch token");
        return;
    };

    let sock = match UdpSocket::bind(BIND_ADDR).await {
        Ok(s) => s,
        Err(e) => {
            log::warn!("udp_rendezvous[{manager_id}]: failed to bind punch socket: {e}");
            return;
        }
    };

    let classification = match stun::classify_nat(&sock, STUN_TIMEOUT).await {
        Ok(c) => c,
        Err(e) => {
            log::warn!("udp_rendezvous[{manager_id}]: stun classification failed: {e}");
            return;
        }
    };
    let Some(own_endpoint) = classification.endpoint1 else {
        log::warn!("udp_rendezvous[{manager_id}]: no stun-observed address");
        return;
    };

    let reply = Rendezvous::UdpRendezvousReply {
        manager_id: manager_id.clone(),
        ip: own_endpoint.ip(),
        port: own_endpoint.port(),
        port2: classification.endpoint2.map(|e| e.port()),
        nat_type: nat_type_to_str(classification.nat_type).to_string(),
    };
    let Ok(reply_json) = serde_json::to_string(&reply) else {
        return;
    };
    if !relay_sender.send_text(reply_json).await {
        log::warn!("udp_rendezvous[{manager_id}]: failed to send reply over relay");
        return;
    }

    let peer_nat_type = nat_type_from_str(manager_nat_type);
    let punch_result = nat_punch::punch(
        sock,
        manager_ip,
        manager_port,
        token,
        Role::Agent,
        Some(peer_nat_type),
        manager_port2,
    )
    .await;
    let (sock, peer_addr) = match punch_result {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("udp_rendezvous[{manager_id}]: punch failed: {e}");
            return;
        }
    };

    let (channel, events) = UdpChannel::spawn(sock, peer_addr);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(pump_events(events, inbound_tx));

    log::info!("udp_rendezvous[{manager_id}]: punched, entering session loop via udp-p2p");
    session_runner::run(ctx, inbound_rx, UdpTransport { channel }).await;
}

/// Translate channel events into the generic [`Inbound`] shape
/// [`session_runner::run`] expects, reconstructing the original wire frame
/// format for video by prepending the frame type byte back onto the
/// `seq(4) + payload` that [`crate::transport::UdpTransport`] stripped it
/// down to on send.
async fn pump_events(mut events: tokio::sync::mpsc::Receiver<ChannelEvent>, tx: tokio::sync::mpsc::Sender<Inbound>) {
    while let Some(event) = events.recv().await {
        let inbound = match event {
            ChannelEvent::Control(payload) => match String::from_utf8(payload) {
                Ok(text) => Inbound::Text(text),
                Err(e) => Inbound::Binary(e.into_bytes()),
            },
            ChannelEvent::Video(ft, data) => {
                let mut wire = Vec::with_capacity(1 + data.len());
                wire.push(ft.to_byte());
                wire.extend_from_slice(&data);
                Inbound::Binary(wire)
            }
        };
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
}
