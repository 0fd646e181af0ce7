//! Bridges the synchronous [`ConnectionManager::escalate`] onto the async
//! runtime, then opens the real transport for whichever mode won (§4.4).

use crate::relay_client;
use crate::session::Inbound;
use crate::tier_probe::RealTierProbe;
use crate::transport::{RelayTransport, Transport, UdpTransport, WsTransport};
use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use wellcom_core::connection_manager::{AgentTargets, ConnectionManager};
use wellcom_core::identity::ConnectionMode;
use wellcom_core::nat_punch::{self, Role};
use wellcom_core::protocol::PunchToken;
use wellcom_core::rendezvous::{nat_type_from_str, nat_type_to_str, Rendezvous};
use wellcom_core::stun;
use wellcom_core::udp_channel::{ChannelEvent, UdpChannel};

const RENDEZVOUS_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const STUN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Established {
    pub mode: ConnectionMode,
    pub transport: Box<dyn Transport>,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Run the escalation ladder on a blocking thread (the trait is sync),
/// then dial the winning tier for real.
pub async fn connect(
    targets: AgentTargets,
    relay_url: String,
    manager_id: String,
    token: String,
) -> Result<Established> {
    let handle = tokio::runtime::Handle::current();
    let udp_peer_ip = targets.wan_endpoint.map(|ep| ep.ip).or(targets.lan_endpoint.map(|ep| ep.ip));
    let probe = RealTierProbe { handle, udp_peer_ip };

    let (manager, _state_rx) = ConnectionManager::new(targets.clone());
    let mode = tokio::task::spawn_blocking(move || manager.escalate(&probe))
        .await
        .context("escalation task panicked")?;

    let Some(mode) = mode else {
        bail!("no connection tier reached agent {}", targets.agent_id);
    };

    match mode {
        ConnectionMode::Lan | ConnectionMode::Wan => {
            let endpoint = if mode == ConnectionMode::Lan {
                targets.lan_endpoint
            } else {
                targets.wan_endpoint
            }
            .context("escalation picked a direct tier with no endpoint")?;
            let addr: SocketAddr = endpoint.into();
            let url = format!("ws://{addr}");
            let (ws_stream, _) = tokio_tungstenite::connect_async(url)
                .await
                .context("direct WS connect failed")?;
            let (sink, mut stream) = ws_stream.split();
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                while let Some(Ok(msg)) = stream.next().await {
                    let inbound = match msg {
                        tokio_tungstenite::tungstenite::Message::Text(t) => Inbound::Text(t),
                        tokio_tungstenite::tungstenite::Message::Binary(b) => Inbound::Binary(b),
                        _ => continue,
                    };
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Established {
                mode,
                transport: Box::new(WsTransport { sink }),
                inbound: rx,
            })
        }
        ConnectionMode::Relay => {
            let (sender, mut relay_rx) =
                relay_client::connect(&relay_url, &manager_id, &targets.agent_id.0, &token)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                while let Some(frame) = relay_rx.recv().await {
                    let inbound = match frame {
                        relay_client::InboundFrame::Text(t) => Inbound::Text(t),
                        relay_client::InboundFrame::Binary(b) => Inbound::Binary(b),
                    };
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Established {
                mode,
                transport: Box::new(RelayTransport { sender }),
                inbound: rx,
            })
        }
        ConnectionMode::UdpP2p => {
            let sock = UdpSocket::bind("0.0.0.0:0").await.context("binding udp-p2p punch socket")?;
            let classification = stun::classify_nat(&sock, STUN_TIMEOUT)
                .await
                .context("classifying own NAT for udp-p2p rendezvous")?;
            let own_endpoint = classification
                .endpoint1
                .context("stun produced no observed address for udp-p2p rendezvous")?;
            let token = PunchToken::random();

            let (sender, mut relay_rx) =
                relay_client::connect(&relay_url, &manager_id, &targets.agent_id.0, &token.to_hex())
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;

            let request = Rendezvous::UdpRendezvousRequest {
                manager_id: manager_id.clone(),
                token: token.to_hex(),
                ip: own_endpoint.ip(),
                port: own_endpoint.port(),
                port2: classification.endpoint2.map(|e| e.port()),
                nat_type: nat_type_to_str(classification.nat_type).to_string(),
            };
            let request_json = serde_json::to_string(&request).context("serializing udp rendezvous request")?;
            if !sender.send_text(request_json).await {
                bail!("udp-p2p rendezvous: failed to send request over relay signaling channel");
            }

            let reply = tokio::time::timeout(RENDEZVOUS_REPLY_TIMEOUT, async {
                while let Some(frame) = relay_rx.recv().await {
                    let relay_client::InboundFrame::Text(text) = frame else {
                        continue;
                    };
                    if let Ok(Rendezvous::UdpRendezvousReply {
                        manager_id: reply_manager_id,
                        ip,
                        port,
                        port2,
                        nat_type,
                    }) = serde_json::from_str::<Rendezvous>(&text)
                    {
                        if reply_manager_id == manager_id {
                            return Some((ip, port, port2, nat_type));
                        }
                    }
                }
                None
            })
            .await
            .context("timed out waiting for udp rendezvous reply")?
            .context("relay signaling channel closed before a udp rendezvous reply arrived")?;

            let (agent_ip, agent_port, agent_port2, agent_nat_type) = reply;
            drop(sender);
            drop(relay_rx);

            let (sock, peer_addr) = nat_punch::punch(
                sock,
                agent_ip,
                agent_port,
                token,
                Role::Manager,
                Some(nat_type_from_str(&agent_nat_type)),
                agent_port2,
            )
            .await
            .context("udp hole punch failed")?;

            let (channel, events) = UdpChannel::spawn(sock, peer_addr);
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(pump_udp_events(events, tx));

            Ok(Established {
                mode,
                transport: Box::new(UdpTransport { channel }),
                inbound: rx,
            })
        }
    }
}

/// Translate udp channel events into [`Inbound`], reconstructing the
/// original wire frame for video by prepending the frame type byte back
/// onto the `seq(4) + payload` [`UdpTransport`] strips it down to on send.
async fn pump_udp_events(mut events: mpsc::Receiver<ChannelEvent>, tx: mpsc::Sender<Inbound>) {
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
