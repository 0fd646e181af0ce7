//! Real [`TierProbe`] implementation: each tier is a reachability check
//! only, bridging [`wellcom_core::connection_manager`]'s synchronous trait
//! onto async I/O via `Handle::block_on` (the trait is called from a
//! blocking task, see [`crate::connect::connect`]).
//!
//! `try_udp_punch` has reduced fidelity versus the full symmetric-NAT
//! prediction path: without a signaling channel that exchanges the peer's
//! second STUN-observed port, it punches using only the primary candidate
//! port, relying on `nat_punch::punch`'s own consolidation retries.

use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use wellcom_core::identity::{AgentId, Endpoint};
use wellcom_core::nat_punch::{self, Role};
use wellcom_core::protocol::PunchToken;
use wellcom_core::stun;

pub struct RealTierProbe {
    pub handle: tokio::runtime::Handle,
    pub udp_peer_ip: Option<IpAddr>,
}

impl wellcom_core::connection_manager::TierProbe for RealTierProbe {
    fn try_lan(&self, endpoint: Endpoint, timeout: Duration) -> bool {
        self.handle.block_on(tcp_reachable(endpoint, timeout))
    }

    fn try_wan(&self, endpoint: Endpoint, timeout: Duration) -> bool {
        self.handle.block_on(tcp_reachable(endpoint, timeout))
    }

    fn try_udp_punch(&self, _agent_id: &AgentId) -> bool {
        let Some(peer_ip) = self.udp_peer_ip else {
            return false;
        };
        self.handle
            .block_on(async {
                let sock = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("tier_probe: failed to bind punch socket: {e}");
                        return false;
                    }
                };
                let classification = match stun::classify_nat(&sock, Duration::from_secs(3)).await {
                    Ok(result) => result,
                    Err(e) => {
                        log::warn!("tier_probe: STUN classification failed: {e}");
                        return false;
                    }
                };
                let Some(peer_endpoint) = classification.endpoint1 else {
                    return false;
                };
                nat_punch::punch(
                    sock,
                    peer_ip,
                    peer_endpoint.port(),
                    PunchToken::random(),
                    Role::Manager,
                    Some(classification.nat_type),
                    None,
                )
                .await
                .is_ok()
            })
    }

    fn try_relay(&self, _agent_id: &AgentId) -> bool {
        true
    }
}

async fn tcp_reachable(endpoint: Endpoint, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, TcpStream::connect(std::net::SocketAddr::from(endpoint)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}
