//! UDP NAT hole-punching (§4.3): symmetric-NAT port prediction and the
//! punch/punch-ack handshake that hands a connected socket to [`crate::udp_channel`].

use crate::error::{CoreError, CoreResult};
use crate::protocol::PunchToken;
use crate::stun::NatType;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const PUNCH_MAGIC: &[u8; 4] = b"WCPH";
const PUNCH_ACK: &[u8; 4] = b"WCPA";
const PUNCH_DURATION: Duration = Duration::from_secs(6);
const PUNCH_DURATION_SYMMETRIC: Duration = Duration::from_secs(8);
const PUNCH_INTERVAL: Duration = Duration::from_millis(30);
const CONSOLIDATE_ACKS: u32 = 10;
const CONSOLIDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Which end of the punch this process plays; only affects logging and
/// which side first observes the peer's real address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Manager,
    Agent,
}

/// Generate the candidate external ports a symmetric NAT's allocator is
/// likely to hand out next, given two observed external ports from two
/// independent STUN probes (§4.3, grounded on `_predict_ports`).
///
/// If the peer reported the same port twice (`port1 == port2`) this
/// degenerates to a one-element window containing just that port, per the
/// resolved Open Question: a peer that looks full-cone-ish in this
/// corner case is not reclassified, it simply gets a trivial prediction set.
pub fn predict_ports(port1: u16, port2: u16, count: usize) -> Vec<u16> {
    if port1 == port2 {
        return vec![port1];
    }

    let delta = i32::from(port2) - i32::from(port1);
    let mut candidates = Vec::with_capacity(count);

    if delta != 0 && delta.abs() <= 20 {
        for i in 1..=count {
            let candidate = i32::from(port2) + delta * i as i32;
            if (1..=65535).contains(&candidate) {
                candidates.push(candidate as u16);
            }
        }
        for offset in -5i32..=5 {
            let candidate = i32::from(port1) + offset;
            if (1..=65535).contains(&candidate) && !candidates.contains(&(candidate as u16)) {
                candidates.push(candidate as u16);
            }
        }
    } else {
        let base = i32::from(port1);
        let mut offset = -128i32;
        while offset <= 128 && candidates.len() < count {
            let candidate = base + offset;
            if (1..=65535).contains(&candidate) && candidate as u16 != port1 {
                candidates.push(candidate as u16);
            }
            offset += 4;
        }
    }

    candidates.truncate(count.max(1));
    candidates
}

fn build_target_ports(primary: u16, peer_nat_type: Option<NatType>, peer_port2: Option<u16>) -> Vec<u16> {
    let mut ports = vec![primary];
    if peer_nat_type == Some(NatType::Symmetric) {
        if let Some(port2) = peer_port2 {
            for p in predict_ports(primary, port2, 32) {
                if !ports.contains(&p) {
                    ports.push(p);
                }
            }
        }
    }
    ports
}

impl Role {
    fn to_byte(self) -> u8 {
        match self {
            Self::Manager => 0,
            Self::Agent => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Manager),
            1 => Some(Self::Agent),
            _ => None,
        }
    }
}

fn build_punch_packet(token: PunchToken, role: Role) -> Vec<u8> {
    let mut packet = Vec::with_capacity(21);
    packet.extend_from_slice(PUNCH_MAGIC);
    packet.extend_from_slice(&token.0);
    packet.push(role.to_byte());
    packet
}

fn build_ack_packet(token: PunchToken, role: Role) -> Vec<u8> {
    let mut packet = Vec::with_capacity(21);
    packet.extend_from_slice(PUNCH_ACK);
    packet.extend_from_slice(&token.0);
    packet.push(role.to_byte());
    packet
}

fn parse_punch_packet(data: &[u8]) -> Option<(bool, PunchToken, Role)> {
    if data.len() < 21 {
        return None;
    }
    let mut token = [0u8; 16];
    token.copy_from_slice(&data[4..20]);
    let role = Role::from_byte(data[20])?;
    if &data[0..4] == PUNCH_MAGIC {
        Some((false, PunchToken(token), role))
    } else if &data[0..4] == PUNCH_ACK {
        Some((true, PunchToken(token), role))
    } else {
        None
    }
}

/// Perform the punch/punch-ack exchange against a single peer endpoint,
/// optionally widened with predicted ports if the peer is behind a
/// symmetric NAT. Returns the socket and the peer address that actually
/// answered, ready to hand to [`crate::udp_channel::UdpChannel::spawn`].
///
/// Grounded on `_do_punch` in the source: round-robins sends across the
/// target port list on `PUNCH_INTERVAL`, always also hitting `primary`,
/// until a matching token arrives; then sends `PUNCH_ACK` a fixed number
/// of times to consolidate the NAT mapping on both sides.
pub async fn punch(
    sock: UdpSocket,
    peer_ip: IpAddr,
    primary_port: u16,
    token: PunchToken,
    role: Role,
    peer_nat_type: Option<NatType>,
    peer_port2: Option<u16>,
) -> CoreResult<(UdpSocket, SocketAddr)> {
    let target_ports = build_target_ports(primary_port, peer_nat_type, peer_port2);
    let duration = if peer_nat_type == Some(NatType::Symmetric) {
        PUNCH_DURATION_SYMMETRIC
    } else {
        PUNCH_DURATION
    };
    let punch_packet = build_punch_packet(token, role);

    log::info!(
        "nat_punch: starting as {role:?}, {} candidate ports, duration={duration:?}",
        target_ports.len()
    );

    let deadline = Instant::now() + duration;
    let mut buf = [0u8; 64];
    let mut port_idx = 0usize;
    let mut peer_addr = None;

    while Instant::now() < deadline && peer_addr.is_none() {
        let port = target_ports[port_idx % target_ports.len()];
        port_idx += 1;
        let dest = SocketAddr::new(peer_ip, port);
        let _ = sock.send_to(&punch_packet, dest).await;

        if port != primary_port {
            let _ = sock.send_to(&punch_packet, SocketAddr::new(peer_ip, primary_port)).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = PUNCH_INTERVAL.min(remaining.max(Duration::from_millis(1)));
        if let Ok(Ok((len, from))) = timeout(wait, sock.recv_from(&mut buf)).await {
            if let Some((is_ack, recv_token, _peer_role)) = parse_punch_packet(&buf[..len]) {
                if recv_token == token {
                    peer_addr = Some(from);
                    if !is_ack {
                        let _ = sock.send_to(&build_ack_packet(token, role), from).await;
                    }
                }
            }
        }
    }

    let Some(peer_addr) = peer_addr else {
        return Err(CoreError::Network(format!(
            "nat punch timed out as {role:?} against {peer_ip} ({} candidates)",
            target_ports.len()
        )));
    };

    for _ in 0..CONSOLIDATE_ACKS {
        let _ = sock.send_to(&build_ack_packet(token, role), peer_addr).await;
        tokio::time::sleep(CONSOLIDATE_INTERVAL).await;
    }

    log::info!("nat_punch: succeeded, peer answered from {peer_addr}");
    Ok((sock, peer_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_ports_degenerate_to_single_candidate() {
        let candidates = predict_ports(5000, 5000, 32);
        assert_eq!(candidates, vec![5000]);
    }

    #[test]
    fn small_delta_extrapolates_sequentially() {
        let candidates = predict_ports(5000, 5004, 32);
        assert!(candidates.contains(&5008));
        assert!(candidates.contains(&5012));
        assert!(candidates.contains(&4999) || candidates.contains(&5001));
    }

    #[test]
    fn large_delta_uses_window_around_primary() {
        let candidates = predict_ports(5000, 40000, 32);
        assert!(candidates.iter().all(|&p| (4872..=5128).contains(&p)));
        assert!(!candidates.contains(&5000));
    }

    #[tokio::test]
    async fn punch_completes_between_two_loopback_sockets() {
        let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port_a = sock_a.local_addr().unwrap().port();
        let port_b = sock_b.local_addr().unwrap().port();
        let token = PunchToken::random();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();

        let side_a = punch(sock_a, loopback, port_b, token, Role::Manager, None, None);
        let side_b = punch(sock_b, loopback, port_a, token, Role::Agent, None, None);

        let (res_a, res_b) = tokio::join!(side_a, side_b);
        let (_, addr_a) = res_a.unwrap();
        let (_, addr_b) = res_b.unwrap();
        assert_eq!(addr_a.port(), port_b);
        assert_eq!(addr_b.port(), port_a);
    }
}
