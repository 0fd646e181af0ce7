//! STUN client (RFC 5389) — discover a UDP socket's NAT-mapped public
//! endpoint and classify the NAT as full-cone-like or symmetric (§4.1).

use crate::error::{CoreError, CoreResult};
use rand::RngCore;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Default public STUN servers, geographically distinct providers.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.stunprotocol.org:3478",
];

/// Result of classifying a socket's NAT behaviour (§3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// External port is stable across destinations; hole-punching direct.
    FullCone,
    /// External port varies per destination; requires port prediction.
    Symmetric,
    /// Fewer than two distinct STUN results were obtained.
    Unknown,
}

/// A classify_nat result: the NAT type plus up to two observed endpoints,
/// used by the NAT-punch layer for symmetric-NAT port prediction.
#[derive(Debug, Clone, Copy)]
pub struct NatClassification {
    pub nat_type: NatType,
    pub endpoint1: Option<SocketAddr>,
    pub endpoint2: Option<SocketAddr>,
}

fn build_binding_request() -> ([u8; 20], [u8; 12]) {
    let mut txn_id = [0u8; 12];
    rand::rngs::ThreadRng::default().fill_bytes(&mut txn_id);
    let mut packet = [0u8; 20];
    packet[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    packet[2..4].copy_from_slice(&0u16.to_be_bytes());
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..20].copy_from_slice(&txn_id);
    (packet, txn_id)
}

fn parse_binding_response(data: &[u8], expected_txn: &[u8; 12]) -> Option<SocketAddr> {
    if data.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if msg_type != BINDING_RESPONSE || magic != MAGIC_COOKIE {
        return None;
    }
    if &data[8..20] != expected_txn {
        return None;
    }

    let mut offset = 20usize;
    let mut mapped_fallback = None;
    while offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > data.len() {
            break;
        }
        let attr = &data[offset..offset + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            if let Some(addr) = parse_xor_mapped(attr) {
                return Some(addr);
            }
        } else if attr_type == ATTR_MAPPED_ADDRESS && mapped_fallback.is_none() {
            mapped_fallback = parse_mapped(attr);
        }

        offset += attr_len;
        if attr_len % 4 != 0 {
            offset += 4 - (attr_len % 4);
        }
    }
    mapped_fallback
}

fn parse_xor_mapped(attr: &[u8]) -> Option<SocketAddr> {
    if attr.len() < 8 || attr[1] != 0x01 {
        return None;
    }
    let xor_port = u16::from_be_bytes([attr[2], attr[3]]);
    let port = xor_port ^ ((MAGIC_COOKIE >> 16) as u16);
    let xor_ip = u32::from_be_bytes([attr[4], attr[5], attr[6], attr[7]]);
    let ip = Ipv4Addr::from(xor_ip ^ MAGIC_COOKIE);
    Some(SocketAddr::new(ip.into(), port))
}

fn parse_mapped(attr: &[u8]) -> Option<SocketAddr> {
    if attr.len() < 8 || attr[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([attr[2], attr[3]]);
    let ip = Ipv4Addr::new(attr[4], attr[5], attr[6], attr[7]);
    Some(SocketAddr::new(ip.into(), port))
}

/// Discover the public endpoint of `sock` by querying `servers` in order,
/// stopping at the first successful response (§4.1 "Discover public
/// endpoint"). Each server gets up to `per_server_timeout`.
pub async fn discover(
    sock: &UdpSocket,
    servers: &[&str],
    per_server_timeout: Duration,
) -> CoreResult<SocketAddr> {
    let (packet, txn_id) = build_binding_request();

    for server in servers {
        let server_addr = match tokio::net::lookup_host(server).await {
            Ok(mut addrs) => match addrs.next() {
                Some(a) => a,
                None => continue,
            },
            Err(_) => continue,
        };

        if sock.send_to(&packet, server_addr).await.is_err() {
            continue;
        }

        let mut buf = [0u8; 1024];
        let recv = timeout(per_server_timeout, sock.recv_from(&mut buf)).await;
        let Ok(Ok((len, _from))) = recv else {
            log::debug!("stun: {server} timed out");
            continue;
        };

        if let Some(addr) = parse_binding_response(&buf[..len], &txn_id) {
            log::info!("stun: public endpoint {addr} (via {server})");
            return Ok(addr);
        }
    }

    Err(CoreError::Network("all STUN servers failed".into()))
}

/// Classify NAT type by querying several STUN servers **in parallel on the
/// same socket**, correlating responses by transaction id (§4.1 "Classify
/// NAT type"). Requires at least two distinct results to tell full-cone
/// from symmetric; fewer ⇒ `Unknown`.
pub async fn classify_nat(sock: &UdpSocket, overall_timeout: Duration) -> CoreResult<NatClassification> {
    let mut txn_map: HashMap<[u8; 12], &str> = HashMap::new();

    for server in DEFAULT_STUN_SERVERS {
        let Ok(mut addrs) = tokio::net::lookup_host(server).await else {
            continue;
        };
        let Some(server_addr) = addrs.next() else {
            continue;
        };
        let (packet, txn_id) = build_binding_request();
        if sock.send_to(&packet, server_addr).await.is_ok() {
            txn_map.insert(txn_id, server);
        }
    }

    if txn_map.is_empty() {
        return Ok(NatClassification {
            nat_type: NatType::Unknown,
            endpoint1: None,
            endpoint2: None,
        });
    }

    let mut results: Vec<SocketAddr> = Vec::new();
    let mut seen_servers: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let deadline = tokio::time::Instant::now() + overall_timeout;

    while results.len() < 2 {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let mut buf = [0u8; 1024];
        let recv = timeout(remaining, sock.recv_from(&mut buf)).await;
        let Ok(Ok((len, _from))) = recv else {
            break;
        };
        if len < 20 {
            continue;
        }
        let mut txn_id = [0u8; 12];
        txn_id.copy_from_slice(&buf[8..20]);
        let Some(&server) = txn_map.get(&txn_id) else {
            continue;
        };
        if !seen_servers.insert(server) {
            continue;
        }
        if let Some(addr) = parse_binding_response(&buf[..len], &txn_id) {
            results.push(addr);
        }
    }

    let classification = match results.len() {
        0 => NatClassification {
            nat_type: NatType::Unknown,
            endpoint1: None,
            endpoint2: None,
        },
        1 => NatClassification {
            nat_type: NatType::Unknown,
            endpoint1: Some(results[0]),
            endpoint2: None,
        },
        _ => {
            let nat_type = if results[0] == results[1] {
                NatType::FullCone
            } else {
                NatType::Symmetric
            };
            NatClassification {
                nat_type,
                endpoint1: Some(results[0]),
                endpoint2: Some(results[1]),
            }
        }
    };

    log::info!(
        "stun: nat_type={:?} ep1={:?} ep2={:?}",
        classification.nat_type,
        classification.endpoint1,
        classification.endpoint2
    );
    Ok(classification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_header_is_well_formed() {
        let (packet, txn_id) = build_binding_request();
        assert_eq!(&packet[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&packet[2..4], &0u16.to_be_bytes());
        assert_eq!(&packet[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&packet[8..20], &txn_id);
    }

    /// P4: for any transaction id and any (ipv4, port) encoded as
    /// XOR-MAPPED-ADDRESS, the parser returns that exact (ipv4, port).
    #[test]
    fn xor_mapped_address_round_trips() {
        let txn_id = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let ip = Ipv4Addr::new(203, 0, 113, 42);
        let port = 54321u16;

        let mut packet = Vec::new();
        packet.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes()); // attrs length placeholder, unused by parser
        packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet.extend_from_slice(&txn_id);

        let xor_port = port ^ ((MAGIC_COOKIE >> 16) as u16);
        let xor_ip = u32::from(ip) ^ MAGIC_COOKIE;
        packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes());
        packet.push(0x00);
        packet.push(0x01);
        packet.extend_from_slice(&xor_port.to_be_bytes());
        packet.extend_from_slice(&xor_ip.to_be_bytes());

        let parsed = parse_binding_response(&packet, &txn_id).unwrap();
        assert_eq!(parsed.ip(), std::net::IpAddr::V4(ip));
        assert_eq!(parsed.port(), port);
    }

    #[test]
    fn mapped_address_fallback_used_when_no_xor_attr() {
        let txn_id = [0u8; 12];
        let ip = Ipv4Addr::new(198, 51, 100, 7);
        let port = 4000u16;

        let mut packet = Vec::new();
        packet.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes());
        packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet.extend_from_slice(&txn_id);
        packet.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes());
        packet.push(0x00);
        packet.push(0x01);
        packet.extend_from_slice(&port.to_be_bytes());
        packet.extend_from_slice(&ip.octets());

        let parsed = parse_binding_response(&packet, &txn_id).unwrap();
        assert_eq!(parsed.ip(), std::net::IpAddr::V4(ip));
        assert_eq!(parsed.port(), port);
    }

    #[test]
    fn response_rejected_on_transaction_id_mismatch() {
        let txn_id = [7u8; 12];
        let mut packet = vec![0u8; 20];
        packet[0..2].copy_from_slice(&BINDING_RESPONSE.to_be_bytes());
        packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet[8..20].copy_from_slice(&[9u8; 12]);
        assert!(parse_binding_response(&packet, &txn_id).is_none());
    }
}
