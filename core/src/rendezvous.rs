//! UDP-p2p signaling payloads (§3, §4.3): exchanged over the relay channel
//! to carry each side's STUN-observed address and NAT classification before
//! [`crate::nat_punch::punch`] runs, and the [`crate::protocol::PunchToken`]
//! both sides punch with.

use crate::protocol::PunchToken;
use crate::stun::NatType;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Signaling messages carried over the existing relay connection to set up
/// a udp-p2p session, grounded the way the direct-channel handshake in
/// `cli/src/channel/webrtc.rs` signals out-of-band before switching to a
/// peer-to-peer transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rendezvous {
    /// Manager → agent (relayed): "let's try udp-p2p for this session".
    UdpRendezvousRequest {
        manager_id: String,
        token: String,
        ip: IpAddr,
        port: u16,
        port2: Option<u16>,
        nat_type: String,
    },
    /// Agent → manager (relayed): the agent's own observed address/NAT.
    UdpRendezvousReply {
        manager_id: String,
        ip: IpAddr,
        port: u16,
        port2: Option<u16>,
        nat_type: String,
    },
}

pub fn nat_type_to_str(nat_type: NatType) -> &'static str {
    match nat_type {
        NatType::FullCone => "full_cone",
        NatType::Symmetric => "symmetric",
        NatType::Unknown => "unknown",
    }
}

pub fn nat_type_from_str(s: &str) -> NatType {
    match s {
        "full_cone" => NatType::FullCone,
        "symmetric" => NatType::Symmetric,
        _ => NatType::Unknown,
    }
}

pub fn parse_token(hex: &str) -> Option<PunchToken> {
    PunchToken::from_hex(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_type_round_trips_through_its_string_form() {
        for nat_type in [NatType::FullCone, NatType::Symmetric, NatType::Unknown] {
            assert_eq!(nat_type_from_str(nat_type_to_str(nat_type)), nat_type);
        }
    }

    #[test]
    fn unrecognized_nat_type_string_falls_back_to_unknown() {
        assert_eq!(nat_type_from_str("bogus"), NatType::Unknown);
    }

    #[test]
    fn rendezvous_request_round_trips_through_json() {
        let token = PunchToken::random();
        let msg = Rendezvous::UdpRendezvousRequest {
            manager_id: "m1".to_string(),
            token: token.to_hex(),
            ip: "203.0.113.5".parse().unwrap(),
            port: 40000,
            port2: Some(40010),
            nat_type: nat_type_to_str(NatType::Symmetric).to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Rendezvous = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
