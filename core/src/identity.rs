//! Peer identity and endpoint types shared by every layer above the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Stable identity of an agent: typically the OS hostname, plus the
/// capability descriptor the directory service stores alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable identity of a manager, as issued by the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagerId(pub String);

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ManagerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ManagerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The capability descriptor an agent reports at registration and handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// OS string, e.g. "windows-10", "macos-14", "linux".
    pub os: String,
    /// Primary screen width in pixels.
    pub screen_width: u32,
    /// Primary screen height in pixels.
    pub screen_height: u32,
    /// Agent's own version string.
    pub agent_version: String,
    /// Free-form hardware summary (CPU/GPU, used for diagnostics only).
    pub hardware_summary: String,
}

/// A (IPv4, UDP-port) pair. Each peer may expose up to three kinds
/// simultaneously: LAN private, WAN public (UPnP/STUN), and relay-mediated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        SocketAddr::new(ep.ip, ep.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// How a session's transport was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    Lan,
    Wan,
    UdpP2p,
    Relay,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lan => "lan",
            Self::Wan => "wan",
            Self::UdpP2p => "udp-p2p",
            Self::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

/// The 4-tuple identifying one live session, per the data model.
///
/// Invariant: at most one session exists per (agent_id, manager_id); a new
/// authenticated handshake supersedes and closes the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub agent_id: AgentId,
    pub manager_id: ManagerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_roundtrips_through_socket_addr() {
        let addr: SocketAddr = "203.0.113.5:41000".parse().unwrap();
        let ep = Endpoint::from(addr);
        assert_eq!(SocketAddr::from(ep), addr);
    }

    #[test]
    fn connection_mode_display_matches_wire_strings() {
        assert_eq!(ConnectionMode::Lan.to_string(), "lan");
        assert_eq!(ConnectionMode::UdpP2p.to_string(), "udp-p2p");
        assert_eq!(ConnectionMode::Relay.to_string(), "relay");
    }
}
