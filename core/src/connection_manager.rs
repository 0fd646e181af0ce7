//! Per-agent connection establishment state machine (§4.4, manager side).
//!
//! Grounded on the teacher's `relay/connection.rs` reconnect-loop shape and
//! the `ConnectionState` enum from `channel/mod.rs`, generalized from one
//! fixed relay target to a tiered LAN/WAN/punch/relay escalation.

use crate::identity::{AgentId, ConnectionMode, Endpoint};
use std::time::Duration;
use tokio::sync::watch;

const TRY_LAN_TIMEOUT: Duration = Duration::from_secs(3);
const TRY_WAN_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_WAIT: Duration = Duration::from_secs(10);

/// Connection establishment state for one agent, as observed by the
/// manager (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    TryLan,
    TryWan,
    TryUdpPunch,
    Relay,
    Connected(ConnectionMode),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Candidate endpoints and capabilities needed to drive one agent's state
/// machine through a full escalation cycle.
#[derive(Debug, Clone)]
pub struct AgentTargets {
    pub agent_id: AgentId,
    pub lan_endpoint: Option<Endpoint>,
    pub wan_endpoint: Option<Endpoint>,
    /// False once a login to the directory has failed: disables
    /// TRY_UDP_PUNCH and RELAY, since neither has signaling available.
    pub signaling_available: bool,
}

/// Outcome of attempting one tier of the escalation ladder.
pub trait TierProbe: Send + Sync {
    /// Attempt a LAN-direct connection; `Ok(true)` on success.
    fn try_lan(&self, endpoint: Endpoint, timeout: Duration) -> bool;
    fn try_wan(&self, endpoint: Endpoint, timeout: Duration) -> bool;
    fn try_udp_punch(&self, agent_id: &AgentId) -> bool;
    fn try_relay(&self, agent_id: &AgentId) -> bool;
}

/// Drives one agent's connection state machine and publishes state changes
/// via a [`watch`] channel so other layers can react to
/// `connection_mode_changed` (§4.4).
pub struct ConnectionManager {
    targets: AgentTargets,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(targets: AgentTargets) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (Self { targets, state_tx }, state_rx)
    }

    fn set_state(&self, state: ConnectionState) {
        log::info!(
            "connection_manager[{}]: -> {:?}",
            self.targets.agent_id,
            state
        );
        let _ = self.state_tx.send(state);
    }

    /// Run one escalation attempt: TRY_LAN → TRY_WAN → TRY_UDP_PUNCH →
    /// RELAY, stopping at the first tier that succeeds. Returns the mode
    /// reached, or `None` if every available tier failed.
    pub fn escalate(&self, probe: &dyn TierProbe) -> Option<ConnectionMode> {
        if let Some(ep) = self.targets.lan_endpoint {
            self.set_state(ConnectionState::TryLan);
            if probe.try_lan(ep, TRY_LAN_TIMEOUT) {
                self.set_state(ConnectionState::Connected(ConnectionMode::Lan));
                return Some(ConnectionMode::Lan);
            }
        }

        if let Some(ep) = self.targets.wan_endpoint {
            self.set_state(ConnectionState::TryWan);
            if probe.try_wan(ep, TRY_WAN_TIMEOUT) {
                self.set_state(ConnectionState::Connected(ConnectionMode::Wan));
                return Some(ConnectionMode::Wan);
            }
        }

        if !self.targets.signaling_available {
            log::warn!(
                "connection_manager[{}]: no signaling available, skipping punch/relay",
                self.targets.agent_id
            );
            self.set_state(ConnectionState::Disconnected);
            return None;
        }

        self.set_state(ConnectionState::TryUdpPunch);
        if probe.try_udp_punch(&self.targets.agent_id) {
            self.set_state(ConnectionState::Connected(ConnectionMode::UdpP2p));
            return Some(ConnectionMode::UdpP2p);
        }

        self.set_state(ConnectionState::Relay);
        if probe.try_relay(&self.targets.agent_id) {
            self.set_state(ConnectionState::Connected(ConnectionMode::Relay));
            return Some(ConnectionMode::Relay);
        }

        self.set_state(ConnectionState::Disconnected);
        None
    }

    /// How long to wait before re-entering TRY_LAN after a
    /// CONNECTED → DISCONNECTED edge (§4.4 reconnect policy).
    pub fn reconnect_wait() -> Duration {
        RECONNECT_WAIT
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};

    struct ScriptedProbe {
        lan_ok: bool,
        wan_ok: bool,
        punch_ok: bool,
        relay_ok: bool,
        calls: RefCell<Vec<&'static str>>,
    }

    impl TierProbe for ScriptedProbe {
        fn try_lan(&self, _endpoint: Endpoint, _timeout: Duration) -> bool {
            self.calls.borrow_mut().push("lan");
            self.lan_ok
        }
        fn try_wan(&self, _endpoint: Endpoint, _timeout: Duration) -> bool {
            self.calls.borrow_mut().push("wan");
            self.wan_ok
        }
        fn try_udp_punch(&self, _agent_id: &AgentId) -> bool {
            self.calls.borrow_mut().push("punch");
            self.punch_ok
        }
        fn try_relay(&self, _agent_id: &AgentId) -> bool {
            self.calls.borrow_mut().push("relay");
            self.relay_ok
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), 21350)
    }

    #[test]
    fn lan_success_short_circuits_later_tiers() {
        let targets = AgentTargets {
            agent_id: AgentId::from("agent-1"),
            lan_endpoint: Some(endpoint()),
            wan_endpoint: Some(endpoint()),
            signaling_available: true,
        };
        let (mgr, _rx) = ConnectionManager::new(targets);
        let probe = ScriptedProbe {
            lan_ok: true,
            wan_ok: true,
            punch_ok: true,
            relay_ok: true,
            calls: RefCell::new(Vec::new()),
        };
        let mode = mgr.escalate(&probe);
        assert_eq!(mode, Some(ConnectionMode::Lan));
        assert_eq!(*probe.calls.borrow(), vec!["lan"]);
    }

    #[test]
    fn falls_through_to_relay_when_earlier_tiers_fail() {
        let targets = AgentTargets {
            agent_id: AgentId::from("agent-2"),
            lan_endpoint: Some(endpoint()),
            wan_endpoint: Some(endpoint()),
            signaling_available: true,
        };
        let (mgr, _rx) = ConnectionManager::new(targets);
        let probe = ScriptedProbe {
            lan_ok: false,
            wan_ok: false,
            punch_ok: false,
            relay_ok: true,
            calls: RefCell::new(Vec::new()),
        };
        let mode = mgr.escalate(&probe);
        assert_eq!(mode, Some(ConnectionMode::Relay));
        assert_eq!(*probe.calls.borrow(), vec!["lan", "wan", "punch", "relay"]);
    }

    #[test]
    fn no_signaling_skips_punch_and_relay() {
        let targets = AgentTargets {
            agent_id: AgentId::from("agent-3"),
            lan_endpoint: None,
            wan_endpoint: None,
            signaling_available: false,
        };
        let (mgr, _rx) = ConnectionManager::new(targets);
        let probe = ScriptedProbe {
            lan_ok: false,
            wan_ok: false,
            punch_ok: true,
            relay_ok: true,
            calls: RefCell::new(Vec::new()),
        };
        let mode = mgr.escalate(&probe);
        assert_eq!(mode, None);
        assert!(probe.calls.borrow().is_empty());
        assert_eq!(mgr.current_state(), ConnectionState::Disconnected);
    }
}
