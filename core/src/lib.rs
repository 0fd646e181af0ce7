//! P2P connectivity and media transport core shared by the `agent` and
//! `manager` binaries: NAT traversal, the framed UDP channel, directory/relay
//! clients, session routing, and the encode/decode pipelines.

pub mod clipboard;
pub mod config;
pub mod connection_manager;
pub mod decoder;
pub mod directory_client;
pub mod encoder;
pub mod env;
pub mod error;
pub mod file_transfer;
pub mod identity;
pub mod input;
pub mod keyring;
pub mod nat_punch;
pub mod protocol;
pub mod relay_session;
pub mod rendezvous;
pub mod session;
pub mod stun;
pub mod udp_channel;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use identity::{AgentId, CapabilityDescriptor, ConnectionMode, Endpoint, ManagerId, SessionKey};
pub use protocol::ControlMessage;
pub use session::Session;
