//! Host roles and clipboard synchronization
//!
//! A device acts either as a client connected to one server or as a server
//! accepting many clients. [`SyncingManager`] keeps exactly one of those roles
//! alive and is what the rest of the application talks to.

pub mod client;
pub mod connector;
pub mod descriptor;
pub mod manager;
pub mod server;

use crate::discovery::PeerAddress;
use crate::protocol::ClipboardItem;
use crate::session::bluetooth::BluetoothTransport;
use crate::session::{DisconnectReason, SessionConfig};
use crate::DeviceIdentity;

pub use client::ClientManager;
pub use connector::{Backoff, Connector, ConnectorConfig};
pub use descriptor::ClientServer;
pub use manager::{HostOptions, HostRole, SyncEvent, SyncingManager};
pub use server::ServerManager;

/// Events from whichever host role is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    PeerDiscovered(PeerAddress),
    PeerLost(String),
    /// The peer passed authentication and may exchange clipboard data
    Connected { peer: String },
    Disconnected {
        peer: String,
        reason: DisconnectReason,
    },
    /// An unknown client completed the handshake and waits for a decision
    AuthRequest { peer: String, fingerprint: String },
    SyncRequest {
        from: String,
        items: Vec<ClipboardItem>,
    },
    Error(String),
}

/// What both roles need to open sessions
#[derive(Debug, Clone)]
pub struct HostContext {
    pub identity: DeviceIdentity,
    pub session: SessionConfig,
    pub bluetooth: Option<BluetoothTransport>,
}

impl HostContext {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            session: SessionConfig::default(),
            bluetooth: None,
        }
    }
}
