//! Peer discovery ports
//!
//! The protocol core only consumes [`DiscoveryEvent`]s from a [`Browser`] and
//! drives a [`Registrar`] to advertise itself. mDNS implements both for the
//! network transport; the in-memory versions back tests and embedding.

pub mod mdns;
pub mod memory;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc;

use crate::session::bluetooth::BluetoothAddress;
use crate::Result;

pub use mdns::MdnsDiscovery;
pub use memory::{MemoryBrowser, MemoryNetwork, MemoryRegistrar};

/// Transport-specific address of a resolved peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locator {
    Network(SocketAddr),
    Bluetooth(BluetoothAddress),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Network(addr) => write!(f, "{}", addr),
            Locator::Bluetooth(addr) => write!(f, "bt:{}", addr),
        }
    }
}

/// A resolved peer: its advertised name and where to reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub name: String,
    pub locator: Locator,
}

impl PeerAddress {
    pub fn network(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            locator: Locator::Network(addr),
        }
    }

    pub fn bluetooth(name: impl Into<String>, addr: BluetoothAddress) -> Self {
        Self {
            name: name.into(),
            locator: Locator::Bluetooth(addr),
        }
    }
}

/// Event from a browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ServiceFound(PeerAddress),
    ServiceLost(String),
}

/// Finds peers advertising the service
pub trait Browser: Send + Sync {
    /// Start browsing; events flow until `stop` is called or the receiver is dropped
    fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>>;
    fn stop(&self) -> Result<()>;
}

/// Advertises this device so browsers can find it
pub trait Registrar: Send + Sync {
    fn advertise(&self, name: &str, port: u16) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Get local IP addresses (non-loopback)
pub fn get_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();

    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if !iface.is_loopback() {
                ips.push(iface.ip());
            }
        }
    }

    ips
}
