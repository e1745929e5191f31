//! Clipbridge Core - clipboard sync over LAN, Bluetooth and a WAN hub
//!
//! This library provides the transport, protocol and trust engine for
//! keeping a clipboard in sync between devices: a small binary packet
//! protocol carried over mutual TLS or Bluetooth, certificate trust stores
//! that gate every session, client and server host roles, and a relay hub
//! for devices that do not share a network.

pub mod clipboard;
pub mod crypto;
pub mod discovery;
pub mod hub;
pub mod prefs;
pub mod protocol;
pub mod service;
pub mod session;
pub mod sync;
pub mod trust;

mod error;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

pub use error::{Error, Result};

use crypto::{Certificate, PrivateKey};
use prefs::{Preferences, StoredIdentity};

/// Device identity: an RSA key and a self-signed certificate naming the device
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub name: String,
    pub private_key: PrivateKey,
    pub certificate: Certificate,
}

impl DeviceIdentity {
    /// Create a new device identity with generated keys
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let private_key = PrivateKey::generate()?;
        let certificate = Certificate::issue(&name, &private_key)?;
        Ok(Self {
            name,
            private_key,
            certificate,
        })
    }

    pub fn from_parts(name: String, private_key: PrivateKey, certificate: Certificate) -> Self {
        Self {
            name,
            private_key,
            certificate,
        }
    }

    /// Load the stored identity, or create and store one if there is none
    /// or it was issued for a different name
    pub fn load_or_generate(prefs: &dyn Preferences, name: &str) -> Result<Self> {
        if let Some(stored) = prefs.identity() {
            if stored.name == name {
                return Ok(Self {
                    name: stored.name,
                    private_key: PrivateKey::from_pem(&stored.private_key_pem)?,
                    certificate: Certificate::from_pem(&stored.certificate_pem)?,
                });
            }
            info!("device renamed from {} to {}, issuing a new certificate", stored.name, name);
        }

        let identity = Self::generate(name)?;
        prefs.set_identity(StoredIdentity {
            name: identity.name.clone(),
            private_key_pem: identity.private_key.to_pem()?,
            certificate_pem: identity.certificate.to_pem(),
        })?;
        Ok(identity)
    }

    /// Get the certificate fingerprint for display/verification
    pub fn fingerprint(&self) -> String {
        self.certificate.fingerprint()
    }
}

/// Configuration for the Clipbridge service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name advertised to peers and written into the certificate CN
    pub device_name: String,
    /// Port to listen on for incoming connections in the server role
    pub port: u16,
    /// mDNS service type
    pub service_type: String,
    /// Path to store persistent data (identity, trust stores, preferences)
    pub data_dir: PathBuf,
    /// WebSocket endpoint of the hub relay
    pub hub_url: String,
    pub session: session::SessionConfig,
    pub connector: sync::ConnectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            port: protocol::constants::DEFAULT_PORT,
            service_type: protocol::constants::SERVICE_TYPE.to_string(),
            data_dir: dirs_home().join(".clipbridge"),
            hub_url: protocol::constants::DEFAULT_HUB_URL.to_string(),
            session: session::SessionConfig::default(),
            connector: sync::ConnectorConfig::default(),
        }
    }
}

impl Config {
    /// Read `config.json` from `data_dir`; missing file or fields take defaults
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.json");
        let mut config: Config = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Config::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "clipbridge".to_string())
}

// Re-export key types for convenience
pub use discovery::{DiscoveryEvent, PeerAddress};
pub use hub::{Hub, HubEvent};
pub use protocol::{ClipboardItem, Packet};
pub use service::{ClipbridgeService, ServiceEvent};
pub use session::{DisconnectReason, Session};
pub use sync::{HostEvent, SyncEvent, SyncingManager};
pub use trust::{TrustScope, TrustStore};
